//! Per-instance logging context.
//!
//! Every registry instance gets its own [`Dispatch`] and root span, so
//! instances with different levels or formats can live in one process without
//! touching the global default subscriber.

use crate::config::Log;
use crate::error::{RegistryError, Result};
use serde_yaml::Value;
use std::future::Future;
use std::str::FromStr;
use tracing::instrument::{Instrument, WithSubscriber};
use tracing::{Dispatch, Span};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Output format of an instance's log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
    /// JSON with event fields flattened to the top level.
    Logstash,
}

impl FromStr for LogFormat {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            "logstash" => Ok(LogFormat::Logstash),
            other => Err(RegistryError::UnsupportedFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingContext {
    dispatch: Dispatch,
    span: Span,
    format: LogFormat,
    level: String,
}

impl LoggingContext {
    pub fn from_config(log: &Log, instance: &str) -> Result<Self> {
        let format: LogFormat = log.formatter.parse()?;
        let (filter, level, level_error) = level_filter(&log.level);

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);
        let dispatch = match format {
            LogFormat::Text => Dispatch::new(builder.finish()),
            LogFormat::Json => Dispatch::new(builder.json().finish()),
            LogFormat::Logstash => Dispatch::new(
                builder
                    .json()
                    .flatten_event(true)
                    .with_current_span(false)
                    .finish(),
            ),
        };

        let fields = render_fields(log);
        let span = tracing::dispatcher::with_default(&dispatch, || {
            let span = tracing::info_span!(
                "registry",
                version = env!("CARGO_PKG_VERSION"),
                instance = %instance,
                fields = tracing::field::Empty,
            );
            if !fields.is_empty() {
                span.record("fields", fields.as_str());
            }
            span.in_scope(|| {
                if let Some(err) = &level_error {
                    tracing::warn!(
                        level = %log.level,
                        error = %err,
                        "error parsing log level, using \"info\""
                    );
                }
                if !log.formatter.is_empty() {
                    tracing::debug!(formatter = %log.formatter, "using logging formatter");
                }
            });
            span
        });

        Ok(Self {
            dispatch,
            span,
            format,
            level,
        })
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    /// Effective level directive after fallback.
    pub fn level(&self) -> &str {
        &self.level
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Runs `fut` inside this instance's span and subscriber.
    pub fn scope<F: Future>(&self, fut: F) -> impl Future<Output = F::Output> {
        fut.instrument(self.span.clone())
            .with_subscriber(self.dispatch.clone())
    }

    /// Runs `f` synchronously inside this instance's span and subscriber.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, || self.span.in_scope(f))
    }
}

/// The filter for `level`, its effective name, and the parse error when the
/// level fell back to `info`.
fn level_filter(level: &str) -> (EnvFilter, String, Option<String>) {
    let level = match level.to_ascii_lowercase().as_str() {
        "" => "info".to_string(),
        "panic" | "fatal" => "error".to_string(),
        other => other.to_string(),
    };
    match LevelFilter::from_str(&level) {
        Ok(filter) => (EnvFilter::default().add_directive(filter.into()), level, None),
        Err(err) => (
            EnvFilter::default().add_directive(LevelFilter::INFO.into()),
            "info".to_string(),
            Some(err.to_string()),
        ),
    }
}

fn render_fields(log: &Log) -> String {
    log.fields
        .iter()
        .map(|(key, value)| format!("{key}={}", render_value(value)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
