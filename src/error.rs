//! Error types for the registry bridge.

use crate::errcode::{CodedError, CodedErrors};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Boxed error accepted by [`normalize`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while resolving, building or using a registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("configuration parse error: {0}")]
    Parse(String),

    #[error("no storage configuration provided")]
    MissingStorage,

    #[error("could not generate random bytes for HTTP secret: {0}")]
    Entropy(#[source] rand::Error),

    #[error("unknown storage backend: {0}")]
    UnknownBackend(String),

    #[error("storage backend {0} has no registered driver")]
    BackendUnavailable(String),

    #[error("unsupported logging formatter: {0:?}")]
    UnsupportedFormat(String),

    #[error("invalid image reference {reference}: {reason}")]
    MalformedReference { reference: String, reason: String },

    #[error("Docker reference {0} has neither a tag nor a digest")]
    NameOnlyReference(String),

    #[error("Docker references with both a tag and digest are currently not supported: {0}")]
    TagAndDigestConflict(String),

    #[error(transparent)]
    Registry(#[from] NormalizedError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upload not found: {0}")]
    UploadNotFound(String),

    #[error("registry instance has been shut down")]
    ShutDown,

    #[error("{operation} did not complete within {timeout:?}")]
    DeadlineExceeded {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("transport {0} has been deregistered")]
    Deregistered(String),

    #[error("unexpected response {status} for {method} {uri}")]
    UnexpectedResponse {
        method: String,
        uri: String,
        status: u16,
    },

    #[error("Internal inconsistency: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(BoxError),
}

/// Stable classification of [`RegistryError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Parse,
    MissingStorage,
    UnknownBackend,
    UnsupportedFormat,
    Entropy,
    MalformedReference,
    NameOnlyReference,
    TagAndDigestConflict,
    Registry,
    Aggregate,
    BackendUnavailable,
    Io,
    ShutDown,
    DeadlineExceeded,
    Deregistered,
    UnexpectedResponse,
    Internal,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Parse => "parse-error",
            ErrorKind::MissingStorage => "missing-storage",
            ErrorKind::UnknownBackend => "unknown-backend",
            ErrorKind::UnsupportedFormat => "unsupported-format",
            ErrorKind::Entropy => "entropy-error",
            ErrorKind::MalformedReference => "malformed-reference",
            ErrorKind::NameOnlyReference => "name-only-reference",
            ErrorKind::TagAndDigestConflict => "tag-and-digest-conflict",
            ErrorKind::Registry => "registry-error",
            ErrorKind::Aggregate => "aggregate-error",
            ErrorKind::BackendUnavailable => "backend-unavailable",
            ErrorKind::Io => "io-error",
            ErrorKind::ShutDown => "shut-down",
            ErrorKind::DeadlineExceeded => "deadline-exceeded",
            ErrorKind::Deregistered => "deregistered",
            ErrorKind::UnexpectedResponse => "unexpected-response",
            ErrorKind::Internal => "internal-inconsistency",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Parse(_) => ErrorKind::Parse,
            RegistryError::MissingStorage => ErrorKind::MissingStorage,
            RegistryError::Entropy(_) => ErrorKind::Entropy,
            RegistryError::UnknownBackend(_) => ErrorKind::UnknownBackend,
            RegistryError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            RegistryError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            RegistryError::MalformedReference { .. } => ErrorKind::MalformedReference,
            RegistryError::NameOnlyReference(_) => ErrorKind::NameOnlyReference,
            RegistryError::TagAndDigestConflict(_) => ErrorKind::TagAndDigestConflict,
            RegistryError::Registry(_) => ErrorKind::Registry,
            RegistryError::Aggregate(_) => ErrorKind::Aggregate,
            RegistryError::Io(_) | RegistryError::UploadNotFound(_) => ErrorKind::Io,
            RegistryError::ShutDown => ErrorKind::ShutDown,
            RegistryError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            RegistryError::Deregistered(_) => ErrorKind::Deregistered,
            RegistryError::UnexpectedResponse { .. } => ErrorKind::UnexpectedResponse,
            RegistryError::Internal(_) => ErrorKind::Internal,
            RegistryError::Other(_) => ErrorKind::Other,
        }
    }

    /// Only a failure to obtain secure randomness is fatal: without it no
    /// usable HTTP secret exists and the instance must not be built.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RegistryError::Entropy(_))
    }

    pub(crate) fn parse(message: impl fmt::Display) -> Self {
        RegistryError::Parse(message.to_string())
    }

    pub(crate) fn malformed(reference: &str, reason: impl Into<String>) -> Self {
        RegistryError::MalformedReference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_yaml::Error> for RegistryError {
    fn from(err: serde_yaml::Error) -> Self {
        RegistryError::Parse(err.to_string())
    }
}

/// A registry error reduced to a stable code, a message and an opaque detail.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{code}: {message}")]
pub struct NormalizedError {
    pub code: String,
    pub message: String,
    pub detail: Option<serde_json::Value>,
}

impl From<CodedError> for NormalizedError {
    fn from(err: CodedError) -> Self {
        Self {
            code: err.code.as_str().to_string(),
            message: err.message,
            detail: err.detail,
        }
    }
}

/// Several errors reported together.
#[derive(Error, Debug)]
pub struct AggregateError {
    pub members: Vec<RegistryError>,
}

impl AggregateError {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("registry errors: [")?;
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{member}")?;
        }
        f.write_str("]")
    }
}

/// Maps errors from the registry handler into this crate's taxonomy.
///
/// A [`CodedErrors`] collection becomes an [`AggregateError`] of normalized
/// members, a single [`CodedError`] becomes a [`NormalizedError`], an existing
/// [`RegistryError`] is returned as is and anything else passes through
/// untouched as [`RegistryError::Other`].
pub fn normalize(err: BoxError) -> RegistryError {
    let err = match err.downcast::<CodedErrors>() {
        Ok(errors) => {
            let members = errors
                .errors
                .into_iter()
                .map(|e| RegistryError::Registry(e.into()))
                .collect();
            return RegistryError::Aggregate(AggregateError { members });
        }
        Err(err) => err,
    };

    let err = match err.downcast::<CodedError>() {
        Ok(error) => return RegistryError::Registry((*error).into()),
        Err(err) => err,
    };

    match err.downcast::<RegistryError>() {
        Ok(error) => *error,
        Err(err) => RegistryError::Other(err),
    }
}

/// [`normalize`] lifted over a result; success maps to success.
pub fn normalize_result<T, E>(result: std::result::Result<T, E>) -> Result<T>
where
    E: Into<BoxError>,
{
    result.map_err(|e| normalize(e.into()))
}

/// True only for a normalized registry error carrying exactly `code`.
pub fn is_code(err: &RegistryError, code: &str) -> bool {
    match err {
        RegistryError::Registry(normalized) => normalized.code == code,
        _ => false,
    }
}
