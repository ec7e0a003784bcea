//! Registry configuration: typed document, resolution and secret injection.

use crate::error::{RegistryError, Result};
use crate::overlay::Overlay;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Number of random bytes behind a generated HTTP secret.
pub const RANDOM_SECRET_SIZE: usize = 32;

/// Storage sections that configure the registry rather than select a back-end.
pub const STORAGE_SECTIONS: [&str; 5] = ["maintenance", "cache", "delete", "redirect", "tag"];

/// Development profile used whenever no document is supplied.
pub const DEFAULT_CONFIG: &str = r#"version: 0.1
log:
  level: debug
  fields:
    service: registry
    environment: development
  hooks:
    - type: mail
      disabled: true
      levels:
        - panic
      options:
        smtp:
          addr: mail.example.com:25
          username: mailuser
          password: password
          insecure: true
        from: sender@example.com
        to:
          - errors@example.com
storage:
  delete:
    enabled: true
  cache:
    blobdescriptor: redis
  filesystem:
    rootdirectory: /var/lib/registry
  maintenance:
    uploadpurging:
      enabled: false
http:
  addr: ":5000"
  debug:
    addr: ":5001"
    prometheus:
      enabled: true
      path: /metrics
  headers:
    X-Content-Type-Options: [nosniff]
redis:
  addr: localhost:6379
  pool:
    maxidle: 16
    maxactive: 64
    idletimeout: 300s
  dialtimeout: 10ms
  readtimeout: 10ms
  writetimeout: 10ms
notifications:
  events:
    includereferences: true
  endpoints:
    - name: local-5003
      url: http://localhost:5003/callback
      headers:
        Authorization: ["Bearer <an example token>"]
      timeout: 1s
      threshold: 10
      backoff: 1s
      disabled: true
    - name: local-8083
      url: http://localhost:8083/callback
      timeout: 1s
      threshold: 10
      backoff: 1s
      disabled: true
health:
  storagedriver:
    enabled: true
    interval: 10s
    threshold: 3
"#;

/// Back-end specific parameters.
pub type Parameters = BTreeMap<String, Value>;

/// A fully resolved registry configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Configuration {
    pub version: Version,

    /// Deprecated single-field log level, folded into `log.level` on load.
    #[serde(default, deserialize_with = "scalar_string")]
    pub loglevel: String,

    #[serde(default)]
    pub log: Log,

    #[serde(default)]
    pub storage: Storage,

    #[serde(default)]
    pub http: Http,

    #[serde(default)]
    pub auth: Option<Value>,
    #[serde(default)]
    pub middleware: Option<Value>,
    #[serde(default)]
    pub reporting: Option<Value>,
    #[serde(default)]
    pub notifications: Option<Value>,
    #[serde(default)]
    pub redis: Option<Value>,
    #[serde(default)]
    pub health: Option<Value>,
    #[serde(default)]
    pub proxy: Option<Value>,
    #[serde(default)]
    pub validation: Option<Value>,
    #[serde(default)]
    pub policy: Option<Value>,
    #[serde(default)]
    pub catalog: Option<Value>,
}

/// `MAJOR.MINOR` schema version tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version(String);

impl Version {
    pub fn new(major: u32, minor: u32) -> Self {
        Self(format!("{major}.{minor}"))
    }

    pub fn major_minor(&self) -> Option<(u32, u32)> {
        let (major, minor) = self.0.split_once('.')?;
        Some((major.parse().ok()?, minor.parse().ok()?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        scalar_string(deserializer).map(Version)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Log {
    #[serde(default)]
    pub accesslog: AccessLog,
    #[serde(default, deserialize_with = "scalar_string")]
    pub level: String,
    /// One of `text`, `json` or `logstash`; empty means `text`.
    #[serde(default, deserialize_with = "scalar_string")]
    pub formatter: String,
    #[serde(default, deserialize_with = "nullable")]
    pub fields: BTreeMap<String, Value>,
    #[serde(default, deserialize_with = "nullable")]
    pub hooks: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AccessLog {
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Http {
    #[serde(default, deserialize_with = "scalar_string")]
    pub addr: String,
    #[serde(default, deserialize_with = "scalar_string")]
    pub net: String,
    #[serde(default, deserialize_with = "scalar_string")]
    pub host: String,
    #[serde(default, deserialize_with = "scalar_string")]
    pub prefix: String,
    /// Key for the HMAC tokens handed out by the registry.
    #[serde(default, deserialize_with = "scalar_string")]
    pub secret: String,
    #[serde(default)]
    pub relativeurls: bool,
    #[serde(default)]
    pub draintimeout: Option<Value>,
    #[serde(default)]
    pub tls: Option<Value>,
    #[serde(default, deserialize_with = "headers")]
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub debug: Option<Value>,
    #[serde(default)]
    pub http2: Option<Value>,
}

/// Storage section: at most one back-end plus shared sections such as `delete`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Storage(BTreeMap<String, Parameters>);

impl Storage {
    /// Name of the configured back-end, if any.
    pub fn storage_type(&self) -> Option<&str> {
        self.0
            .keys()
            .map(String::as_str)
            .find(|k| !STORAGE_SECTIONS.contains(k))
    }

    /// Parameters of the configured back-end.
    pub fn parameters(&self) -> Option<&Parameters> {
        self.storage_type().and_then(|t| self.0.get(t))
    }

    pub fn section(&self, name: &str) -> Option<&Parameters> {
        self.0.get(name)
    }

    pub fn delete_enabled(&self) -> bool {
        self.section("delete")
            .and_then(|p| p.get("enabled"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn from_value(value: Value) -> std::result::Result<Self, String> {
        let mapping = match value {
            Value::Null => return Ok(Self::default()),
            Value::String(name) => {
                return Ok(Self(BTreeMap::from([(name, Parameters::new())])));
            }
            Value::Mapping(mapping) => mapping,
            other => return Err(format!("storage must be a mapping, found {other:?}")),
        };

        let mut storage = BTreeMap::new();
        for (key, params) in mapping {
            match key {
                Value::String(key) => storage.insert(key, parameters(params)?),
                other => return Err(format!("storage keys must be strings, found {other:?}")),
            };
        }

        let backends: Vec<&str> = storage
            .keys()
            .map(String::as_str)
            .filter(|k| !STORAGE_SECTIONS.contains(k))
            .collect();
        if backends.len() > 1 {
            return Err(format!(
                "must provide exactly one storage type. Provided: {}",
                backends.join(", ")
            ));
        }
        Ok(Self(storage))
    }
}

impl<'de> Deserialize<'de> for Storage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Storage::from_value(Value::deserialize(deserializer)?).map_err(de::Error::custom)
    }
}

fn parameters(value: Value) -> std::result::Result<Parameters, String> {
    match value {
        Value::Null => Ok(Parameters::new()),
        Value::Mapping(mapping) => mapping
            .into_iter()
            .map(|(k, v)| match k {
                Value::String(k) => Ok((k, v)),
                Value::Bool(b) => Ok((b.to_string(), v)),
                Value::Number(n) => Ok((n.to_string(), v)),
                other => Err(format!("parameter keys must be scalars, found {other:?}")),
            })
            .collect(),
        other => Err(format!("storage parameters must be a mapping, found {other:?}")),
    }
}

impl Configuration {
    /// Resolves `document` (or [`DEFAULT_CONFIG`] when empty) with `overlay`
    /// applied on top, then injects a random HTTP secret if none is set.
    pub fn resolve<I, S>(document: &str, overlay: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let overlay = Overlay::parse(overlay)?;
        let mut config = Self::parse(document, &overlay)?;
        config.configure_secret()?;
        Ok(config)
    }

    /// Parses and migrates a document without touching the secret.
    pub fn parse(document: &str, overlay: &Overlay) -> Result<Self> {
        let document = if document.trim().is_empty() {
            DEFAULT_CONFIG
        } else {
            document
        };

        let mut root: Value = serde_yaml::from_str(document)?;
        if root.is_null() {
            root = Value::Mapping(Mapping::new());
        }
        if !root.is_mapping() {
            return Err(RegistryError::parse("configuration document must be a mapping"));
        }
        overlay.apply(&mut root);

        let version = match root.get("version") {
            None | Some(Value::Null) => {
                return Err(RegistryError::parse(
                    "please specify the configuration version",
                ))
            }
            Some(v) => Version::deserialize(v.clone())?,
        };

        match version.major_minor() {
            Some((0, 1)) => {
                let mut config: Configuration = serde_yaml::from_value(root)?;
                config.migrate_v0_1()?;
                Ok(config)
            }
            _ => Err(RegistryError::parse(format!(
                "unsupported configuration version {version}"
            ))),
        }
    }

    fn migrate_v0_1(&mut self) -> Result<()> {
        if self.log.level.is_empty() {
            self.log.level = if self.loglevel.is_empty() {
                "info".to_string()
            } else {
                self.loglevel.clone()
            };
        }
        self.loglevel.clear();

        if self.storage.storage_type().is_none() {
            return Err(RegistryError::MissingStorage);
        }
        Ok(())
    }

    /// Fills an empty HTTP secret with fresh random bytes. An existing secret
    /// is never replaced.
    pub fn configure_secret(&mut self) -> Result<()> {
        if self.http.secret.is_empty() {
            self.http.secret = generate_secret()?;
            tracing::debug!("generated random HTTP secret");
        }
        Ok(())
    }

    /// The configured back-end name. Resolution guarantees one exists.
    pub fn storage_type(&self) -> &str {
        self.storage.storage_type().unwrap_or_default()
    }
}

/// Hex encoding of [`RANDOM_SECRET_SIZE`] bytes from the operating system.
pub fn generate_secret() -> Result<String> {
    let mut bytes = [0u8; RANDOM_SECRET_SIZE];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(RegistryError::Entropy)?;
    Ok(hex::encode(bytes))
}

fn scalar_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("expected a scalar, found {other:?}"))),
    }
}

fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn headers<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, Vec<String>>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    let raw: Option<BTreeMap<String, OneOrMany>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(name, values)| match values {
            OneOrMany::One(value) => (name, vec![value]),
            OneOrMany::Many(values) => (name, values),
        })
        .collect())
}
