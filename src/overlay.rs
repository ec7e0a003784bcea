//! Environment-style overrides applied on top of a configuration document.
//!
//! `REGISTRY_STORAGE_S3_BUCKET=b` addresses `storage.s3.bucket` in the parsed
//! document tree. Overrides are applied to the tree itself; the process
//! environment is never read or written while resolving.

use crate::error::{RegistryError, Result};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;

/// Prefix every override name must carry.
pub const ENV_PREFIX: &str = "REGISTRY";

/// An ordered set of `NAME=VALUE` overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overlay {
    // Sorted by name so a section is always assigned before its children.
    entries: BTreeMap<String, String>,
}

impl Overlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `NAME=VALUE` assignments. Later assignments to the same name win.
    /// Names outside the `REGISTRY_` namespace are ignored.
    pub fn parse<I, S>(assignments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overlay = Self::new();
        for assignment in assignments {
            let assignment = assignment.as_ref();
            let (name, value) = assignment.split_once('=').ok_or_else(|| {
                RegistryError::parse(format!("overlay entry {assignment:?} is not NAME=VALUE"))
            })?;
            overlay.set(name, value);
        }
        Ok(overlay)
    }

    /// Collects the `REGISTRY_*` variables of the current process environment.
    pub fn from_env() -> Self {
        let mut overlay = Self::new();
        for (name, value) in std::env::vars() {
            overlay.set(&name, &value);
        }
        overlay
    }

    pub fn set(&mut self, name: &str, value: &str) {
        if path_of(name).is_some() {
            self.entries.insert(name.to_string(), value.to_string());
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes every override into `root`, creating intermediate sections.
    pub fn apply(&self, root: &mut Value) {
        for (name, raw) in &self.entries {
            let Some(path) = path_of(name) else {
                continue;
            };
            tracing::trace!(name = %name, "applying configuration override");

            let payload = match path.as_slice() {
                [section] if section == "storage" => storage_selector(raw),
                _ => scalar(raw),
            };
            assign(root, &path, payload);
        }
    }
}

fn path_of(name: &str) -> Option<Vec<String>> {
    let rest = name.strip_prefix(ENV_PREFIX)?.strip_prefix('_')?;
    let path: Vec<String> = rest.split('_').map(str::to_ascii_lowercase).collect();
    if path.iter().any(String::is_empty) {
        return None;
    }
    Some(path)
}

fn assign(node: &mut Value, path: &[String], payload: Value) {
    let Some((head, rest)) = path.split_first() else {
        *node = payload;
        return;
    };

    if !node.is_mapping() {
        *node = Value::Mapping(Mapping::new());
    }
    let Value::Mapping(map) = node else {
        return;
    };

    let key = map
        .keys()
        .find(|k| matches!(k, Value::String(s) if s.eq_ignore_ascii_case(head)))
        .cloned()
        .unwrap_or_else(|| Value::String(head.clone()));

    if !map.contains_key(&key) {
        map.insert(key.clone(), Value::Null);
    }
    if let Some(child) = map.get_mut(&key) {
        assign(child, rest, payload);
    }
}

/// A bare back-end name selects that back-end with no parameters.
fn storage_selector(raw: &str) -> Value {
    match scalar(raw) {
        Value::String(name) => {
            let mut backend = Mapping::new();
            backend.insert(Value::String(name), Value::Mapping(Mapping::new()));
            Value::Mapping(backend)
        }
        other => other,
    }
}

/// Interprets an override value as YAML, keeping the literal text for numbers
/// whose canonical rendering would differ from it.
fn scalar(raw: &str) -> Value {
    match serde_yaml::from_str::<Value>(raw) {
        Ok(Value::Number(n)) if n.to_string() != raw.trim() => Value::String(raw.to_string()),
        Ok(value) => value,
        Err(_) => Value::String(raw.to_string()),
    }
}
