//! Kubeconfig document model
//!
//! A kubeconfig is kept as an untyped mapping so that keys this crate does not
//! know about survive a load/merge/save cycle untouched.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Section holding cluster entries
pub const CLUSTERS: &str = "clusters";
/// Section holding user entries
pub const USERS: &str = "users";
/// Section holding context entries
pub const CONTEXTS: &str = "contexts";
/// Scalar naming the active context
pub const CURRENT_CONTEXT: &str = "current-context";

/// Sections whose entries are identified by their `name` field, in merge order
pub const IDENTITY_SECTIONS: [&str; 3] = [CLUSTERS, USERS, CONTEXTS];

/// Errors that can occur while loading or saving a kubeconfig document
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Failed to read kubeconfig: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse kubeconfig: {0}")]
    ParseError(String),

    #[error("Kubeconfig root must be a mapping, found {0}")]
    NotAMapping(&'static str),

    #[error("Failed to write kubeconfig {path}: {reason}")]
    WriteError { path: String, reason: String },
}

/// A kubeconfig document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KubeconfigDocument {
    root: Map<String, Value>,
}

impl KubeconfigDocument {
    /// Create an empty document
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a document from a JSON value. `null` yields an empty document.
    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        match value {
            Value::Object(root) => Ok(Self { root }),
            Value::Null => Ok(Self::default()),
            other => Err(DocumentError::NotAMapping(value_kind(&other))),
        }
    }

    /// Parse kubeconfig YAML content
    pub fn from_yaml_str(content: &str) -> Result<Self, DocumentError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: Value = serde_yaml_ng::from_str(content)
            .map_err(|e| DocumentError::ParseError(e.to_string()))?;
        Self::from_value(value)
    }

    /// Parse kubeconfig JSON content
    pub fn from_json_str(content: &str) -> Result<Self, DocumentError> {
        let value: Value = serde_json::from_str(content)
            .map_err(|e| DocumentError::ParseError(e.to_string()))?;
        Self::from_value(value)
    }

    /// Load a document from a YAML file
    pub fn load(path: &Path) -> Result<Self, DocumentError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load a document, treating a missing file as an empty document
    pub fn load_or_default(path: &Path) -> Result<Self, DocumentError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_yaml_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Kubeconfig {:?} not found, starting from an empty document", path);
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.root.insert(key.into(), value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.root.contains_key(key)
    }

    /// Mutable slot for `key`, inserting `null` when absent
    pub(crate) fn slot(&mut self, key: &str) -> &mut Value {
        self.root.entry(key).or_insert(Value::Null)
    }

    /// Name of the active context, if set
    pub fn current_context(&self) -> Option<&str> {
        self.root.get(CURRENT_CONTEXT).and_then(Value::as_str)
    }

    /// Entries of a list section. Missing or non-list sections yield nothing.
    pub fn entries(&self, section: &str) -> &[Value] {
        self.root
            .get(section)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Find an entry by name within a list section
    pub fn entry(&self, section: &str, name: &str) -> Option<&Value> {
        self.entries(section)
            .iter()
            .find(|entry| entry_name(entry) == Some(name))
    }

    /// Top-level keys in emission order
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.root.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// The document with its top-level keys sorted
    pub fn sorted(&self) -> BTreeMap<&str, &Value> {
        self.root.iter().map(|(k, v)| (k.as_str(), v)).collect()
    }

    /// Convert into a JSON value
    pub fn into_value(self) -> Value {
        Value::Object(self.root)
    }

    /// Render as YAML with sorted top-level keys
    pub fn to_yaml_string(&self) -> Result<String, DocumentError> {
        serde_yaml_ng::to_string(&self.sorted()).map_err(|e| DocumentError::WriteError {
            path: "<memory>".to_string(),
            reason: e.to_string(),
        })
    }

    /// Write the document as YAML via a temporary file in the destination
    /// directory renamed over `path`.
    pub fn write_atomic(&self, path: &Path) -> Result<(), DocumentError> {
        let content = self.to_yaml_string()?;
        let write_error = |reason: String| DocumentError::WriteError {
            path: path.display().to_string(),
            reason,
        };

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = tempfile::NamedTempFile::new_in(parent)?;
        file.write_all(content.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| write_error(e.error.to_string()))?;

        tracing::info!("Saved kubeconfig to {:?}", path);
        Ok(())
    }
}

/// Value of an entry's `name` field, when it is a string
pub fn entry_name(entry: &Value) -> Option<&str> {
    entry.get("name").and_then(Value::as_str)
}

/// An entry's `name` field of any type. Entries without one have no identity.
pub fn entry_identity(entry: &Value) -> Option<&Value> {
    entry.get("name")
}

pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}
