//! Resource descriptors
//!
//! A [`ResourceDescriptor`] is the kind-agnostic description of an object the
//! reconciler should converge the cluster towards.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use regex_lite::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

/// Validation errors raised before any call reaches the control plane
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Unsupported kind: {0}")]
    UnsupportedKind(String),

    #[error("api_version must be in the format 'group/version', got {0:?}")]
    InvalidApiVersion(String),

    #[error("{kind} expects apiVersion {expected}, got {found}")]
    ApiVersionMismatch {
        kind: String,
        expected: String,
        found: String,
    },

    #[error("Namespace is required")]
    MissingNamespace,

    #[error("Resource name is required")]
    MissingName,

    #[error("Plural name is required for custom kind {0}")]
    MissingPlural(String),

    #[error("{0} spec must be a mapping")]
    InvalidSpec(String),

    #[error("Failed to encode resource: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Every kind the reconciler knows how to upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Deployment,
    Service,
    HorizontalPodAutoscaler,
    ServiceAccount,
    Secret,
    ConfigMap,
    Role,
    RoleBinding,
    ScaledObject,
    TriggerAuthentication,
    Package,
    Environment,
    Function,
    Gateway,
    VirtualService,
    ServiceMonitor,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 16] = [
        ResourceKind::Deployment,
        ResourceKind::Service,
        ResourceKind::HorizontalPodAutoscaler,
        ResourceKind::ServiceAccount,
        ResourceKind::Secret,
        ResourceKind::ConfigMap,
        ResourceKind::Role,
        ResourceKind::RoleBinding,
        ResourceKind::ScaledObject,
        ResourceKind::TriggerAuthentication,
        ResourceKind::Package,
        ResourceKind::Environment,
        ResourceKind::Function,
        ResourceKind::Gateway,
        ResourceKind::VirtualService,
        ResourceKind::ServiceMonitor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "Deployment",
            ResourceKind::Service => "Service",
            ResourceKind::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::Secret => "Secret",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Role => "Role",
            ResourceKind::RoleBinding => "RoleBinding",
            ResourceKind::ScaledObject => "ScaledObject",
            ResourceKind::TriggerAuthentication => "TriggerAuthentication",
            ResourceKind::Package => "Package",
            ResourceKind::Environment => "Environment",
            ResourceKind::Function => "Function",
            ResourceKind::Gateway => "Gateway",
            ResourceKind::VirtualService => "VirtualService",
            ResourceKind::ServiceMonitor => "ServiceMonitor",
        }
    }

    /// Whether the kind is served through the custom objects API
    pub fn is_custom(&self) -> bool {
        matches!(
            self,
            ResourceKind::ScaledObject
                | ResourceKind::TriggerAuthentication
                | ResourceKind::Package
                | ResourceKind::Environment
                | ResourceKind::Function
                | ResourceKind::Gateway
                | ResourceKind::VirtualService
                | ResourceKind::ServiceMonitor
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ResourceError::UnsupportedKind(s.to_string()))
    }
}

fn grouped_version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^/]+/v\w+$").expect("valid apiVersion pattern"))
}

fn core_version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^v\w+$").expect("valid core version pattern"))
}

/// An apiVersion split into API group and version.
///
/// The core API group is written as a bare version (`v1`) and has an empty group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApiVersion {
    group: String,
    version: String,
}

impl ApiVersion {
    pub fn parse(value: &str) -> Result<Self, ResourceError> {
        if core_version_pattern().is_match(value) {
            return Ok(Self {
                group: String::new(),
                version: value.to_string(),
            });
        }

        if !grouped_version_pattern().is_match(value) {
            return Err(ResourceError::InvalidApiVersion(value.to_string()));
        }

        match value.split_once('/') {
            Some((group, version)) => Ok(Self {
                group: group.to_string(),
                version: version.to_string(),
            }),
            None => Err(ResourceError::InvalidApiVersion(value.to_string())),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_core(&self) -> bool {
        self.group.is_empty()
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_core() {
            f.write_str(&self.version)
        } else {
            write!(f, "{}/{}", self.group, self.version)
        }
    }
}

impl FromStr for ApiVersion {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Where the descriptor's spec lands in the emitted document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLayout {
    /// Under a `spec` field
    Nested,
    /// Spliced into the top level (`data`, `rules`, `subjects`, ...)
    Inline,
}

/// Desired state of a single namespaced object
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDescriptor {
    pub kind: String,
    pub api_version: ApiVersion,
    /// Plural resource name, required for custom kinds
    pub plural: String,
    pub namespace: Option<String>,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub spec: Value,
    pub status: Option<Value>,
}

impl ResourceDescriptor {
    /// Create a descriptor with an empty spec
    pub fn new(
        kind: impl Into<String>,
        api_version: &str,
        name: impl Into<String>,
    ) -> Result<Self, ResourceError> {
        Ok(Self {
            kind: kind.into(),
            api_version: ApiVersion::parse(api_version)?,
            plural: String::new(),
            namespace: None,
            name: name.into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            spec: Value::Object(Map::new()),
            status: None,
        })
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn plural(mut self, plural: impl Into<String>) -> Self {
        self.plural = plural.into();
        self
    }

    pub fn spec(mut self, spec: Value) -> Self {
        self.spec = spec;
        self
    }

    pub fn status(mut self, status: Value) -> Self {
        self.status = Some(status);
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// The target namespace, which every reconciled kind requires
    pub fn require_namespace(&self) -> Result<&str, ResourceError> {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => Ok(ns),
            _ => Err(ResourceError::MissingNamespace),
        }
    }

    /// Check everything that can be checked without the cluster and resolve the kind
    pub fn validate(&self) -> Result<ResourceKind, ResourceError> {
        let kind: ResourceKind = self.kind.parse()?;
        if kind.is_custom() && self.api_version.is_core() {
            return Err(ResourceError::InvalidApiVersion(self.api_version.to_string()));
        }
        self.require_namespace()?;
        if self.name.is_empty() {
            return Err(ResourceError::MissingName);
        }
        if !(self.spec.is_object() || self.spec.is_null()) {
            return Err(ResourceError::InvalidSpec(self.kind.clone()));
        }
        if kind.is_custom() && self.plural.is_empty() {
            return Err(ResourceError::MissingPlural(self.kind.clone()));
        }
        Ok(kind)
    }

    pub fn object_meta(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.clone()),
            namespace: self.namespace.clone(),
            labels: (!self.labels.is_empty()).then(|| self.labels.clone()),
            annotations: (!self.annotations.is_empty()).then(|| self.annotations.clone()),
            ..Default::default()
        }
    }

    /// Render the full object document
    pub fn to_document(&self, layout: BodyLayout) -> Result<Value, ResourceError> {
        let mut doc = Map::new();
        doc.insert("apiVersion".into(), Value::String(self.api_version.to_string()));
        doc.insert("kind".into(), Value::String(self.kind.clone()));
        doc.insert("metadata".into(), serde_json::to_value(self.object_meta())?);

        match (layout, &self.spec) {
            (_, Value::Null) => {}
            (BodyLayout::Nested, spec) => {
                doc.insert("spec".into(), spec.clone());
            }
            (BodyLayout::Inline, Value::Object(fields)) => {
                for (key, value) in fields {
                    if !matches!(key.as_str(), "apiVersion" | "kind" | "metadata") {
                        doc.insert(key.clone(), value.clone());
                    }
                }
            }
            (BodyLayout::Inline, _) => return Err(ResourceError::InvalidSpec(self.kind.clone())),
        }

        if let Some(status) = &self.status {
            doc.insert("status".into(), status.clone());
        }

        Ok(Value::Object(doc))
    }
}
