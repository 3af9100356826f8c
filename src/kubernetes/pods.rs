//! Pod resolution
//!
//! Turns a label selector into the single ready pod a tunnel should target.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

use super::registry::ApiError;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("No pods found matching {selector}")]
    NotFound { selector: String },

    #[error("Found pods in {} namespaces, {}. Please specify a namespace.", .namespaces.len(), .namespaces.join(", "))]
    Ambiguous { namespaces: Vec<String> },

    #[error("No ready pods found matching {selector}")]
    NotReady { selector: String },

    #[error("Failed to list pods: {0}")]
    Api(#[from] ApiError),
}

/// Label selector, optionally scoped to a namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSelector {
    pub label_selector: String,
    pub namespace: Option<String>,
}

impl PodSelector {
    pub fn new(label_selector: impl Into<String>) -> Self {
        Self {
            label_selector: label_selector.into(),
            namespace: None,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

impl fmt::Display for PodSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "'{}' in {}", self.label_selector, namespace),
            None => write!(f, "'{}'", self.label_selector),
        }
    }
}

/// A pod picked as a port-forward target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPod {
    pub name: String,
    pub namespace: String,
    pub ready: bool,
}

/// Lists pods matching a selector
#[async_trait]
pub trait PodSource: Send + Sync {
    /// Pods in listing order. Without a namespace the listing spans all namespaces.
    async fn list_pods(&self, selector: &PodSelector) -> Result<Vec<Pod>, ApiError>;
}

/// Whether the pod reports a `Ready` condition with status `True`
pub fn is_ready_pod(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

pub struct PodResolver<S> {
    source: S,
}

impl<S: PodSource> PodResolver<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Resolve `selector` to exactly one ready pod
    pub async fn resolve(&self, selector: &PodSelector) -> Result<ResolvedPod, ResolveError> {
        let pods = self.source.list_pods(selector).await.map_err(|e| {
            tracing::error!("Failed to list pods matching {}: {}", selector, e);
            e
        })?;

        if pods.is_empty() {
            tracing::error!("No pods found matching {}", selector);
            return Err(ResolveError::NotFound {
                selector: selector.to_string(),
            });
        }

        let mut namespaces: Vec<String> = Vec::new();
        for pod in &pods {
            let namespace = pod_namespace(pod, selector);
            if !namespaces.iter().any(|n| n == namespace) {
                namespaces.push(namespace.to_string());
            }
        }

        let namespace = match &selector.namespace {
            Some(namespace) => namespace.clone(),
            None if namespaces.len() > 1 => {
                tracing::error!(
                    "Pods matching {} span namespaces {:?}",
                    selector,
                    namespaces
                );
                return Err(ResolveError::Ambiguous { namespaces });
            }
            None => namespaces.remove(0),
        };

        let ready = pods
            .iter()
            .filter(|pod| pod_namespace(pod, selector) == namespace)
            .filter(|pod| is_ready_pod(pod))
            .find_map(|pod| pod.metadata.name.clone());

        match ready {
            Some(name) => {
                tracing::debug!("Resolved {} to pod {}/{}", selector, namespace, name);
                Ok(ResolvedPod {
                    name,
                    namespace,
                    ready: true,
                })
            }
            None => {
                tracing::error!("No ready pods found matching {}", selector);
                Err(ResolveError::NotReady {
                    selector: selector.to_string(),
                })
            }
        }
    }
}

fn pod_namespace<'a>(pod: &'a Pod, selector: &'a PodSelector) -> &'a str {
    pod.metadata
        .namespace
        .as_deref()
        .or(selector.namespace.as_deref())
        .unwrap_or("default")
}
