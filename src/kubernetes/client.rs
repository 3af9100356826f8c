//! Kubernetes API client
//!
//! Wraps the kube crate: credential loading, pod listing and port-forward
//! streams for tunnels, namespace creation, log tailing and custom objects.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::{
    api::{Api, DeleteParams, ListParams, LogParams, ObjectMeta, PostParams},
    core::{ApiResource, DynamicObject},
    Client, Config,
};
use thiserror::Error;

use super::pods::{PodSelector, PodSource, ResolvedPod};
use super::port_forward::{
    DuplexStream, PodStreamOpener, PortForwarder, SplitStream, TunnelError, TunnelHandle,
};
use super::reconcile::Reconciler;
use super::registry::ApiError;
use crate::settings::TunnelSettings;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to infer config: {0}")]
    InferError(#[from] kube::config::InferConfigError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Failed to read logs: {0}")]
    LogError(#[from] io::Error),
}

impl From<kube::Error> for ClientError {
    fn from(err: kube::Error) -> Self {
        ClientError::Api(err.into())
    }
}

/// Install the rustls crypto provider. Safe to call more than once.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Kubernetes API client
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    default_namespace: String,
}

impl KubeClient {
    /// Create a new client using the default kubeconfig and current context
    pub async fn new() -> Result<Self, ClientError> {
        install_crypto_provider();
        let config = Config::infer().await?;
        let default_namespace = config.default_namespace.clone();
        let client = Client::try_from(config)?;
        Ok(Self {
            client,
            default_namespace,
        })
    }

    /// Load credentials once at startup. `None` means run unauthenticated.
    pub async fn try_init() -> Option<Self> {
        let start = Instant::now();
        match Self::new().await {
            Ok(client) => {
                tracing::info!("K8s client created in {:?}", start.elapsed());
                Some(client)
            }
            Err(e) => {
                tracing::debug!("No Kubernetes credentials loaded: {}", e);
                None
            }
        }
    }

    pub fn from_client(client: Client, default_namespace: impl Into<String>) -> Self {
        Self {
            client,
            default_namespace: default_namespace.into(),
        }
    }

    /// Namespace of the loaded context
    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    /// Get the raw kube client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::for_client(self.client.clone())
    }

    pub fn port_forwarder(&self, settings: TunnelSettings) -> PortForwarder<KubeClient> {
        PortForwarder::new(self.clone(), Arc::new(self.clone()), settings)
    }

    /// Forward a local port to `container_port` of the ready pod matching `selector`
    pub async fn open_tunnel(
        &self,
        selector: &PodSelector,
        container_port: u16,
        settings: TunnelSettings,
    ) -> Result<TunnelHandle, TunnelError> {
        self.port_forwarder(settings)
            .open_tunnel(selector, container_port)
            .await
    }

    /// Create a namespace. An existing namespace is not an error.
    pub async fn create_namespace(&self, name: &str) -> Result<(), ClientError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        match namespaces.create(&PostParams::default(), &namespace).await {
            Ok(_) => {
                tracing::info!("Namespace {} created.", name);
                Ok(())
            }
            Err(e) => {
                let err = ApiError::from(e);
                if err.is_conflict() {
                    tracing::info!("Namespace {} already exists.", name);
                    return Ok(());
                }
                tracing::error!("Failed to create namespace {}: {}", name, err);
                Err(err.into())
            }
        }
    }

    /// Wait for the pod to run, then follow its log into the tracing output.
    ///
    /// Returns without following when the pod has already finished.
    pub async fn tail_logs(&self, namespace: &str, pod: &str) -> Result<(), ClientError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        loop {
            let phase = pods
                .get(pod)
                .await?
                .status
                .and_then(|s| s.phase)
                .unwrap_or_else(|| "Unknown".to_string());

            match phase.as_str() {
                "Running" => break,
                "Failed" | "Succeeded" => {
                    tracing::info!("Pod {}/{} already {}", namespace, pod, phase);
                    return Ok(());
                }
                _ => {
                    tracing::debug!("Pod {}/{} is {}, waiting", namespace, pod, phase);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        let params = LogParams {
            follow: true,
            ..Default::default()
        };
        let mut lines = Box::pin(pods.log_stream(pod, &params).await?.lines());
        while let Some(line) = lines.try_next().await? {
            tracing::info!("[{}] {}", pod, line);
        }

        tracing::debug!("Log stream for {}/{} ended", namespace, pod);
        Ok(())
    }

    /// List custom objects of one resource type in a namespace
    pub async fn list_custom_objects(
        &self,
        resource: &ApiResource,
        namespace: &str,
    ) -> Result<Vec<DynamicObject>, ClientError> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, resource);
        let list = api.list(&ListParams::default()).await?;
        tracing::debug!(
            "Listed {} {} in {}",
            list.items.len(),
            resource.plural,
            namespace
        );
        Ok(list.items)
    }

    pub async fn delete_custom_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, resource);
        api.delete(name, &DeleteParams::default()).await.map_err(|e| {
            tracing::error!("Failed to delete {} {}/{}: {}", resource.kind, namespace, name, e);
            ClientError::from(e)
        })?;
        tracing::info!("{} '{}' deleted.", resource.kind, name);
        Ok(())
    }
}

#[async_trait]
impl PodSource for KubeClient {
    async fn list_pods(&self, selector: &PodSelector) -> Result<Vec<Pod>, ApiError> {
        let start = Instant::now();
        let pods: Api<Pod> = match &selector.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };
        let list = pods
            .list(&ListParams::default().labels(&selector.label_selector))
            .await?;
        tracing::debug!("list_pods({}) API call took {:?}", selector, start.elapsed());
        Ok(list.items)
    }
}

#[async_trait]
impl PodStreamOpener for KubeClient {
    async fn open_pod_stream(
        &self,
        pod: &ResolvedPod,
        container_port: u16,
    ) -> Result<Arc<dyn DuplexStream>, TunnelError> {
        let stream_error = |reason: String| TunnelError::StreamOpen {
            pod: format!("{}/{}", pod.namespace, pod.name),
            port: container_port,
            reason,
        };

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let mut forwarder = pods
            .portforward(&pod.name, &[container_port])
            .await
            .map_err(|e| stream_error(e.to_string()))?;
        let stream = forwarder
            .take_stream(container_port)
            .ok_or_else(|| stream_error("no stream for port".to_string()))?;

        tracing::debug!(
            "Opened port-forward stream to {}/{}:{}",
            pod.namespace,
            pod.name,
            container_port
        );
        Ok(Arc::new(SplitStream::with_forwarder(stream, forwarder)))
    }
}
