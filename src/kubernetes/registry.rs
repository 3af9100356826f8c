//! Resource kind registry
//!
//! Maps every supported [`ResourceKind`] to a [`KindBinding`]: the read,
//! create and replace calls for that kind. Built-in kinds go through the
//! typed k8s-openapi structs, the custom kinds share a single dynamic binding
//! parameterized by the descriptor's group, version and plural.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use super::resource::{BodyLayout, ResourceDescriptor, ResourceError, ResourceKind};

/// Failures reported by (or on the way to) the control plane
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{reason} ({code}): {message}")]
    Status {
        code: u16,
        reason: String,
        message: String,
    },

    #[error("Kube error: {0}")]
    Client(#[source] kube::Error),

    #[error("Failed to build request: {0}")]
    Request(#[from] ResourceError),

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    /// HTTP status code returned by the API server, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ApiError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.status_code() == Some(409)
    }
}

impl From<kube::Error> for ApiError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(status) => ApiError::Status {
                code: status.code,
                reason: status.reason.clone(),
                message: status.message.clone(),
            },
            other => ApiError::Client(other),
        }
    }
}

/// The read/create/replace calls for one resource kind
#[async_trait]
pub trait KindBinding: Send + Sync {
    /// apiVersion this binding serves, when it only serves one
    fn api_version(&self) -> Option<Cow<'_, str>> {
        None
    }

    /// Fetch the live object. A missing object is a 404 [`ApiError::Status`].
    async fn read(&self, descriptor: &ResourceDescriptor) -> Result<DynamicObject, ApiError>;

    async fn create(&self, descriptor: &ResourceDescriptor) -> Result<DynamicObject, ApiError>;

    /// Overwrite the live object. `current` is the object returned by `read`.
    async fn replace(
        &self,
        descriptor: &ResourceDescriptor,
        current: &DynamicObject,
    ) -> Result<DynamicObject, ApiError>;
}

/// How a typed binding writes over an existing object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// Full-document PUT
    Replace,
    /// JSON merge patch with the rendered document
    MergePatch,
}

/// Binding for a built-in kind backed by its k8s-openapi type
pub struct TypedBinding<K> {
    client: Client,
    layout: BodyLayout,
    strategy: UpdateStrategy,
    _kind: PhantomData<fn() -> K>,
}

impl<K> TypedBinding<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    pub fn new(client: Client, layout: BodyLayout, strategy: UpdateStrategy) -> Self {
        Self {
            client,
            layout,
            strategy,
            _kind: PhantomData,
        }
    }

    fn api(&self, descriptor: &ResourceDescriptor) -> Result<Api<K>, ApiError> {
        let namespace = descriptor.require_namespace()?;
        Ok(Api::namespaced(self.client.clone(), namespace))
    }

    fn build(&self, descriptor: &ResourceDescriptor) -> Result<K, ApiError> {
        let document = descriptor.to_document(self.layout)?;
        Ok(serde_json::from_value(document)?)
    }
}

#[async_trait]
impl<K> KindBinding for TypedBinding<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    fn api_version(&self) -> Option<Cow<'_, str>> {
        Some(K::api_version(&()))
    }

    async fn read(&self, descriptor: &ResourceDescriptor) -> Result<DynamicObject, ApiError> {
        let object = self.api(descriptor)?.get(&descriptor.name).await?;
        to_dynamic(&object)
    }

    async fn create(&self, descriptor: &ResourceDescriptor) -> Result<DynamicObject, ApiError> {
        let object = self.build(descriptor)?;
        let created = self
            .api(descriptor)?
            .create(&PostParams::default(), &object)
            .await?;
        to_dynamic(&created)
    }

    async fn replace(
        &self,
        descriptor: &ResourceDescriptor,
        _current: &DynamicObject,
    ) -> Result<DynamicObject, ApiError> {
        let api = self.api(descriptor)?;
        let updated = match self.strategy {
            UpdateStrategy::Replace => {
                let object = self.build(descriptor)?;
                api.replace(&descriptor.name, &PostParams::default(), &object)
                    .await?
            }
            UpdateStrategy::MergePatch => {
                let document = descriptor.to_document(self.layout)?;
                api.patch(&descriptor.name, &PatchParams::default(), &Patch::Merge(&document))
                    .await?
            }
        };
        to_dynamic(&updated)
    }
}

/// Shared binding for custom resources served through the dynamic API
pub struct CustomObjectBinding {
    client: Client,
}

impl CustomObjectBinding {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// API coordinates of the descriptor's custom resource
    pub fn api_resource(descriptor: &ResourceDescriptor) -> ApiResource {
        let gvk = GroupVersionKind::gvk(
            descriptor.api_version.group(),
            descriptor.api_version.version(),
            &descriptor.kind,
        );
        ApiResource::from_gvk_with_plural(&gvk, &descriptor.plural)
    }

    fn api(&self, descriptor: &ResourceDescriptor) -> Result<Api<DynamicObject>, ApiError> {
        let namespace = descriptor.require_namespace()?;
        Ok(Api::namespaced_with(
            self.client.clone(),
            namespace,
            &Self::api_resource(descriptor),
        ))
    }

    fn build(descriptor: &ResourceDescriptor) -> Result<DynamicObject, ApiError> {
        let document = descriptor.to_document(BodyLayout::Nested)?;
        Ok(serde_json::from_value(document)?)
    }
}

#[async_trait]
impl KindBinding for CustomObjectBinding {
    async fn read(&self, descriptor: &ResourceDescriptor) -> Result<DynamicObject, ApiError> {
        Ok(self.api(descriptor)?.get(&descriptor.name).await?)
    }

    async fn create(&self, descriptor: &ResourceDescriptor) -> Result<DynamicObject, ApiError> {
        let object = Self::build(descriptor)?;
        Ok(self
            .api(descriptor)?
            .create(&PostParams::default(), &object)
            .await?)
    }

    async fn replace(
        &self,
        descriptor: &ResourceDescriptor,
        current: &DynamicObject,
    ) -> Result<DynamicObject, ApiError> {
        let mut object = Self::build(descriptor)?;
        // Optimistic concurrency: the PUT is rejected if the object moved on since the read
        object.metadata.resource_version = current.metadata.resource_version.clone();
        Ok(self
            .api(descriptor)?
            .replace(&descriptor.name, &PostParams::default(), &object)
            .await?)
    }
}

fn to_dynamic<K: Serialize>(object: &K) -> Result<DynamicObject, ApiError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Kind to binding lookup table
#[derive(Clone, Default)]
pub struct ResourceKindRegistry {
    bindings: HashMap<ResourceKind, Arc<dyn KindBinding>>,
}

impl ResourceKindRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a binding for every [`ResourceKind`]
    pub fn for_client(client: Client) -> Self {
        let custom: Arc<dyn KindBinding> = Arc::new(CustomObjectBinding::new(client.clone()));
        let mut registry = Self::new()
            .with_binding(
                ResourceKind::Deployment,
                Arc::new(TypedBinding::<Deployment>::new(
                    client.clone(),
                    BodyLayout::Nested,
                    UpdateStrategy::Replace,
                )),
            )
            .with_binding(
                ResourceKind::Service,
                Arc::new(TypedBinding::<Service>::new(
                    client.clone(),
                    BodyLayout::Nested,
                    UpdateStrategy::Replace,
                )),
            )
            .with_binding(
                ResourceKind::HorizontalPodAutoscaler,
                Arc::new(TypedBinding::<HorizontalPodAutoscaler>::new(
                    client.clone(),
                    BodyLayout::Nested,
                    UpdateStrategy::Replace,
                )),
            )
            .with_binding(
                ResourceKind::ServiceAccount,
                Arc::new(TypedBinding::<ServiceAccount>::new(
                    client.clone(),
                    BodyLayout::Inline,
                    UpdateStrategy::MergePatch,
                )),
            )
            .with_binding(
                ResourceKind::Secret,
                Arc::new(TypedBinding::<Secret>::new(
                    client.clone(),
                    BodyLayout::Inline,
                    UpdateStrategy::MergePatch,
                )),
            )
            .with_binding(
                ResourceKind::ConfigMap,
                Arc::new(TypedBinding::<ConfigMap>::new(
                    client.clone(),
                    BodyLayout::Inline,
                    UpdateStrategy::MergePatch,
                )),
            )
            .with_binding(
                ResourceKind::Role,
                Arc::new(TypedBinding::<Role>::new(
                    client.clone(),
                    BodyLayout::Inline,
                    UpdateStrategy::MergePatch,
                )),
            )
            .with_binding(
                ResourceKind::RoleBinding,
                Arc::new(TypedBinding::<RoleBinding>::new(
                    client,
                    BodyLayout::Inline,
                    UpdateStrategy::MergePatch,
                )),
            );

        for kind in ResourceKind::ALL.into_iter().filter(ResourceKind::is_custom) {
            registry.register(kind, custom.clone());
        }
        registry
    }

    /// Register `binding` for `kind`, returning the binding it replaces
    pub fn register(
        &mut self,
        kind: ResourceKind,
        binding: Arc<dyn KindBinding>,
    ) -> Option<Arc<dyn KindBinding>> {
        self.bindings.insert(kind, binding)
    }

    pub fn with_binding(mut self, kind: ResourceKind, binding: Arc<dyn KindBinding>) -> Self {
        self.register(kind, binding);
        self
    }

    pub fn get(&self, kind: ResourceKind) -> Option<&Arc<dyn KindBinding>> {
        self.bindings.get(&kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<ResourceKind> {
        let mut kinds: Vec<ResourceKind> = self.bindings.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
