//! Create-or-update reconciliation
//!
//! [`Reconciler::reconcile`] reads the object named by a descriptor and either
//! replaces it or, when the read comes back 404, creates it. There is no retry
//! around the read-then-write window: a writer that lands in between wins.

use std::collections::BTreeMap;

use kube::core::DynamicObject;
use kube::Client;
use serde_json::{json, Value};
use thiserror::Error;

use super::registry::{ApiError, ResourceKindRegistry};
use super::resource::{ResourceDescriptor, ResourceError};

/// Errors that can occur while reconciling a resource
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Invalid resource: {0}")]
    Validation(#[from] ResourceError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

impl ReconcileError {
    /// HTTP status code of the underlying API failure, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ReconcileError::Api(err) => err.status_code(),
            ReconcileError::Validation(_) => None,
        }
    }
}

/// What reconciliation did to the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Created,
    Updated,
}

/// Result of a successful reconciliation
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub action: ReconcileAction,
    /// The object as returned by the API server
    pub object: DynamicObject,
}

/// Upserts resource descriptors through a [`ResourceKindRegistry`]
#[derive(Clone)]
pub struct Reconciler {
    registry: ResourceKindRegistry,
}

impl Reconciler {
    pub fn new(registry: ResourceKindRegistry) -> Self {
        Self { registry }
    }

    /// Reconciler covering every supported kind
    pub fn for_client(client: Client) -> Self {
        Self::new(ResourceKindRegistry::for_client(client))
    }

    pub fn registry(&self) -> &ResourceKindRegistry {
        &self.registry
    }

    /// Make sure the object described by `descriptor` exists with its spec
    pub async fn reconcile(
        &self,
        descriptor: &ResourceDescriptor,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let kind = descriptor.validate().map_err(|e| {
            tracing::error!("Rejected {} '{}': {}", descriptor.kind, descriptor.name, e);
            e
        })?;

        let binding = self.registry.get(kind).ok_or_else(|| {
            tracing::error!("No binding registered for {}", kind);
            ResourceError::UnsupportedKind(kind.to_string())
        })?;

        if let Some(expected) = binding.api_version() {
            let found = descriptor.api_version.to_string();
            if expected != found.as_str() {
                tracing::error!(
                    "{} '{}' has apiVersion {}, expected {}",
                    kind,
                    descriptor.name,
                    found,
                    expected
                );
                return Err(ResourceError::ApiVersionMismatch {
                    kind: kind.to_string(),
                    expected: expected.into_owned(),
                    found,
                }
                .into());
            }
        }

        let namespace = descriptor.require_namespace()?;
        let log_failure = |op: &str, e: ApiError| {
            tracing::error!(
                "Failed to {} {} '{}' in {}: {}",
                op,
                kind,
                descriptor.name,
                namespace,
                e
            );
            ReconcileError::Api(e)
        };

        match binding.read(descriptor).await {
            Ok(current) => {
                let object = binding
                    .replace(descriptor, &current)
                    .await
                    .map_err(|e| log_failure("replace", e))?;
                tracing::info!("{} '{}' updated.", kind, descriptor.name);
                Ok(ReconcileOutcome {
                    action: ReconcileAction::Updated,
                    object,
                })
            }
            Err(e) if e.is_not_found() => {
                let object = binding
                    .create(descriptor)
                    .await
                    .map_err(|e| log_failure("create", e))?;
                tracing::info!("{} '{}' created.", kind, descriptor.name);
                Ok(ReconcileOutcome {
                    action: ReconcileAction::Created,
                    object,
                })
            }
            Err(e) => Err(log_failure("read", e)),
        }
    }

    pub async fn apply_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        self.reconcile(&service_account(namespace, name)?).await
    }

    pub async fn apply_role(
        &self,
        namespace: &str,
        name: &str,
        rules: Value,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        self.reconcile(&role(namespace, name, rules)?).await
    }

    pub async fn apply_role_binding(
        &self,
        binding: &RoleBindingRequest<'_>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        self.reconcile(&role_binding(binding)?).await
    }

    pub async fn apply_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        self.reconcile(&config_map(namespace, name, data)?).await
    }
}

/// Binds a namespaced Role to a service account
#[derive(Debug, Clone)]
pub struct RoleBindingRequest<'a> {
    pub binding_namespace: &'a str,
    pub binding_name: &'a str,
    pub role_name: &'a str,
    pub subject_namespace: &'a str,
    pub service_account_name: &'a str,
}

pub fn service_account(namespace: &str, name: &str) -> Result<ResourceDescriptor, ResourceError> {
    Ok(ResourceDescriptor::new("ServiceAccount", "v1", name)?.namespace(namespace))
}

pub fn role(namespace: &str, name: &str, rules: Value) -> Result<ResourceDescriptor, ResourceError> {
    Ok(
        ResourceDescriptor::new("Role", "rbac.authorization.k8s.io/v1", name)?
            .namespace(namespace)
            .spec(json!({ "rules": rules })),
    )
}

pub fn role_binding(request: &RoleBindingRequest<'_>) -> Result<ResourceDescriptor, ResourceError> {
    Ok(ResourceDescriptor::new(
        "RoleBinding",
        "rbac.authorization.k8s.io/v1",
        request.binding_name,
    )?
    .namespace(request.binding_namespace)
    .spec(json!({
        "subjects": [{
            "kind": "ServiceAccount",
            "name": request.service_account_name,
            "namespace": request.subject_namespace,
        }],
        "roleRef": {
            "apiGroup": "rbac.authorization.k8s.io",
            "kind": "Role",
            "name": request.role_name,
        },
    })))
}

pub fn config_map(
    namespace: &str,
    name: &str,
    data: &BTreeMap<String, String>,
) -> Result<ResourceDescriptor, ResourceError> {
    Ok(ResourceDescriptor::new("ConfigMap", "v1", name)?
        .namespace(namespace)
        .spec(json!({ "data": data })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::registry::KindBinding;
    use crate::kubernetes::resource::{BodyLayout, ResourceKind};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::borrow::Cow;
    use std::sync::Arc;

    /// In-memory binding that records every call
    #[derive(Default)]
    struct RecordingBinding {
        existing: Mutex<Option<DynamicObject>>,
        read_failure: Option<u16>,
        pinned: Option<&'static str>,
        calls: Mutex<Vec<&'static str>>,
        replaced_version: Mutex<Option<String>>,
    }

    impl RecordingBinding {
        fn with_existing(object: DynamicObject) -> Self {
            Self {
                existing: Mutex::new(Some(object)),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().clone()
        }
    }

    fn status(code: u16) -> ApiError {
        ApiError::Status {
            code,
            reason: "Test".into(),
            message: format!("status {code}"),
        }
    }

    fn object(descriptor: &ResourceDescriptor, version: &str) -> DynamicObject {
        let mut doc = descriptor.to_document(BodyLayout::Inline).unwrap();
        doc["metadata"]["resourceVersion"] = json!(version);
        serde_json::from_value(doc).unwrap()
    }

    #[async_trait]
    impl KindBinding for RecordingBinding {
        fn api_version(&self) -> Option<Cow<'_, str>> {
            self.pinned.map(Cow::Borrowed)
        }

        async fn read(&self, _descriptor: &ResourceDescriptor) -> Result<DynamicObject, ApiError> {
            self.calls.lock().push("read");
            if let Some(code) = self.read_failure {
                return Err(status(code));
            }
            self.existing.lock().clone().ok_or_else(|| status(404))
        }

        async fn create(&self, descriptor: &ResourceDescriptor) -> Result<DynamicObject, ApiError> {
            self.calls.lock().push("create");
            let created = object(descriptor, "1");
            *self.existing.lock() = Some(created.clone());
            Ok(created)
        }

        async fn replace(
            &self,
            descriptor: &ResourceDescriptor,
            current: &DynamicObject,
        ) -> Result<DynamicObject, ApiError> {
            self.calls.lock().push("replace");
            *self.replaced_version.lock() = current.metadata.resource_version.clone();
            Ok(object(descriptor, "2"))
        }
    }

    fn reconciler_with(kind: ResourceKind, binding: Arc<RecordingBinding>) -> Reconciler {
        Reconciler::new(ResourceKindRegistry::new().with_binding(kind, binding))
    }

    fn settings_map() -> ResourceDescriptor {
        ResourceDescriptor::new("ConfigMap", "v1", "settings")
            .unwrap()
            .namespace("jobs")
            .spec(json!({"data": {"mode": "fast"}}))
    }

    #[tokio::test]
    async fn test_absent_resource_is_created() {
        let binding = Arc::new(RecordingBinding::default());
        let reconciler = reconciler_with(ResourceKind::ConfigMap, binding.clone());

        let outcome = reconciler.reconcile(&settings_map()).await.unwrap();

        assert_eq!(outcome.action, ReconcileAction::Created);
        assert_eq!(binding.calls(), vec!["read", "create"]);
        assert_eq!(outcome.object.metadata.name.as_deref(), Some("settings"));
    }

    #[tokio::test]
    async fn test_present_resource_is_replaced_with_fetched_version() {
        let descriptor = settings_map();
        let binding = Arc::new(RecordingBinding::with_existing(object(&descriptor, "41")));
        let reconciler = reconciler_with(ResourceKind::ConfigMap, binding.clone());

        let outcome = reconciler.reconcile(&descriptor).await.unwrap();

        assert_eq!(outcome.action, ReconcileAction::Updated);
        assert_eq!(binding.calls(), vec!["read", "replace"]);
        assert_eq!(binding.replaced_version.lock().as_deref(), Some("41"));
    }

    #[tokio::test]
    async fn test_second_reconcile_updates() {
        let binding = Arc::new(RecordingBinding::default());
        let reconciler = reconciler_with(ResourceKind::ConfigMap, binding.clone());

        reconciler.reconcile(&settings_map()).await.unwrap();
        let outcome = reconciler.reconcile(&settings_map()).await.unwrap();

        assert_eq!(outcome.action, ReconcileAction::Updated);
        assert_eq!(binding.calls(), vec!["read", "create", "read", "replace"]);
    }

    #[tokio::test]
    async fn test_unsupported_kind_fails_before_any_call() {
        let binding = Arc::new(RecordingBinding::default());
        let reconciler = reconciler_with(ResourceKind::ConfigMap, binding.clone());

        let descriptor = ResourceDescriptor::new("CronJob", "batch/v1", "nightly")
            .unwrap()
            .namespace("jobs");
        let err = reconciler.reconcile(&descriptor).await.unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::Validation(ResourceError::UnsupportedKind(_))
        ));
        assert!(binding.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unbound_kind_fails_before_any_call() {
        let binding = Arc::new(RecordingBinding::default());
        let reconciler = reconciler_with(ResourceKind::ConfigMap, binding.clone());

        let descriptor = ResourceDescriptor::new("Secret", "v1", "token")
            .unwrap()
            .namespace("jobs");
        let err = reconciler.reconcile(&descriptor).await.unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::Validation(ResourceError::UnsupportedKind(k)) if k == "Secret"
        ));
        assert!(binding.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_namespace_fails_before_any_call() {
        let binding = Arc::new(RecordingBinding::default());
        let reconciler = reconciler_with(ResourceKind::ConfigMap, binding.clone());

        let descriptor = ResourceDescriptor::new("ConfigMap", "v1", "settings").unwrap();
        let err = reconciler.reconcile(&descriptor).await.unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::Validation(ResourceError::MissingNamespace)
        ));
        assert!(binding.calls().is_empty());
    }

    #[tokio::test]
    async fn test_api_version_mismatch_fails_before_any_call() {
        let binding = Arc::new(RecordingBinding {
            pinned: Some("apps/v1"),
            ..Default::default()
        });
        let reconciler = reconciler_with(ResourceKind::Deployment, binding.clone());

        let descriptor = ResourceDescriptor::new("Deployment", "extensions/v1beta1", "web")
            .unwrap()
            .namespace("default");
        let err = reconciler.reconcile(&descriptor).await.unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::Validation(ResourceError::ApiVersionMismatch { .. })
        ));
        assert!(binding.calls().is_empty());
    }

    #[tokio::test]
    async fn test_custom_kind_with_core_version_fails_before_any_call() {
        let binding = Arc::new(RecordingBinding::default());
        let reconciler = reconciler_with(ResourceKind::ScaledObject, binding.clone());

        let descriptor = ResourceDescriptor::new("ScaledObject", "v1", "worker")
            .unwrap()
            .namespace("jobs")
            .plural("scaledobjects");
        let err = reconciler.reconcile(&descriptor).await.unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::Validation(ResourceError::InvalidApiVersion(_))
        ));
        assert!(binding.calls().is_empty());
    }

    #[tokio::test]
    async fn test_read_failure_propagates_without_create() {
        let binding = Arc::new(RecordingBinding {
            read_failure: Some(403),
            ..Default::default()
        });
        let reconciler = reconciler_with(ResourceKind::ConfigMap, binding.clone());

        let err = reconciler.reconcile(&settings_map()).await.unwrap_err();

        assert_eq!(err.status_code(), Some(403));
        assert_eq!(binding.calls(), vec!["read"]);
    }

    #[test]
    fn test_role_binding_descriptor() {
        let descriptor = role_binding(&RoleBindingRequest {
            binding_namespace: "default",
            binding_name: "worker-binding",
            role_name: "job-reader",
            subject_namespace: "jobs",
            service_account_name: "celery-worker-sa",
        })
        .unwrap();

        assert_eq!(descriptor.validate().unwrap(), ResourceKind::RoleBinding);
        let doc = descriptor.to_document(BodyLayout::Inline).unwrap();
        assert_eq!(doc["subjects"][0]["name"], "celery-worker-sa");
        assert_eq!(doc["subjects"][0]["namespace"], "jobs");
        assert_eq!(doc["roleRef"]["name"], "job-reader");
        assert_eq!(doc["metadata"]["namespace"], "default");
    }

    #[test]
    fn test_config_map_descriptor() {
        let mut data = BTreeMap::new();
        data.insert("REDIS_URL".to_string(), "redis://redis:6379".to_string());
        let descriptor = config_map("jobs", "worker-config", &data).unwrap();
        let doc = descriptor.to_document(BodyLayout::Inline).unwrap();
        assert_eq!(doc["data"]["REDIS_URL"], "redis://redis:6379");
        assert_eq!(doc["apiVersion"], "v1");
    }
}
