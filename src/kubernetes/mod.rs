//! Kubernetes integration module
//!
//! Provides resource reconciliation, pod port-forward tunnels, and kubeconfig
//! management for the active cluster.

pub mod client;
pub mod kubeconfig;
pub mod pods;
pub mod port_forward;
pub mod probe;
pub mod reconcile;
pub mod registry;
pub mod resource;

pub use client::{ClientError, KubeClient};
pub use kubeconfig::{save_cluster_kubeconfig, sync_kubeconfig, KubeconfigError};
pub use pods::{is_ready_pod, PodResolver, PodSelector, PodSource, ResolveError, ResolvedPod};
pub use port_forward::{
    allocate_port, ConnectionProxy, DuplexStream, PodStreamOpener, PortForwarder, SplitStream,
    TunnelError, TunnelHandle, TunnelState,
};
pub use probe::ReadinessProbe;
pub use reconcile::{ReconcileAction, ReconcileError, ReconcileOutcome, Reconciler};
pub use registry::{ApiError, KindBinding, ResourceKindRegistry};
pub use resource::{ApiVersion, BodyLayout, ResourceDescriptor, ResourceError, ResourceKind};
