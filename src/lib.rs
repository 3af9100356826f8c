pub mod kubernetes;
pub mod settings;

pub use kubernetes::{KubeClient, Reconciler, ResourceDescriptor, TunnelHandle};
pub use settings::{Settings, TunnelSettings};
