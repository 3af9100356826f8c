use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use light::kubernetes::{sync_kubeconfig, KubeClient};
use light::Settings;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("Starting light v{}", env!("CARGO_PKG_VERSION"));

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            Settings::default()
        }
    };

    match sync_kubeconfig(&settings) {
        Ok(merged) => tracing::info!(
            "Kubeconfig synced, current-context {:?}",
            merged.current_context()
        ),
        Err(e) => tracing::error!("Failed to sync kubeconfig: {}", e),
    }

    match KubeClient::try_init().await {
        Some(client) => tracing::info!(
            "Authenticated to cluster, default namespace {}",
            client.default_namespace()
        ),
        None => tracing::info!("Continuing without cluster credentials"),
    }
}
