//! kore rebalance controller.
//!
//! Watches `RebalanceRequest` resources and evicts opted-in pods from
//! overloaded nodes so the scheduler can spread them out. A node watcher
//! creates one-shot requests automatically when cluster topology changes.

use std::sync::Arc;

use anyhow::Result;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kore_controller::cluster::KubeCluster;
use kore_controller::config::Config;
use kore_controller::engine::Engine;
use kore_controller::node_watcher::NodeWatcher;
use kore_controller::reconciler::{self, Context};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to KORE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting kore rebalance controller");
    info!(
        auto_trigger_cooldown_secs = config.auto_trigger_cooldown.as_secs(),
        log_level = %config.log_level,
        "Configuration loaded"
    );

    let client = Client::try_default().await?;
    let cluster = Arc::new(KubeCluster::new(client.clone()));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
        }
    });

    // Auto-trigger watcher runs beside the request controller.
    let node_watcher = NodeWatcher::new(cluster.clone(), config.auto_trigger_cooldown);
    let watcher_handle = tokio::spawn(node_watcher.run(client.clone(), shutdown.clone()));

    let ctx = Arc::new(Context {
        engine: Engine::new(cluster.clone()),
        cluster,
        shutdown,
    });
    reconciler::run(client, ctx).await?;

    watcher_handle.await??;

    info!("Controller stopped");
    Ok(())
}
