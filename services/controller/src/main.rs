//! vmherd Controller
//!
//! Watches worker CPU load through the hypervisor, decides when to grow or
//! shrink the pool, and keeps the dispatcher's view of the pool consistent
//! with its own.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vmherd_controller::config::Config;
use vmherd_controller::engine::{bootstrap, Engine, EngineConfig};
use vmherd_controller::hypervisor::{Hypervisor, MockHypervisor};
use vmherd_controller::notify::{Notifier, TcpNotifier};
use vmherd_controller::reconciler::Reconciler;
use vmherd_controller::registry::WorkerRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting vmherd controller");
    info!(
        dispatcher_addr = %config.dispatcher_addr,
        domain_count = config.domains.len(),
        tick_delay_secs = config.tick_delay_secs,
        reconcile_interval_secs = config.reconcile_interval_secs,
        "Configuration loaded"
    );

    // Mock hypervisor for now; a libvirt binding slots in behind the trait.
    let hypervisor: Arc<dyn Hypervisor> = Arc::new(MockHypervisor::new(config.domains.clone()));
    let notifier: Arc<dyn Notifier> = Arc::new(TcpNotifier::new(config.dispatcher_addr.clone()));
    let registry = Arc::new(WorkerRegistry::new());

    // Fatal when the hypervisor is unreachable or reports no domains.
    bootstrap(hypervisor.as_ref(), &registry).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Reconciler::new(
        Arc::clone(&hypervisor),
        Arc::clone(&notifier),
        Arc::clone(&registry),
        config.reconcile_interval(),
    );
    let reconciler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    let engine_config = EngineConfig {
        patience: config.patience,
        settle_rounds: config.settle_rounds,
        tick_delay: config.tick_delay(),
        ..EngineConfig::default()
    };
    let engine = Engine::new(hypervisor, notifier, registry, engine_config);
    let engine_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            engine.run(shutdown_rx).await;
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = engine_handle => {
            if let Err(e) = result {
                error!(error = %e, "Engine task panicked");
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = reconciler_handle.await {
        error!(error = %e, "Reconciler task panicked");
    }

    info!("Controller shutdown complete");
    Ok(())
}
