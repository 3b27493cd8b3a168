//! vmherd Dispatcher
//!
//! Accepts membership commands from the controller, keeps a live
//! connection per worker, paces synthetic requests over the pool, and
//! drains worker responses.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vmherd_dispatcher::collector::Collector;
use vmherd_dispatcher::config::Config;
use vmherd_dispatcher::generator::{Generator, PaceMode};
use vmherd_dispatcher::operator;
use vmherd_dispatcher::registry::LiveRegistry;
use vmherd_dispatcher::server::ProtocolServer;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting vmherd dispatcher");
    info!(
        listen_addr = %config.listen_addr,
        pace_low_ms = config.pace_low_ms,
        pace_high_ms = config.pace_high_ms,
        "Configuration loaded"
    );

    let registry = Arc::new(LiveRegistry::new());
    let server = ProtocolServer::bind(&config.listen_addr, Arc::clone(&registry)).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (pacing_tx, pacing_rx) = watch::channel(PaceMode::Low);

    let server_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            server.run(shutdown_rx).await;
        }
    });

    let generator = Generator::new(
        Arc::clone(&registry),
        config.pacing_bounds(),
        config.value_bounds(),
        pacing_rx,
    );
    let generator_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            generator.run(shutdown_rx).await;
        }
    });

    let collector = Collector::new(Arc::clone(&registry), config.poll_timeout());
    let collector_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            collector.run(shutdown_rx).await;
        }
    });

    let operator_handle = tokio::spawn(operator::run(
        Arc::clone(&registry),
        pacing_tx,
        shutdown_tx.clone(),
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        changed = watch_shutdown(shutdown_rx.clone()) => {
            if changed {
                info!("Operator shutdown");
            }
        }
    }

    let _ = shutdown_tx.send(true);

    // Generator and collector check the channel once per iteration, so
    // they join within one pacing/poll interval.
    for (name, handle) in [
        ("generator", generator_handle),
        ("collector", collector_handle),
        ("server", server_handle),
    ] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Task panicked");
        }
    }
    operator_handle.abort();

    info!("Dispatcher shutdown complete");
    Ok(())
}

async fn watch_shutdown(mut rx: watch::Receiver<bool>) -> bool {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return false;
        }
    }
    true
}
