//! Reconciliation loop for re-confirming worker registrations.
//!
//! Runs concurrently with the decision engine on its own schedule. Every
//! pass sends a CONSISTENT notification for each active domain and repairs
//! registry entries that drifted: an active worker with no entry gets one
//! (already acknowledged), a lost acknowledgment gets promoted. The
//! reconciler never removes entries; only scale-in removes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use vmherd_proto::{Command, Reply};

use crate::hypervisor::Hypervisor;
use crate::notify::Notifier;
use crate::registry::{ConfirmOutcome, WorkerRegistry};

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

pub struct Reconciler {
    hypervisor: Arc<dyn Hypervisor>,
    notifier: Arc<dyn Notifier>,
    registry: Arc<WorkerRegistry>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        notifier: Arc<dyn Notifier>,
        registry: Arc<WorkerRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            hypervisor,
            notifier,
            registry,
            interval,
        }
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting reconciler"
        );

        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "Reconciliation pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One reconciliation pass over every active domain.
    pub async fn reconcile(&self) -> anyhow::Result<()> {
        for domain in self.hypervisor.list_domains().await? {
            if !self.hypervisor.is_active(&domain).await? {
                continue;
            }

            let address = match self.hypervisor.worker_address(&domain).await? {
                Some(address) => address,
                None => {
                    debug!(domain = %domain, "Address not yet available, worker still booting");
                    continue;
                }
            };

            match self
                .notifier
                .notify(Command::Consistent(address.clone()))
                .await
            {
                Ok(Reply::Success) => {
                    match self.registry.confirm_active(&domain, &address).await {
                        ConfirmOutcome::Inserted => {
                            info!(domain = %domain, "Healed registry gap for active worker");
                        }
                        ConfirmOutcome::Promoted => {
                            info!(domain = %domain, "Healed lost registration acknowledgment");
                        }
                        ConfirmOutcome::Unchanged => {
                            debug!(domain = %domain, "Worker registration consistent");
                        }
                    }
                }
                Ok(Reply::Failed) => {
                    // Worker assumed still booting on the dispatcher side.
                    debug!(domain = %domain, "Consistency check rejected, leaving state untouched");
                }
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Consistency notification failed");
                }
            }
        }
        Ok(())
    }
}
