//! CPU usage sampling.
//!
//! One measurement round takes two time-separated guest-time readings for
//! every acknowledged worker and converts the delta into core-fractions per
//! second. The sleep between readings IS the measurement window; it happens
//! with no registry lock held, so the reconciler is never blocked by a
//! round in progress.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use crate::hypervisor::{DomainId, Hypervisor};
use crate::registry::WorkerRegistry;

pub const DEFAULT_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

pub struct Sampler {
    hypervisor: Arc<dyn Hypervisor>,
    window: Duration,
}

impl Sampler {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, window: Duration) -> Self {
        Self { hypervisor, window }
    }

    /// Run one measurement round over every acknowledged worker.
    ///
    /// Returns the number of workers sampled. A worker whose counters
    /// cannot be read is skipped for this round, not failed.
    pub async fn measure(&self, registry: &WorkerRegistry) -> Result<usize> {
        let domains = registry.acked_domains().await;
        if domains.is_empty() {
            return Ok(0);
        }

        let mut first = BTreeMap::new();
        for domain in &domains {
            match self.hypervisor.cpu_counters(domain).await {
                Ok(counters) => {
                    first.insert(domain.clone(), counters.guest_ns());
                }
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Skipping worker, counter read failed");
                }
            }
        }

        tokio::time::sleep(self.window).await;

        let window_ns = self.window.as_nanos() as f64;
        let mut sampled = 0;
        for (domain, start_ns) in first {
            let counters = match self.hypervisor.cpu_counters(&domain).await {
                Ok(counters) => counters,
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Skipping worker, counter read failed");
                    continue;
                }
            };
            let end_ns = counters.guest_ns();
            // Counter resets show up as a negative delta; clamp to zero.
            let delta_ns = end_ns.saturating_sub(start_ns);
            let sample = delta_ns as f64 / window_ns;

            debug!(
                domain = %domain,
                guest_ns = end_ns,
                sample,
                "Sampled worker CPU"
            );
            registry.apply_sample(&domain, end_ns, sample).await;
            sampled += 1;
        }

        Ok(sampled)
    }
}
