//! Worker registry shared by the decision engine and the reconciler.
//!
//! The registry owns every tracked worker's notification state and rolling
//! CPU samples. It is internally synchronized; both loops go through the
//! methods here and never hold a guard across an await point.

use std::collections::BTreeMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::hypervisor::DomainId;

/// Weights of the 3-tap moving average, oldest sample first.
const SAMPLE_WEIGHTS: [f64; 3] = [0.2, 0.4, 0.4];

/// The controller's record of whether the dispatcher has acknowledged a
/// worker's activation or deactivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyState {
    /// Activated, dispatcher has not acknowledged registration.
    CreatePending,
    /// Dispatcher acknowledged registration; worker serves traffic.
    CreateAcked,
    /// Selected for scale-in, deregistration not yet acknowledged.
    ShutdownPending,
    /// Deregistration and hypervisor shutdown both confirmed. Terminal:
    /// a worker reaching this state leaves the registry.
    ShutdownAcked,
}

/// One tracked worker.
#[derive(Debug, Clone)]
pub struct WorkerStat {
    pub domain: DomainId,
    /// Worker network address once resolved.
    pub address: Option<String>,
    /// Most recent cumulative guest-time reading, nanoseconds.
    pub last_guest_ns: Option<u64>,
    /// Last three utilization samples in core-fractions per second,
    /// oldest first.
    pub samples: [f64; 3],
    /// Weighted moving average over `samples`.
    pub utilization: f64,
    pub state: NotifyState,
}

impl WorkerStat {
    pub fn new(domain: DomainId) -> Self {
        Self {
            domain,
            address: None,
            last_guest_ns: None,
            samples: [0.0; 3],
            utilization: 0.0,
            state: NotifyState::CreatePending,
        }
    }

    /// Shift in a new sample and recompute the smoothed utilization.
    fn push_sample(&mut self, sample: f64) {
        self.samples.rotate_left(1);
        self.samples[2] = sample;
        self.utilization = SAMPLE_WEIGHTS
            .iter()
            .zip(self.samples.iter())
            .map(|(w, s)| w * s)
            .sum();
    }
}

/// Result of a reconciler confirmation, see [`WorkerRegistry::confirm_active`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// No entry existed; one was created already acknowledged.
    Inserted,
    /// A `CreatePending` entry was promoted (lost acknowledgment healed).
    Promoted,
    /// Entry already consistent, nothing to do.
    Unchanged,
}

/// Ordered set of tracked workers, internally synchronized.
pub struct WorkerRegistry {
    inner: RwLock<BTreeMap<DomainId, WorkerStat>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn insert(&self, stat: WorkerStat) {
        let mut inner = self.inner.write().await;
        inner.insert(stat.domain.clone(), stat);
    }

    pub async fn remove(&self, domain: &DomainId) -> Option<WorkerStat> {
        let mut inner = self.inner.write().await;
        inner.remove(domain)
    }

    pub async fn get(&self, domain: &DomainId) -> Option<WorkerStat> {
        let inner = self.inner.read().await;
        inner.get(domain).cloned()
    }

    pub async fn contains(&self, domain: &DomainId) -> bool {
        let inner = self.inner.read().await;
        inner.contains_key(domain)
    }

    pub async fn len(&self) -> usize {
        let inner = self.inner.read().await;
        inner.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Domains currently eligible for load measurement.
    pub async fn acked_domains(&self) -> Vec<DomainId> {
        let inner = self.inner.read().await;
        inner
            .values()
            .filter(|s| s.state == NotifyState::CreateAcked)
            .map(|s| s.domain.clone())
            .collect()
    }

    /// Number of acknowledged (serving) workers.
    pub async fn acked_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner
            .values()
            .filter(|s| s.state == NotifyState::CreateAcked)
            .count()
    }

    /// Smoothed utilizations of all acknowledged workers.
    pub async fn acked_utilizations(&self) -> Vec<f64> {
        let inner = self.inner.read().await;
        inner
            .values()
            .filter(|s| s.state == NotifyState::CreateAcked)
            .map(|s| s.utilization)
            .collect()
    }

    /// First worker stuck in a pending state, in registry order.
    pub async fn first_pending(&self) -> Option<WorkerStat> {
        let inner = self.inner.read().await;
        inner
            .values()
            .find(|s| {
                matches!(
                    s.state,
                    NotifyState::CreatePending | NotifyState::ShutdownPending
                )
            })
            .cloned()
    }

    /// First acknowledged worker, in registry order (scale-in candidate).
    pub async fn first_acked(&self) -> Option<WorkerStat> {
        let inner = self.inner.read().await;
        inner
            .values()
            .find(|s| s.state == NotifyState::CreateAcked)
            .cloned()
    }

    pub async fn set_state(&self, domain: &DomainId, state: NotifyState) {
        let mut inner = self.inner.write().await;
        if let Some(stat) = inner.get_mut(domain) {
            debug!(domain = %domain, from = ?stat.state, to = ?state, "Notify state transition");
            stat.state = state;
        }
    }

    pub async fn set_address(&self, domain: &DomainId, address: String) {
        let mut inner = self.inner.write().await;
        if let Some(stat) = inner.get_mut(domain) {
            stat.address = Some(address);
        }
    }

    /// Record one measurement for a worker. Ignored if the worker left the
    /// registry or stopped being acknowledged during the measurement window.
    pub async fn apply_sample(&self, domain: &DomainId, guest_ns: u64, sample: f64) {
        let mut inner = self.inner.write().await;
        if let Some(stat) = inner.get_mut(domain) {
            if stat.state == NotifyState::CreateAcked {
                stat.last_guest_ns = Some(guest_ns);
                stat.push_sample(sample);
            }
        }
    }

    /// Reconciler self-heal: make sure `domain` has an acknowledged entry.
    ///
    /// Never demotes and never removes; a `ShutdownPending` worker is left
    /// for the scale-in repair path.
    pub async fn confirm_active(&self, domain: &DomainId, address: &str) -> ConfirmOutcome {
        let mut inner = self.inner.write().await;
        match inner.get_mut(domain) {
            None => {
                let mut stat = WorkerStat::new(domain.clone());
                stat.address = Some(address.to_string());
                stat.state = NotifyState::CreateAcked;
                inner.insert(domain.clone(), stat);
                ConfirmOutcome::Inserted
            }
            Some(stat) if stat.state == NotifyState::CreatePending => {
                stat.state = NotifyState::CreateAcked;
                stat.address.get_or_insert_with(|| address.to_string());
                ConfirmOutcome::Promoted
            }
            Some(_) => ConfirmOutcome::Unchanged,
        }
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
