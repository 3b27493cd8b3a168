//! Decision engine: load classification, hysteresis, and the per-worker
//! notification state machine.
//!
//! One control tick is: measure CPU across acknowledged workers, classify
//! the average, advance the hysteresis streaks, and act at most once. Any
//! worker stuck in a pending notification state is repaired before a fresh
//! scale decision is attempted, so at most one unacknowledged transition
//! exists at a time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use vmherd_proto::{Command, Reply};

use crate::hypervisor::{DomainId, Hypervisor};
use crate::notify::Notifier;
use crate::registry::{NotifyState, WorkerRegistry, WorkerStat};
use crate::sampler::Sampler;

/// Aggregate load classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Load {
    Low,
    Moderate,
    High,
}

/// Outcome of one classification pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Classification {
    Load { load: Load, average: f64 },
    /// No acknowledged worker to measure; the tick is skipped.
    NoEligibleWorkers,
}

/// What a single control tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No acknowledged workers; nothing measured, nothing decided.
    Skipped,
    /// Measurement round taken but discarded (post-scale-out settling).
    Settling,
    /// Classified; no action warranted.
    Idle,
    /// A pending worker's transition was retried.
    Repaired,
    /// A fresh scale-out was issued.
    ScaledOut,
    /// Scale-out wanted but no inactive domain could be activated.
    NoCapacity,
    /// A fresh scale-in was issued.
    ScaledIn,
    /// Scale-in wanted but only one worker is serving.
    AtFloor,
}

/// Tunables for the decision engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Average utilization above this is HIGH.
    pub high_threshold: f64,
    /// Average utilization above this is MODERATE.
    pub moderate_threshold: f64,
    /// Consecutive HIGH/LOW ticks a streak must exceed before acting.
    pub patience: u32,
    /// Measurement rounds discarded after a worker joins the pool.
    pub settle_rounds: u32,
    /// Measurement window between the two CPU readings of a tick.
    pub sample_window: Duration,
    /// Delay between control ticks.
    pub tick_delay: Duration,
    /// Address resolution attempts for a booting worker.
    pub address_attempts: u32,
    /// Initial address resolution backoff; doubles per attempt.
    pub address_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            high_threshold: 0.80,
            moderate_threshold: 0.40,
            patience: 3,
            settle_rounds: 3,
            sample_window: Duration::from_secs(1),
            tick_delay: Duration::from_secs(2),
            address_attempts: 6,
            address_backoff: Duration::from_millis(250),
        }
    }
}

fn classify_average(average: f64, config: &EngineConfig) -> Load {
    if average > config.high_threshold {
        Load::High
    } else if average > config.moderate_threshold {
        Load::Moderate
    } else {
        Load::Low
    }
}

/// The controller's decision loop.
pub struct Engine {
    hypervisor: Arc<dyn Hypervisor>,
    notifier: Arc<dyn Notifier>,
    registry: Arc<WorkerRegistry>,
    sampler: Sampler,
    config: EngineConfig,
    high_streak: u32,
    low_streak: u32,
    settle_remaining: u32,
}

impl Engine {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        notifier: Arc<dyn Notifier>,
        registry: Arc<WorkerRegistry>,
        config: EngineConfig,
    ) -> Self {
        let sampler = Sampler::new(Arc::clone(&hypervisor), config.sample_window);
        Self {
            hypervisor,
            notifier,
            registry,
            sampler,
            config,
            high_streak: 0,
            low_streak: 0,
            settle_remaining: 0,
        }
    }

    /// Run the control loop until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            high_threshold = self.config.high_threshold,
            moderate_threshold = self.config.moderate_threshold,
            patience = self.config.patience,
            tick_delay_secs = self.config.tick_delay.as_secs(),
            "Starting decision engine"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_delay) => {
                    match self.tick().await {
                        Ok(outcome) => debug!(outcome = ?outcome, "Control tick"),
                        Err(e) => error!(error = %e, "Control tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Decision engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Execute one control tick.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        // An unacknowledged transition is repaired before any new decision;
        // the registry must not drift further while a repair is owed.
        if let Some(pending) = self.registry.first_pending().await {
            self.repair(&pending).await;
            return Ok(TickOutcome::Repaired);
        }

        let classification = self.classify().await?;
        let (load, average) = match classification {
            Classification::NoEligibleWorkers => {
                warn!("No acknowledged workers to measure, skipping tick");
                return Ok(TickOutcome::Skipped);
            }
            Classification::Load { load, average } => (load, average),
        };

        if self.settle_remaining > 0 {
            self.settle_remaining -= 1;
            debug!(
                average,
                remaining = self.settle_remaining,
                "Discarding measurement round while new worker settles"
            );
            return Ok(TickOutcome::Settling);
        }

        match load {
            Load::High => {
                self.high_streak += 1;
                self.low_streak = 0;
            }
            Load::Low => {
                self.low_streak += 1;
                self.high_streak = 0;
            }
            Load::Moderate => {
                self.high_streak = 0;
                self.low_streak = 0;
            }
        }
        debug!(
            load = ?load,
            average,
            high_streak = self.high_streak,
            low_streak = self.low_streak,
            "Classified aggregate load"
        );

        if self.high_streak > self.config.patience {
            self.high_streak = 0;
            self.low_streak = 0;
            return self.scale_out().await;
        }
        if self.low_streak > self.config.patience {
            self.high_streak = 0;
            self.low_streak = 0;
            return self.scale_in().await;
        }

        Ok(TickOutcome::Idle)
    }

    /// Measure and classify aggregate load across acknowledged workers.
    pub async fn classify(&self) -> Result<Classification> {
        self.sampler.measure(&self.registry).await?;

        let utilizations = self.registry.acked_utilizations().await;
        if utilizations.is_empty() {
            return Ok(Classification::NoEligibleWorkers);
        }

        let average = utilizations.iter().sum::<f64>() / utilizations.len() as f64;
        Ok(Classification::Load {
            load: classify_average(average, &self.config),
            average,
        })
    }

    /// Retry the transition of the specific worker found pending.
    async fn repair(&mut self, pending: &WorkerStat) {
        match pending.state {
            NotifyState::CreatePending => {
                info!(domain = %pending.domain, "Retrying unacknowledged registration");
                self.try_complete_create(&pending.domain).await;
            }
            NotifyState::ShutdownPending => {
                info!(domain = %pending.domain, "Retrying unacknowledged deregistration");
                self.try_complete_shutdown(&pending.domain).await;
            }
            NotifyState::CreateAcked | NotifyState::ShutdownAcked => {}
        }
    }

    /// Activate one more worker and register it with the dispatcher.
    async fn scale_out(&mut self) -> Result<TickOutcome> {
        let candidate = self.find_inactive_candidate().await?;
        let Some(domain) = candidate else {
            warn!("Scale-out wanted but no inactive domain could be activated");
            return Ok(TickOutcome::NoCapacity);
        };

        info!(domain = %domain, "Scaling out");
        self.registry.insert(WorkerStat::new(domain.clone())).await;
        self.try_complete_create(&domain).await;
        Ok(TickOutcome::ScaledOut)
    }

    /// Deregister and shut down one worker, never dropping below one.
    async fn scale_in(&mut self) -> Result<TickOutcome> {
        if self.registry.acked_count().await <= 1 {
            info!("Scale-in wanted but only one worker is serving, holding");
            return Ok(TickOutcome::AtFloor);
        }

        let Some(victim) = self.registry.first_acked().await else {
            return Ok(TickOutcome::AtFloor);
        };

        info!(domain = %victim.domain, "Scaling in");
        self.registry
            .set_state(&victim.domain, NotifyState::ShutdownPending)
            .await;
        self.try_complete_shutdown(&victim.domain).await;
        Ok(TickOutcome::ScaledIn)
    }

    /// First untracked, inactive domain that activates successfully.
    async fn find_inactive_candidate(&self) -> Result<Option<DomainId>> {
        for domain in self.hypervisor.list_domains().await? {
            if self.registry.contains(&domain).await {
                continue;
            }
            if self.hypervisor.is_active(&domain).await? {
                continue;
            }
            match self.hypervisor.create(&domain).await {
                Ok(()) => return Ok(Some(domain)),
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Failed to activate domain, trying next");
                }
            }
        }
        Ok(None)
    }

    /// Drive a `CreatePending` worker toward `CreateAcked`.
    ///
    /// On any failure the worker stays pending and the next tick retries.
    async fn try_complete_create(&mut self, domain: &DomainId) {
        let address = match self.worker_address_with_backoff(domain).await {
            Ok(Some(address)) => address,
            Ok(None) => {
                debug!(domain = %domain, "Worker address not yet available, still booting");
                return;
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "Address lookup failed");
                return;
            }
        };
        self.registry.set_address(domain, address.clone()).await;

        match self.notifier.notify(Command::ScaleOut(address)).await {
            Ok(Reply::Success) => {
                self.registry
                    .set_state(domain, NotifyState::CreateAcked)
                    .await;
                self.settle_remaining = self.config.settle_rounds;
                info!(domain = %domain, "Worker registration acknowledged");
            }
            Ok(Reply::Failed) => {
                warn!(domain = %domain, "Dispatcher rejected registration, will retry");
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "Registration notification failed, will retry");
            }
        }
    }

    /// Drive a `ShutdownPending` worker toward removal.
    ///
    /// Removal requires both the dispatcher acknowledgment and a confirmed
    /// hypervisor shutdown; on either failure the worker stays pending.
    async fn try_complete_shutdown(&mut self, domain: &DomainId) {
        let address = match self.registry.get(domain).await.and_then(|s| s.address) {
            Some(address) => address,
            None => {
                warn!(domain = %domain, "Shutdown-pending worker has no address, cannot notify");
                return;
            }
        };

        match self.notifier.notify(Command::ScaleIn(address)).await {
            Ok(Reply::Success) => {}
            Ok(Reply::Failed) => {
                warn!(domain = %domain, "Dispatcher rejected deregistration, will retry");
                return;
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "Deregistration notification failed, will retry");
                return;
            }
        }

        match self.hypervisor.shutdown(domain).await {
            Ok(()) => {
                self.registry
                    .set_state(domain, NotifyState::ShutdownAcked)
                    .await;
                self.registry.remove(domain).await;
                info!(domain = %domain, "Worker shut down and deregistered");
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "Hypervisor shutdown failed, will retry");
            }
        }
    }

    /// Resolve a worker's address with bounded exponential backoff.
    ///
    /// `Ok(None)` means the address is still not available after all
    /// attempts; the caller leaves the worker pending.
    async fn worker_address_with_backoff(&self, domain: &DomainId) -> Result<Option<String>> {
        let mut backoff = self.config.address_backoff;
        for attempt in 0..self.config.address_attempts {
            if let Some(address) = self.hypervisor.worker_address(domain).await? {
                return Ok(Some(address));
            }
            debug!(
                domain = %domain,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "Worker address not yet available"
            );
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
        Ok(None)
    }
}

/// Discover the managed pool at startup.
///
/// Fatal when the hypervisor reports no domains at all, or when no worker
/// can be activated: a control plane with no managed pool has no recovery
/// path. Discovered active workers enter the registry pending; the first
/// tick or the reconciler registers them with the dispatcher.
pub async fn bootstrap(hypervisor: &dyn Hypervisor, registry: &WorkerRegistry) -> Result<()> {
    let domains = hypervisor
        .list_domains()
        .await
        .context("enumerating domains")?;
    if domains.is_empty() {
        anyhow::bail!("hypervisor reports no domains, nothing to manage");
    }
    info!(domain_count = domains.len(), "Discovered domains");

    let mut active = Vec::new();
    for domain in &domains {
        if hypervisor.is_active(domain).await? {
            active.push(domain.clone());
        }
    }

    if active.is_empty() {
        let first = &domains[0];
        hypervisor
            .create(first)
            .await
            .with_context(|| format!("starting initial worker {first}"))?;
        info!(domain = %first, "No active worker found, started one");
        active.push(first.clone());
    } else {
        info!(active_count = active.len(), "Active workers discovered");
    }

    for domain in active {
        registry.insert(WorkerStat::new(domain)).await;
    }
    Ok(())
}
