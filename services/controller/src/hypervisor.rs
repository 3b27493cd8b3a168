//! Hypervisor collaborator interface and mock implementation.
//!
//! The hypervisor interface abstracts domain lifecycle operations:
//! - Enumerating domains and their active state
//! - Creating (starting) and shutting down domains
//! - Querying cumulative CPU-time counters
//! - Resolving a domain's worker address (may not exist yet while booting)
//!
//! A mock implementation is provided for testing and development.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

/// Identity of a domain known to the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(String);

impl DomainId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cumulative CPU-time counters for one domain, nanosecond resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuCounters {
    pub total_ns: u64,
    pub user_ns: u64,
    pub system_ns: u64,
}

impl CpuCounters {
    /// Guest-only CPU time: `total - (user + system)`, clamped at 0.
    pub fn guest_ns(&self) -> u64 {
        self.total_ns
            .saturating_sub(self.user_ns.saturating_add(self.system_ns))
    }
}

/// Hypervisor collaborator interface.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Enumerate every domain the hypervisor knows, active or not.
    async fn list_domains(&self) -> Result<Vec<DomainId>>;

    /// Whether the domain is currently running.
    async fn is_active(&self, domain: &DomainId) -> Result<bool>;

    /// Start an inactive domain.
    async fn create(&self, domain: &DomainId) -> Result<()>;

    /// Shut down an active domain.
    async fn shutdown(&self, domain: &DomainId) -> Result<()>;

    /// Current cumulative CPU counters for an active domain.
    async fn cpu_counters(&self, domain: &DomainId) -> Result<CpuCounters>;

    /// The domain's worker address, or `None` while the guest is still
    /// booting and has not acquired one.
    async fn worker_address(&self, domain: &DomainId) -> Result<Option<String>>;
}

/// Per-domain state inside the mock.
struct MockDomain {
    active: bool,
    address: String,
    /// Fraction of one core the simulated guest burns while active.
    guest_load: f64,
    /// Guest time accrued up to `since`.
    accrued_guest_ns: u64,
    since: Instant,
    /// While true, `worker_address` reports not-yet-available.
    booting: bool,
}

impl MockDomain {
    fn guest_ns_now(&self) -> u64 {
        if !self.active {
            return self.accrued_guest_ns;
        }
        let elapsed_ns = self.since.elapsed().as_nanos() as u64;
        self.accrued_guest_ns + (elapsed_ns as f64 * self.guest_load) as u64
    }

    /// Fold accrued time forward so the load rate can change.
    fn checkpoint(&mut self) {
        self.accrued_guest_ns = self.guest_ns_now();
        self.since = Instant::now();
    }
}

/// Mock hypervisor for testing and development.
///
/// Domains accrue synthetic guest CPU time at a configurable rate while
/// active; counters are reported so that `total - (user + system)` equals
/// the accrued guest time.
pub struct MockHypervisor {
    domains: RwLock<BTreeMap<DomainId, MockDomain>>,
    /// Whether create/shutdown calls should fail.
    fail_lifecycle: AtomicBool,
}

impl MockHypervisor {
    /// Create a mock with the given `(name, address)` domains, all inactive.
    pub fn new(domains: impl IntoIterator<Item = (String, String)>) -> Self {
        let now = Instant::now();
        let domains = domains
            .into_iter()
            .map(|(name, address)| {
                (
                    DomainId::new(name),
                    MockDomain {
                        active: false,
                        address,
                        guest_load: 0.0,
                        accrued_guest_ns: 0,
                        since: now,
                        booting: false,
                    },
                )
            })
            .collect();
        Self {
            domains: RwLock::new(domains),
            fail_lifecycle: AtomicBool::new(false),
        }
    }

    /// Make every create/shutdown call fail.
    pub fn fail_lifecycle(&self, fail: bool) {
        self.fail_lifecycle.store(fail, Ordering::SeqCst);
    }

    /// Set the simulated guest load (core fraction) for a domain.
    pub async fn set_load(&self, domain: &DomainId, load: f64) {
        let mut domains = self.domains.write().await;
        if let Some(dom) = domains.get_mut(domain) {
            dom.checkpoint();
            dom.guest_load = load;
        }
    }

    /// Mark a domain as active without going through `create`.
    pub async fn force_active(&self, domain: &DomainId) {
        let mut domains = self.domains.write().await;
        if let Some(dom) = domains.get_mut(domain) {
            dom.checkpoint();
            dom.active = true;
            dom.booting = false;
        }
    }

    /// Control whether `worker_address` reports not-yet-available.
    pub async fn set_booting(&self, domain: &DomainId, booting: bool) {
        let mut domains = self.domains.write().await;
        if let Some(dom) = domains.get_mut(domain) {
            dom.booting = booting;
        }
    }

    async fn with_domain<T>(
        &self,
        domain: &DomainId,
        f: impl FnOnce(&MockDomain) -> T,
    ) -> Result<T> {
        let domains = self.domains.read().await;
        domains
            .get(domain)
            .map(f)
            .ok_or_else(|| anyhow::anyhow!("unknown domain {domain}"))
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn list_domains(&self) -> Result<Vec<DomainId>> {
        let domains = self.domains.read().await;
        Ok(domains.keys().cloned().collect())
    }

    async fn is_active(&self, domain: &DomainId) -> Result<bool> {
        self.with_domain(domain, |d| d.active).await
    }

    async fn create(&self, domain: &DomainId) -> Result<()> {
        if self.fail_lifecycle.load(Ordering::SeqCst) {
            anyhow::bail!("mock hypervisor configured to fail");
        }
        let mut domains = self.domains.write().await;
        let dom = domains
            .get_mut(domain)
            .ok_or_else(|| anyhow::anyhow!("unknown domain {domain}"))?;
        if dom.active {
            anyhow::bail!("domain {domain} already active");
        }
        dom.checkpoint();
        dom.active = true;
        info!(domain = %domain, "[MOCK] Domain started");
        Ok(())
    }

    async fn shutdown(&self, domain: &DomainId) -> Result<()> {
        if self.fail_lifecycle.load(Ordering::SeqCst) {
            anyhow::bail!("mock hypervisor configured to fail");
        }
        let mut domains = self.domains.write().await;
        let dom = domains
            .get_mut(domain)
            .ok_or_else(|| anyhow::anyhow!("unknown domain {domain}"))?;
        dom.checkpoint();
        dom.active = false;
        dom.guest_load = 0.0;
        info!(domain = %domain, "[MOCK] Domain shut down");
        Ok(())
    }

    async fn cpu_counters(&self, domain: &DomainId) -> Result<CpuCounters> {
        self.with_domain(domain, |d| {
            let guest_ns = d.guest_ns_now();
            // Report a fixed overhead split so guest time is recoverable
            // as total - (user + system).
            let user_ns = guest_ns / 20;
            let system_ns = guest_ns / 50;
            CpuCounters {
                total_ns: guest_ns + user_ns + system_ns,
                user_ns,
                system_ns,
            }
        })
        .await
    }

    async fn worker_address(&self, domain: &DomainId) -> Result<Option<String>> {
        self.with_domain(domain, |d| {
            if d.booting {
                debug!(domain = %domain, "[MOCK] Address not yet available");
                None
            } else {
                Some(d.address.clone())
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn mock_with_one() -> (MockHypervisor, DomainId) {
        let hv = MockHypervisor::new([(
            "worker-0".to_string(),
            "127.0.0.1:9100".to_string(),
        )]);
        (hv, DomainId::new("worker-0"))
    }

    #[test]
    fn guest_time_is_total_minus_overhead() {
        let counters = CpuCounters {
            total_ns: 1_000,
            user_ns: 300,
            system_ns: 200,
        };
        assert_eq!(counters.guest_ns(), 500);
    }

    #[test]
    fn guest_time_clamps_at_zero() {
        let counters = CpuCounters {
            total_ns: 100,
            user_ns: 300,
            system_ns: 200,
        };
        assert_eq!(counters.guest_ns(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn mock_accrues_guest_time_while_active() {
        let (hv, id) = mock_with_one();
        hv.create(&id).await.unwrap();
        hv.set_load(&id, 0.5).await;

        let before = hv.cpu_counters(&id).await.unwrap().guest_ns();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let after = hv.cpu_counters(&id).await.unwrap().guest_ns();

        // 2s at half a core is roughly one second of guest time.
        let delta = after - before;
        assert!((900_000_000..=1_100_000_000).contains(&delta), "{delta}");
    }

    #[tokio::test]
    async fn mock_create_twice_fails() {
        let (hv, id) = mock_with_one();
        hv.create(&id).await.unwrap();
        assert!(hv.create(&id).await.is_err());
    }

    #[tokio::test]
    async fn mock_address_while_booting() {
        let (hv, id) = mock_with_one();
        hv.set_booting(&id, true).await;
        assert_eq!(hv.worker_address(&id).await.unwrap(), None);
        hv.set_booting(&id, false).await;
        assert_eq!(
            hv.worker_address(&id).await.unwrap().as_deref(),
            Some("127.0.0.1:9100")
        );
    }
}
