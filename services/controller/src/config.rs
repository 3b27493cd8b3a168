//! Configuration for the controller.

use std::time::Duration;

use anyhow::Result;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Dispatcher control-channel address.
    pub dispatcher_addr: String,

    /// Managed domains as `(name, worker_address)` pairs.
    pub domains: Vec<(String, String)>,

    /// Delay between control ticks, seconds.
    pub tick_delay_secs: u64,

    /// Reconciliation interval, seconds.
    pub reconcile_interval_secs: u64,

    /// Consecutive HIGH/LOW ticks required before acting.
    pub patience: u32,

    /// Measurement rounds discarded after a worker joins.
    pub settle_rounds: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let dispatcher_addr = std::env::var("VMHERD_DISPATCHER_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8081".to_string());

        // Comma-separated `name=worker_addr` pairs for the mock pool.
        let domains = match std::env::var("VMHERD_DOMAINS") {
            Ok(spec) => parse_domains(&spec)?,
            Err(_) => default_domains(),
        };

        let tick_delay_secs = std::env::var("VMHERD_TICK_DELAY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2);

        let reconcile_interval_secs = std::env::var("VMHERD_RECONCILE_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let patience = std::env::var("VMHERD_PATIENCE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);

        let settle_rounds = std::env::var("VMHERD_SETTLE_ROUNDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);

        let log_level = std::env::var("VMHERD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            dispatcher_addr,
            domains,
            tick_delay_secs,
            reconcile_interval_secs,
            patience,
            settle_rounds,
            log_level,
        })
    }

    pub fn tick_delay(&self) -> Duration {
        Duration::from_secs(self.tick_delay_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

fn parse_domains(spec: &str) -> Result<Vec<(String, String)>> {
    let mut domains = Vec::new();
    for entry in spec.split(',').filter(|e| !e.trim().is_empty()) {
        let (name, addr) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("bad domain entry {entry:?}, expected name=addr"))?;
        domains.push((name.trim().to_string(), addr.trim().to_string()));
    }
    Ok(domains)
}

fn default_domains() -> Vec<(String, String)> {
    (0..3)
        .map(|n| (format!("worker-{n}"), format!("127.0.0.1:{}", 9100 + n)))
        .collect()
}
