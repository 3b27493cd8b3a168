//! Configuration for the dispatcher.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::generator::{PacingBounds, ValueBounds};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Controller-facing listen address.
    pub listen_addr: String,

    /// Low-load pacing interval, milliseconds (the longer sleep).
    pub pace_low_ms: u64,

    /// High-load pacing interval, milliseconds (the shorter sleep).
    pub pace_high_ms: u64,

    /// Lower bound for synthetic request values.
    pub value_low: u64,

    /// Upper bound (exclusive) for synthetic request values.
    pub value_high: u64,

    /// Collector readiness-wait timeout, milliseconds.
    pub poll_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr =
            std::env::var("VMHERD_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:8081".to_string());

        let pace_low_ms = env_u64("VMHERD_PACE_LOW_MS", 1000)?;
        let pace_high_ms = env_u64("VMHERD_PACE_HIGH_MS", 50)?;
        if pace_high_ms == 0 || pace_high_ms > pace_low_ms {
            anyhow::bail!(
                "pacing bounds inverted: VMHERD_PACE_HIGH_MS ({pace_high_ms}) must be \
                 nonzero and at most VMHERD_PACE_LOW_MS ({pace_low_ms})"
            );
        }

        let value_low = env_u64("VMHERD_VALUE_LOW", 0)?;
        let value_high = env_u64("VMHERD_VALUE_HIGH", 50)?;

        let poll_timeout_ms = env_u64("VMHERD_POLL_TIMEOUT_MS", 200)?.max(10);

        let log_level = std::env::var("VMHERD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            pace_low_ms,
            pace_high_ms,
            value_low,
            value_high,
            poll_timeout_ms,
            log_level,
        })
    }

    pub fn pacing_bounds(&self) -> PacingBounds {
        PacingBounds {
            low_load: Duration::from_millis(self.pace_low_ms),
            high_load: Duration::from_millis(self.pace_high_ms),
        }
    }

    pub fn value_bounds(&self) -> ValueBounds {
        ValueBounds {
            low: self.value_low,
            high: self.value_high,
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    std::env::var(name)
        .ok()
        .map(|v| v.parse())
        .transpose()
        .with_context(|| format!("{name} must be an integer"))
        .map(|v| v.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = Config {
            listen_addr: "127.0.0.1:8081".to_string(),
            pace_low_ms: 1000,
            pace_high_ms: 50,
            value_low: 0,
            value_high: 50,
            poll_timeout_ms: 200,
            log_level: "info".to_string(),
        };
        let bounds = config.pacing_bounds();
        assert!(bounds.high_load < bounds.low_load);
        assert_eq!(config.poll_timeout(), Duration::from_millis(200));
    }
}
