//! Paced synthetic request generator.
//!
//! Once per pacing interval the generator walks the live registry in
//! address order and sends one `PRIME;REQ:<n>;` request to every worker
//! not marked overloaded. A failed write means the peer is gone before
//! the protocol noticed; that entry is removed on the spot, the one
//! transport-driven registry mutation in the dispatcher.
//!
//! The pacing interval is steered by the operator over a watch channel:
//! a fixed low-load interval, a fixed high-load interval, or a linear
//! swing between the two that reverses direction at either bound.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use vmherd_proto::encode_request;

use crate::registry::LiveRegistry;

/// Operator-selected pacing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceMode {
    /// Fixed interval at the low-load bound.
    Low,
    /// Fixed interval at the high-load bound.
    High,
    /// Sweep linearly between the bounds, stepping once per tick.
    Swing { step: Duration },
}

/// Pacing interval bounds. `low_load` is the longer interval.
#[derive(Debug, Clone, Copy)]
pub struct PacingBounds {
    pub low_load: Duration,
    pub high_load: Duration,
}

impl Default for PacingBounds {
    fn default() -> Self {
        Self {
            low_load: Duration::from_millis(1000),
            high_load: Duration::from_millis(50),
        }
    }
}

/// Inclusive-exclusive range the synthetic request values are drawn from.
#[derive(Debug, Clone, Copy)]
pub struct ValueBounds {
    pub low: u64,
    pub high: u64,
}

impl Default for ValueBounds {
    fn default() -> Self {
        Self { low: 0, high: 50 }
    }
}

/// Step the swing interval once. Sweeping toward high load shortens the
/// interval; the direction flips whenever a bound is reached.
fn sweep(
    interval: Duration,
    step: Duration,
    toward_high: bool,
    bounds: &PacingBounds,
) -> (Duration, bool) {
    if toward_high {
        let next = interval.saturating_sub(step);
        if next <= bounds.high_load {
            (bounds.high_load, false)
        } else {
            (next, true)
        }
    } else {
        let next = interval.saturating_add(step);
        if next >= bounds.low_load {
            (bounds.low_load, true)
        } else {
            (next, false)
        }
    }
}

pub struct Generator {
    registry: Arc<LiveRegistry>,
    bounds: PacingBounds,
    values: ValueBounds,
    pacing: watch::Receiver<PaceMode>,
}

impl Generator {
    pub fn new(
        registry: Arc<LiveRegistry>,
        bounds: PacingBounds,
        values: ValueBounds,
        pacing: watch::Receiver<PaceMode>,
    ) -> Self {
        Self {
            registry,
            bounds,
            values,
            pacing,
        }
    }

    /// Run the paced dispatch loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            low_load_ms = self.bounds.low_load.as_millis() as u64,
            high_load_ms = self.bounds.high_load.as_millis() as u64,
            "Starting request generator"
        );

        let mut pacing = self.pacing.clone();
        let mut counter: u64 = 0;
        let mut interval = self.bounds.low_load;
        let mut toward_high = true;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.dispatch_round(&mut counter).await;

            match *pacing.borrow() {
                PaceMode::Low => {
                    interval = self.bounds.low_load;
                }
                PaceMode::High => {
                    interval = self.bounds.high_load;
                }
                PaceMode::Swing { step } => {
                    (interval, toward_high) = sweep(interval, step, toward_high, &self.bounds);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
                // Wake early so an operator mode change takes effect
                // without waiting out a low-load interval.
                _ = pacing.changed() => {}
            }
        }

        info!(requests = counter, "Request generator shutting down");
    }

    /// Send one request to every eligible worker, removing entries whose
    /// write fails.
    pub async fn dispatch_round(&self, counter: &mut u64) {
        let entries = self.registry.snapshot().await;
        for worker in entries {
            if worker.overloaded {
                debug!(address = %worker.address, "Skipping overloaded worker");
                continue;
            }

            let n = self.draw_value();
            let frame = encode_request(n);
            let result = {
                let mut writer = worker.writer.lock().await;
                writer.write_all(&frame).await
            };
            match result {
                Ok(()) => {
                    *counter += 1;
                    debug!(address = %worker.address, request = *counter, value = n, "Request sent");
                }
                Err(e) => {
                    warn!(address = %worker.address, error = %e, "Write failed, dropping dead connection");
                    self.registry.remove(&worker.address).await;
                }
            }
        }
    }

    fn draw_value(&self) -> u64 {
        let low = self.values.low;
        let high = self.values.high.max(low + 1);
        rand::rng().random_range(low..high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use vmherd_proto::REQUEST_LEN;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn sweep_walks_toward_high_load() {
        let bounds = PacingBounds {
            low_load: ms(1000),
            high_load: ms(50),
        };
        let (next, toward_high) = sweep(ms(500), ms(100), true, &bounds);
        assert_eq!(next, ms(400));
        assert!(toward_high);
    }

    #[test]
    fn sweep_reverses_at_high_bound() {
        let bounds = PacingBounds {
            low_load: ms(1000),
            high_load: ms(50),
        };
        let (next, toward_high) = sweep(ms(100), ms(100), true, &bounds);
        assert_eq!(next, ms(50));
        assert!(!toward_high);
    }

    #[test]
    fn sweep_reverses_at_low_bound() {
        let bounds = PacingBounds {
            low_load: ms(1000),
            high_load: ms(50),
        };
        let (next, toward_high) = sweep(ms(950), ms(100), false, &bounds);
        assert_eq!(next, ms(1000));
        assert!(toward_high);
    }

    async fn registered_worker(registry: &LiveRegistry) -> (TcpStream, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let dispatcher_side = TcpStream::connect(&addr).await.unwrap();
        let (worker_side, _) = listener.accept().await.unwrap();
        registry.register(&addr, dispatcher_side).await;
        (worker_side, addr)
    }

    fn generator(registry: Arc<LiveRegistry>) -> Generator {
        let (_tx, pacing) = watch::channel(PaceMode::Low);
        Generator::new(registry, PacingBounds::default(), ValueBounds::default(), pacing)
    }

    #[tokio::test]
    async fn sends_one_request_per_eligible_worker() {
        let registry = Arc::new(LiveRegistry::new());
        let (mut first, _) = registered_worker(&registry).await;
        let (_second, overloaded_addr) = registered_worker(&registry).await;
        registry.set_overloaded(&overloaded_addr, true).await;

        let gen = generator(Arc::clone(&registry));
        let mut counter = 0;
        gen.dispatch_round(&mut counter).await;

        assert_eq!(counter, 1);
        let mut buf = [0u8; REQUEST_LEN];
        timeout(Duration::from_secs(1), first.read_exact(&mut buf))
            .await
            .expect("eligible worker must receive a request")
            .unwrap();
        assert!(buf.starts_with(b"PRIME;REQ:"));
    }

    #[tokio::test]
    async fn dead_connection_is_removed() {
        let registry = Arc::new(LiveRegistry::new());
        let (worker_side, _addr) = registered_worker(&registry).await;
        drop(worker_side);

        let gen = generator(Arc::clone(&registry));
        let mut counter = 0;
        // The first write after the peer drops may still land in the
        // socket buffer; the reset surfaces within a few rounds.
        for _ in 0..10 {
            if registry.is_empty().await {
                break;
            }
            gen.dispatch_round(&mut counter).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let registry = Arc::new(LiveRegistry::new());
        let gen = generator(registry);
        let (tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { gen.run(shutdown_rx).await });
        tx.send(true).unwrap();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("generator must stop on shutdown")
            .unwrap();
    }
}
