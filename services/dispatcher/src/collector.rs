//! Readiness-multiplexed response collector.
//!
//! A single loop waits over every registered worker socket at once with a
//! short bounded timeout, then drains and logs whatever bytes are
//! available. A zero-length read means the peer half-closed; that is not
//! an error and never removes the entry — membership is driven by the
//! protocol, not inferred from the transport.
//!
//! The watch set is re-snapshotted every iteration, so registry changes
//! take effect between iterations.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::select_all;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info};

use vmherd_proto::parse_response;

use crate::registry::{LiveRegistry, LiveWorker};

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(200);

pub struct Collector {
    registry: Arc<LiveRegistry>,
    poll_timeout: Duration,
}

impl Collector {
    pub fn new(registry: Arc<LiveRegistry>, poll_timeout: Duration) -> Self {
        Self {
            registry,
            poll_timeout,
        }
    }

    /// Run the collector loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_timeout_ms = self.poll_timeout.as_millis() as u64,
            "Starting response collector"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let entries = self.registry.snapshot().await;
            if entries.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_timeout) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            let waits = entries
                .iter()
                .map(|worker| {
                    let reader = Arc::clone(&worker.reader);
                    Box::pin(async move {
                        let guard = reader.lock().await;
                        guard.readable().await
                    })
                })
                .collect::<Vec<_>>();

            let became_ready = tokio::select! {
                waited = timeout(self.poll_timeout, select_all(waits)) => waited.is_ok(),
                _ = shutdown.changed() => continue,
            };
            if !became_ready {
                // Timed out: loop around and pick up membership changes.
                continue;
            }

            let mut drained = 0usize;
            for worker in &entries {
                drained += self.drain(worker).await;
            }
            if drained == 0 {
                // Readiness without data (half-closed peers report ready
                // forever). Back off instead of spinning; the entry stays
                // until the protocol removes it.
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_timeout) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!("Response collector shutting down");
    }

    /// Drain available bytes from one worker socket, returning the count.
    async fn drain(&self, worker: &LiveWorker) -> usize {
        let reader = worker.reader.lock().await;
        let mut buf = [0u8; 256];
        let mut total = 0;
        loop {
            match reader.try_read(&mut buf) {
                Ok(0) => {
                    debug!(address = %worker.address, "Worker half-closed, removal is protocol-driven");
                    break;
                }
                Ok(n) => {
                    total += n;
                    match parse_response(&buf[..n]) {
                        Ok((request, sum)) => {
                            info!(address = %worker.address, request, sum, "Worker response");
                        }
                        Err(_) => {
                            let payload = String::from_utf8_lossy(&buf[..n]);
                            info!(
                                address = %worker.address,
                                bytes = n,
                                payload = %payload.trim_end_matches('\0'),
                                "Worker response"
                            );
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(address = %worker.address, error = %e, "Worker read error");
                    break;
                }
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn registry_with_worker() -> (Arc<LiveRegistry>, TcpStream, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let registry = Arc::new(LiveRegistry::new());

        let dispatcher_side = TcpStream::connect(&addr).await.unwrap();
        let (worker_side, _) = listener.accept().await.unwrap();
        registry.register(&addr, dispatcher_side).await;
        (registry, worker_side, addr)
    }

    #[tokio::test]
    async fn drains_worker_bytes() {
        let (registry, mut worker_side, _addr) = registry_with_worker().await;
        let collector = Collector::new(Arc::clone(&registry), DEFAULT_POLL_TIMEOUT);
        let (_tx, shutdown_rx) = watch::channel(false);

        worker_side
            .write_all(b"PRIME;REQ:10;RES_DATA:17;")
            .await
            .unwrap();

        // One bounded iteration drains the response without blocking.
        let run = collector.run(shutdown_rx);
        let _ = timeout(Duration::from_millis(500), run).await;

        // If the bytes were drained, the socket buffer is empty again.
        let entry = &registry.snapshot().await[0];
        let reader = entry.reader.lock().await;
        let mut buf = [0u8; 16];
        assert!(matches!(
            reader.try_read(&mut buf),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock
        ));
    }

    #[tokio::test]
    async fn half_close_does_not_remove_entry() {
        let (registry, worker_side, _addr) = registry_with_worker().await;
        let collector = Collector::new(Arc::clone(&registry), Duration::from_millis(50));
        let (_tx, shutdown_rx) = watch::channel(false);

        drop(worker_side);

        let run = collector.run(shutdown_rx);
        let _ = timeout(Duration::from_millis(300), run).await;

        // Removal is protocol-driven, never inferred from the transport.
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let registry = Arc::new(LiveRegistry::new());
        let collector = Collector::new(registry, Duration::from_millis(20));
        let (tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { collector.run(shutdown_rx).await });
        tx.send(true).unwrap();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("collector must stop on shutdown")
            .unwrap();
    }
}
