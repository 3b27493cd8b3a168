//! Live-worker registry.
//!
//! The authoritative set of workers the dispatcher is currently sending
//! work to. The protocol server is the only writer, plus the generator's
//! dead-connection removal path. The lock is held only for brief
//! snapshot/mutate steps, never across socket I/O; the generator and
//! collector work from per-iteration snapshots, so membership changes take
//! effect between their loop iterations.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// One worker the dispatcher is actively driving.
#[derive(Clone)]
pub struct LiveWorker {
    /// Worker network address; the registry key.
    pub address: String,

    /// Read half, shared with the response collector.
    pub reader: Arc<Mutex<OwnedReadHalf>>,

    /// Write half, shared with the request generator.
    pub writer: Arc<Mutex<OwnedWriteHalf>>,

    /// Excludes the worker from the request round in progress. No producer
    /// sets this yet; the generator honors it regardless.
    pub overloaded: bool,
}

/// Ordered set of live workers, at most one entry per address.
pub struct LiveRegistry {
    inner: Mutex<BTreeMap<String, LiveWorker>>,
}

impl LiveRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a connected worker. Returns `false` (and drops the stream)
    /// if the address is already registered.
    pub async fn register(&self, address: &str, stream: TcpStream) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.contains_key(address) {
            return false;
        }
        let (reader, writer) = stream.into_split();
        inner.insert(
            address.to_string(),
            LiveWorker {
                address: address.to_string(),
                reader: Arc::new(Mutex::new(reader)),
                writer: Arc::new(Mutex::new(writer)),
                overloaded: false,
            },
        );
        debug!(address = %address, "Worker registered");
        true
    }

    /// Remove a worker, dropping its connection. Returns whether an entry
    /// existed.
    pub async fn remove(&self, address: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let existed = inner.remove(address).is_some();
        if existed {
            debug!(address = %address, "Worker removed");
        }
        existed
    }

    pub async fn contains(&self, address: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.contains_key(address)
    }

    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Registered addresses in registry order.
    pub async fn addresses(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.keys().cloned().collect()
    }

    /// Snapshot of all entries in registry order.
    pub async fn snapshot(&self) -> Vec<LiveWorker> {
        let inner = self.inner.lock().await;
        inner.values().cloned().collect()
    }

    /// Flip a worker's overload exclusion flag.
    pub async fn set_overloaded(&self, address: &str, overloaded: bool) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.get_mut(address) {
            Some(worker) => {
                worker.overloaded = overloaded;
                true
            }
            None => false,
        }
    }
}

impl Default for LiveRegistry {
    fn default() -> Self {
        Self::new()
    }
}
