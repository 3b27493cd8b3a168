//! vmherd Controller Library
//!
//! The controller measures worker CPU usage through the hypervisor
//! collaborator, classifies aggregate load with hysteresis, and drives
//! scale-out/scale-in of the worker pool. Every membership change is
//! announced to the dispatcher over a fixed-frame notification protocol
//! and tracked by a per-worker notification state machine until it is
//! acknowledged.
//!
//! ## Architecture
//!
//! - **Decision Engine**: samples CPU, classifies load, scales the pool
//! - **Reconciler**: independently re-confirms every active worker's
//!   registration and repairs registry drift
//! - **Worker Registry**: notification states and rolling CPU samples,
//!   shared by both loops
//! - **Hypervisor**: abstracts domain lifecycle and CPU counters (mock in
//!   dev, a real hypervisor binding in prod)

pub mod config;
pub mod engine;
pub mod hypervisor;
pub mod notify;
pub mod reconciler;
pub mod registry;
pub mod sampler;

// Re-export commonly used types
pub use engine::{bootstrap, Classification, Engine, EngineConfig, Load, TickOutcome};
pub use hypervisor::{CpuCounters, DomainId, Hypervisor, MockHypervisor};
pub use notify::{Notifier, NotifyError, ScriptedNotifier, TcpNotifier};
pub use registry::{NotifyState, WorkerRegistry, WorkerStat};
