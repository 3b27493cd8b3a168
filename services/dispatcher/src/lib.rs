//! vmherd Dispatcher Library
//!
//! The dispatcher owns the live connections to every worker the controller
//! has announced, fans synthetic load out over them, and collects their
//! responses. The controller steers membership over a fixed-frame
//! notification protocol; an operator steers the load shape over stdin.
//!
//! ## Architecture
//!
//! - **Protocol Server**: the registry's sole protocol-driven writer,
//!   applying SCALE_OUT / SCALE_IN / CONSISTENT idempotently
//! - **Request Generator**: paced fan-out of `PRIME` requests, with the
//!   one transport-driven removal path (dead connections)
//! - **Response Collector**: readiness-multiplexed drain of all worker
//!   sockets under a short bounded timeout
//! - **Operator Loop**: stdin commands for pacing and shutdown

pub mod collector;
pub mod config;
pub mod generator;
pub mod operator;
pub mod registry;
pub mod server;

// Re-export commonly used types
pub use collector::Collector;
pub use config::Config;
pub use generator::{Generator, PaceMode, PacingBounds, ValueBounds};
pub use registry::{LiveRegistry, LiveWorker};
pub use server::ProtocolServer;
