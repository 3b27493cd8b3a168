//! Notification protocol server.
//!
//! Receives SCALE_OUT / SCALE_IN / CONSISTENT frames from the controller,
//! mutates the live-worker registry, and replies SUCCESS or FAILED. Every
//! command gets exactly one reply frame.
//!
//! Duplicate transitions short-circuit to SUCCESS: the reconciler and the
//! decision engine may legitimately request the same transition twice, and
//! the registry must not change when they do.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use vmherd_proto::{read_frame, write_frame, Command, Frame, FrameError, Reply};

use crate::registry::LiveRegistry;

/// Timeout for opening a connection to a newly announced worker.
pub const WORKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Protocol server owning the controller-facing listen socket.
pub struct ProtocolServer {
    listener: TcpListener,
    registry: Arc<LiveRegistry>,
}

impl ProtocolServer {
    /// Bind the control listener.
    pub async fn bind(bind_addr: &str, registry: Arc<LiveRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!(bind_addr = %listener.local_addr()?, "Protocol server bound");
        Ok(Self { listener, registry })
    }

    /// The bound address, useful when binding to port 0.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept controller connections until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            info!(peer = %peer, "Controller connected");
                            let registry = Arc::clone(&self.registry);
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                handle_controller(stream, registry, shutdown).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Protocol server shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Serve one controller connection: read command frames, apply them, reply.
async fn handle_controller(
    mut stream: TcpStream,
    registry: Arc<LiveRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut stream) => frame,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let reply = match frame {
            Ok(Frame::Command(command)) => apply_command(&registry, command).await,
            Ok(Frame::Reply(_)) => {
                warn!("Reply frame in command position");
                Reply::Failed
            }
            Err(FrameError::Io(e)) => {
                debug!(error = %e, "Controller connection closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Malformed command frame");
                Reply::Failed
            }
        };

        if let Err(e) = write_frame(&mut stream, &Frame::Reply(reply)).await {
            warn!(error = %e, "Failed to write reply, dropping controller connection");
            break;
        }
    }
}

/// Apply one command to the registry and pick the reply.
pub async fn apply_command(registry: &LiveRegistry, command: Command) -> Reply {
    match command {
        Command::ScaleOut(address) | Command::Consistent(address) => {
            // Already registered: idempotent success, no second connection.
            if registry.contains(&address).await {
                debug!(address = %address, "Worker already registered");
                return Reply::Success;
            }
            match connect_worker(&address).await {
                Ok(stream) => {
                    registry.register(&address, stream).await;
                    info!(address = %address, "Worker registered");
                    Reply::Success
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "Worker connection failed");
                    Reply::Failed
                }
            }
        }
        Command::ScaleIn(address) => {
            // Absent entries short-circuit to success.
            if registry.remove(&address).await {
                info!(address = %address, "Worker deregistered");
            } else {
                debug!(address = %address, "Scale-in for unregistered worker");
            }
            Reply::Success
        }
    }
}

async fn connect_worker(address: &str) -> std::io::Result<TcpStream> {
    match timeout(WORKER_CONNECT_TIMEOUT, TcpStream::connect(address)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "worker connect timeout",
        )),
    }
}
