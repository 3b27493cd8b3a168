//! Notification protocol client.
//!
//! The controller keeps one persistent connection to the dispatcher and
//! exchanges fixed-size frames over it, strictly one reply per command.
//! The engine and the reconciler share the client; a mutex serializes
//! their round trips so replies cannot interleave.
//!
//! A failed round trip is reported to the caller and the connection is
//! dropped; the next call reconnects. Repair is owned by the notification
//! state machine, not by this client.

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use vmherd_proto::{read_frame, write_frame, Command, Frame, FrameError, Reply};

/// Notification round-trip errors.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Could not reach the dispatcher.
    #[error("dispatcher unreachable at {addr}: {source}")]
    Unreachable {
        addr: String,
        source: std::io::Error,
    },

    /// Frame exchange failed mid round trip.
    #[error("notification exchange failed: {0}")]
    Exchange(#[from] FrameError),

    /// The dispatcher answered with something other than a reply frame.
    #[error("unexpected frame in reply position")]
    UnexpectedFrame,
}

/// Sends scale/consistency commands and awaits acknowledgment.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, command: Command) -> Result<Reply, NotifyError>;
}

/// `Notifier` over a persistent TCP connection to the dispatcher.
pub struct TcpNotifier {
    dispatcher_addr: String,
    conn: Mutex<Option<TcpStream>>,
}

impl TcpNotifier {
    pub fn new(dispatcher_addr: impl Into<String>) -> Self {
        Self {
            dispatcher_addr: dispatcher_addr.into(),
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<TcpStream, NotifyError> {
        TcpStream::connect(&self.dispatcher_addr)
            .await
            .map_err(|source| NotifyError::Unreachable {
                addr: self.dispatcher_addr.clone(),
                source,
            })
    }
}

#[async_trait]
impl Notifier for TcpNotifier {
    async fn notify(&self, command: Command) -> Result<Reply, NotifyError> {
        let mut conn = self.conn.lock().await;

        let stream = match &mut *conn {
            Some(stream) => stream,
            none => {
                debug!(dispatcher = %self.dispatcher_addr, "Connecting to dispatcher");
                none.insert(self.connect().await?)
            }
        };

        let exchange = async {
            write_frame(stream, &Frame::Command(command.clone())).await?;
            read_frame(stream).await
        };

        match exchange.await {
            Ok(Frame::Reply(reply)) => {
                debug!(command = ?command, reply = ?reply, "Notification acknowledged");
                Ok(reply)
            }
            Ok(Frame::Command(_)) => {
                *conn = None;
                Err(NotifyError::UnexpectedFrame)
            }
            Err(e) => {
                warn!(command = ?command, error = %e, "Notification round trip failed");
                *conn = None;
                Err(e.into())
            }
        }
    }
}

/// Scripted `Notifier` for tests.
///
/// Replies come from a queue of scripted outcomes; once the queue is empty
/// every command succeeds. All commands sent are recorded.
pub struct ScriptedNotifier {
    script: Mutex<std::collections::VecDeque<ScriptedOutcome>>,
    sent: Mutex<Vec<Command>>,
}

enum ScriptedOutcome {
    Reply(Reply),
    Unreachable,
}

impl ScriptedNotifier {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(std::collections::VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Queue one FAILED reply.
    pub async fn push_failed(&self) {
        self.script
            .lock()
            .await
            .push_back(ScriptedOutcome::Reply(Reply::Failed));
    }

    /// Queue one transport failure.
    pub async fn push_unreachable(&self) {
        self.script
            .lock()
            .await
            .push_back(ScriptedOutcome::Unreachable);
    }

    /// Every command sent so far, in order.
    pub async fn sent(&self) -> Vec<Command> {
        self.sent.lock().await.clone()
    }
}

impl Default for ScriptedNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for ScriptedNotifier {
    async fn notify(&self, command: Command) -> Result<Reply, NotifyError> {
        self.sent.lock().await.push(command);
        match self.script.lock().await.pop_front() {
            None | Some(ScriptedOutcome::Reply(Reply::Success)) => Ok(Reply::Success),
            Some(ScriptedOutcome::Reply(reply)) => Ok(reply),
            Some(ScriptedOutcome::Unreachable) => Err(NotifyError::Unreachable {
                addr: "scripted".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "scripted transport failure",
                ),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn reply_server(reply: Reply) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    while let Ok(Frame::Command(_)) = read_frame(&mut stream).await {
                        if write_frame(&mut stream, &Frame::Reply(reply)).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn round_trip_success() {
        let addr = reply_server(Reply::Success).await;
        let notifier = TcpNotifier::new(addr);

        let reply = notifier
            .notify(Command::ScaleOut("10.0.0.1:8080".to_string()))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Success);

        // The connection persists across round trips.
        let reply = notifier
            .notify(Command::Consistent("10.0.0.1:8080".to_string()))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Success);
    }

    #[tokio::test]
    async fn unreachable_dispatcher_is_an_error() {
        // Port from the ephemeral range with nothing bound.
        let notifier = TcpNotifier::new("127.0.0.1:1");
        let err = notifier
            .notify(Command::ScaleIn("10.0.0.1:8080".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn reconnects_after_peer_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // First connection is dropped without a reply; the second gets one.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
            let (mut stream, _) = listener.accept().await.unwrap();
            if let Ok(Frame::Command(_)) = read_frame(&mut stream).await {
                let _ = write_frame(&mut stream, &Frame::Reply(Reply::Success)).await;
            }
        });

        let notifier = TcpNotifier::new(addr);
        let cmd = Command::ScaleOut("10.0.0.1:8080".to_string());

        assert!(notifier.notify(cmd.clone()).await.is_err());
        assert_eq!(notifier.notify(cmd).await.unwrap(), Reply::Success);
    }
}
