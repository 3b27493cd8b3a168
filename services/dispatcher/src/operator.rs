//! Operator command loop.
//!
//! Thin stdin interface for steering the synthetic load: switch the
//! generator between the low-load and high-load pacing bounds, start a
//! swing sweep at an operator-chosen rate, inspect the registry, or shut
//! the process down.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::generator::PaceMode;
use crate::registry::LiveRegistry;

/// Registry summary printed in response to `status`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub workers: usize,
    pub addresses: Vec<String>,
    pub pacing: String,
}

impl StatusReport {
    pub async fn gather(registry: &LiveRegistry, pacing: &PaceMode) -> Self {
        let addresses = registry.addresses().await;
        Self {
            workers: addresses.len(),
            addresses,
            pacing: match pacing {
                PaceMode::Low => "low".to_string(),
                PaceMode::High => "high".to_string(),
                PaceMode::Swing { step } => format!("swing {}ms", step.as_millis()),
            },
        }
    }
}

/// A parsed operator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Pace(PaceMode),
    Status,
    Exit,
}

/// Parse one operator input line.
pub fn parse_command(line: &str) -> Option<OperatorCommand> {
    let mut words = line.split_whitespace();
    let command = match words.next()? {
        "low" => OperatorCommand::Pace(PaceMode::Low),
        "high" => OperatorCommand::Pace(PaceMode::High),
        "swing" => {
            let step_ms: u64 = words.next()?.parse().ok()?;
            if step_ms == 0 {
                return None;
            }
            OperatorCommand::Pace(PaceMode::Swing {
                step: Duration::from_millis(step_ms),
            })
        }
        "status" => OperatorCommand::Status,
        "exit" => OperatorCommand::Exit,
        _ => return None,
    };
    if words.next().is_some() {
        return None;
    }
    Some(command)
}

/// Read operator commands from stdin until `exit` or EOF.
pub async fn run(
    registry: Arc<LiveRegistry>,
    pacing: watch::Sender<PaceMode>,
    shutdown: watch::Sender<bool>,
) {
    info!("Operator loop ready (low | high | swing <step-ms> | status | exit)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            // EOF or a broken stdin both end the loop without ending the
            // process; the other tasks keep running.
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Operator input closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse_command(&line) {
            Some(OperatorCommand::Pace(mode)) => {
                info!(?mode, "Pacing changed");
                let _ = pacing.send(mode);
            }
            Some(OperatorCommand::Status) => {
                let mode = *pacing.borrow();
                let report = StatusReport::gather(&registry, &mode).await;
                match serde_json::to_string(&report) {
                    Ok(json) => println!("{json}"),
                    Err(e) => warn!(error = %e, "Status serialization failed"),
                }
            }
            Some(OperatorCommand::Exit) => {
                info!("Operator requested shutdown");
                let _ = shutdown.send(true);
                break;
            }
            None => {
                warn!(input = %line.trim(), "Unknown operator command");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pace_modes() {
        assert_eq!(
            parse_command("low"),
            Some(OperatorCommand::Pace(PaceMode::Low))
        );
        assert_eq!(
            parse_command("high"),
            Some(OperatorCommand::Pace(PaceMode::High))
        );
        assert_eq!(
            parse_command("swing 250"),
            Some(OperatorCommand::Pace(PaceMode::Swing {
                step: Duration::from_millis(250)
            }))
        );
    }

    #[test]
    fn parses_control_commands() {
        assert_eq!(parse_command("status"), Some(OperatorCommand::Status));
        assert_eq!(parse_command("exit"), Some(OperatorCommand::Exit));
        assert_eq!(parse_command("  exit  "), Some(OperatorCommand::Exit));
    }

    #[tokio::test]
    async fn status_report_serializes() {
        let registry = LiveRegistry::new();
        let mode = PaceMode::Swing {
            step: Duration::from_millis(250),
        };
        let report = StatusReport::gather(&registry, &mode).await;
        let json = serde_json::to_string(&report).unwrap();
        assert_eq!(json, r#"{"workers":0,"addresses":[],"pacing":"swing 250ms"}"#);
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(parse_command("swing"), None);
        assert_eq!(parse_command("swing fast"), None);
        assert_eq!(parse_command("swing 0"), None);
        assert_eq!(parse_command("swing 250 extra"), None);
        assert_eq!(parse_command("reboot"), None);
        assert_eq!(parse_command(""), None);
    }
}
