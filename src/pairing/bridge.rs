//! Pairing transport backed by an external bridge helper process.
//!
//! The bridge is the component that actually speaks the messaging
//! protocol. One helper process is spawned per pairing attempt with the
//! session directory and account number in its environment. It persists
//! credential material into the session directory itself and reports
//! progress as newline-delimited JSON on stdout:
//!
//! ```json
//! {"event": "code", "code": "ABCD-1234"}
//! {"event": "open", "session_id": "15551234567:12@s.whatsapp.net"}
//! {"event": "rejected", "reason": "rate limited"}
//! {"event": "close", "reason": "connection lost"}
//! {"event": "log", "message": "anything"}
//! ```
//!
//! Closing the link kills the helper. A helper that exits before sending
//! `open` is reported as [`PairingEvent::Closed`].

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::codec::BridgeCodec;
use super::{PairingEvent, PairingLink, PairingRequest, PairingTransport};
use crate::orchestrator::deployer::ALLOWED_ENV_VARS;
use crate::{AppError, Result};

/// Wire envelope emitted by the bridge.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum BridgeMessage {
    Code { code: String },
    Open { session_id: Option<String> },
    Rejected { reason: Option<String> },
    Close { reason: Option<String> },
    Log { message: String },
}

/// Parse one bridge output line.
///
/// Returns `Ok(None)` for blank lines and `log` messages.
///
/// # Errors
///
/// Returns `AppError::Validation` if the line is not a known bridge event.
pub fn parse_bridge_line(phone_number: &str, line: &str) -> Result<Option<PairingEvent>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let message: BridgeMessage = serde_json::from_str(trimmed)
        .map_err(|e| AppError::Validation(format!("malformed bridge event: {e}")))?;

    let event = match message {
        BridgeMessage::Code { code } => PairingEvent::CodeIssued(code),
        BridgeMessage::Open { session_id } => PairingEvent::Connected {
            session_id: session_id.unwrap_or_else(|| phone_number.to_owned()),
        },
        BridgeMessage::Rejected { reason } => PairingEvent::Rejected {
            reason: reason.unwrap_or_else(|| "handshake rejected".to_owned()),
        },
        BridgeMessage::Close { reason } => PairingEvent::Closed {
            reason: reason.unwrap_or_else(|| "connection closed".to_owned()),
        },
        BridgeMessage::Log { message } => {
            debug!(bridge_log = %message, "pairing bridge log");
            return Ok(None);
        }
    };

    Ok(Some(event))
}

/// Spawns the configured bridge command for each pairing attempt.
#[derive(Debug, Clone)]
pub struct BridgeTransport {
    command: Vec<String>,
}

impl BridgeTransport {
    /// Create a transport that launches `command` (program followed by args).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `command` is empty.
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(AppError::Config("bridge command must not be empty".into()));
        }
        Ok(Self { command })
    }

    async fn open_bridge(&self, request: PairingRequest) -> Result<PairingLink> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| AppError::Config("bridge command must not be empty".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args);

        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }

        cmd.env("SESSION_PATH", &request.session_dir)
            .env("PHONE_NUMBER", &request.phone_number)
            .env("OWNER_ID", &request.owner_id)
            .env("BOT_ID", &request.bot_id)
            .current_dir(&request.session_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::ConnectionClosed(format!("failed to start bridge: {err}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::ConnectionClosed("failed to capture bridge stdout".into()))?;
        let stderr = child.stderr.take();

        info!(
            owner = %request.owner_id,
            bot_id = %request.bot_id,
            pid = child.id().unwrap_or(0),
            "pairing bridge started"
        );

        let (event_tx, event_rx) = mpsc::channel(16);
        let close = CancellationToken::new();

        if let Some(stderr) = stderr {
            let bot_id = request.bot_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(bot_id, stderr = %line, "pairing bridge stderr");
                }
            });
        }

        let span = tracing::info_span!("pairing_bridge", bot_id = %request.bot_id);
        let task_close = close.clone();
        let phone_number = request.phone_number;
        tokio::spawn(
            async move {
                let mut framed = FramedRead::new(stdout, BridgeCodec::new());
                loop {
                    tokio::select! {
                        biased;

                        () = task_close.cancelled() => {
                            debug!("closing pairing bridge");
                            if let Err(err) = child.kill().await {
                                warn!(%err, "failed to kill pairing bridge");
                            }
                            break;
                        }

                        item = framed.next() => {
                            match item {
                                None => {
                                    let reason = match child.wait().await {
                                        Ok(status) => format!("bridge exited ({status})"),
                                        Err(err) => format!("bridge wait failed: {err}"),
                                    };
                                    let _ = event_tx.send(PairingEvent::Closed { reason }).await;
                                    break;
                                }
                                Some(Err(AppError::Validation(msg))) => {
                                    warn!(error = %msg, "pairing bridge framing error, skipping");
                                }
                                Some(Err(err)) => {
                                    let reason = format!("bridge stream error: {err}");
                                    let _ = event_tx.send(PairingEvent::Closed { reason }).await;
                                    break;
                                }
                                Some(Ok(line)) => match parse_bridge_line(&phone_number, &line) {
                                    Ok(Some(event)) => {
                                        if event_tx.send(event).await.is_err() {
                                            debug!("pairing link dropped, stopping bridge reader");
                                            let _ = child.kill().await;
                                            break;
                                        }
                                    }
                                    Ok(None) => {}
                                    Err(err) => {
                                        warn!(%err, raw_line = %line, "unparseable bridge line, skipping");
                                    }
                                },
                            }
                        }
                    }
                }
            }
            .instrument(span),
        );

        Ok(PairingLink::new(event_rx, close))
    }
}

impl PairingTransport for BridgeTransport {
    fn open(
        &self,
        request: PairingRequest,
    ) -> Pin<Box<dyn Future<Output = Result<PairingLink>> + Send + '_>> {
        Box::pin(self.open_bridge(request))
    }
}
