//! Local IPC server for `botdock-ctl`.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Each line is one JSON command routed to
//! a lifecycle operation.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "list"}
//! {"command": "list", "owner": "user-1"}
//! {"command": "status", "id": "bot-1"}
//! {"command": "deploy", "id": "bot-1"}
//! {"command": "pair", "id": "bot-1", "number": "+1 555 123 4567"}
//! {"command": "session", "owner": "user-1", "bot": "bot-1"}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "bot bot-9 not found"}
//! ```

use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::orchestrator::lifecycle;
use crate::state::AppState;
use crate::{AppError, Result};

/// Inbound request from `botdock-ctl`.
#[derive(Debug, Default, Deserialize)]
pub struct IpcRequest {
    /// Command verb.
    pub command: String,
    /// Bot identifier.
    pub id: Option<String>,
    /// Owner identifier (`list`, `session`).
    pub owner: Option<String>,
    /// Bot identifier for `session`.
    pub bot: Option<String>,
    /// Account number for `pair`.
    pub number: Option<String>,
    /// Shared-secret authentication token.
    pub auth_token: Option<String>,
}

/// Outbound response to `botdock-ctl`.
#[derive(Debug, Serialize, PartialEq)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    fn from_result<T: Serialize>(result: Result<T>) -> Self {
        match result.and_then(|value| serde_json::to_value(value).map_err(AppError::from)) {
            Ok(data) => Self::success(data),
            Err(err) => Self::error(err.message()),
        }
    }
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    state: Arc<AppState>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = state.config.ipc_name.clone();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let span = info_span!("ipc_server", name = %name);
    let handle = tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                let state = Arc::clone(&state);
                                tokio::spawn(handle_connection(stream, state));
                            }
                            Err(err) => warn!(%err, "IPC accept failed"),
                        }
                    }
                }
            }
        }
        .instrument(span),
    );

    Ok(handle)
}

async fn handle_connection(stream: interprocess::local_socket::tokio::Stream, state: Arc<AppState>) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch_command(&request, &state).await,
                        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Route one command to its lifecycle operation.
pub async fn dispatch_command(request: &IpcRequest, state: &AppState) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);
    async {
        if let Some(ref expected) = state.ipc_auth_token {
            match request.auth_token {
                Some(ref provided) if provided == expected => {}
                _ => {
                    warn!("IPC request rejected: invalid auth token");
                    return IpcResponse::error("unauthorized");
                }
            }
        }

        match request.command.as_str() {
            "list" => handle_list(request, state).await,
            "status" => with_id(request, |id| lifecycle::bot_status(state, id)).await,
            "deploy" => with_id(request, |id| lifecycle::deploy_bot(state, id)).await,
            "stop" => {
                with_id(request, |id| async move {
                    lifecycle::stop_bot(state, id)
                        .await
                        .map(|stopped| json!({ "stopped": stopped }))
                })
                .await
            }
            "restart" => with_id(request, |id| lifecycle::restart_bot(state, id)).await,
            "pair" => handle_pair(request, state).await,
            "session" => handle_session(request, state).await,
            other => IpcResponse::error(format!("unknown command: {other}")),
        }
    }
    .instrument(span)
    .await
}

async fn with_id<'a, F, Fut, T>(request: &'a IpcRequest, op: F) -> IpcResponse
where
    F: FnOnce(&'a str) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
    T: Serialize,
{
    let Some(ref id) = request.id else {
        return IpcResponse::error("missing required 'id' field");
    };
    IpcResponse::from_result(op(id).await)
}

async fn handle_list(request: &IpcRequest, state: &AppState) -> IpcResponse {
    let bots = match request.owner {
        Some(ref owner) => state.bots.list_by_owner(owner).await,
        None => state.bots.list_all().await,
    };
    let bots = match bots {
        Ok(bots) => bots,
        Err(err) => return IpcResponse::error(format!("failed to list bots: {err}")),
    };

    let mut items = Vec::with_capacity(bots.len());
    for bot in bots {
        let running = state.deployer.is_running(&bot.id).await;
        items.push(json!({
            "id": bot.id,
            "name": bot.name,
            "owner_id": bot.owner_id,
            "status": bot.status.as_str(),
            "pairing_status": bot.pairing_status.as_str(),
            "pid": bot.pid,
            "running": running,
            "updated_at": bot.updated_at.to_rfc3339(),
        }));
    }
    IpcResponse::success(json!({ "bots": items }))
}

async fn handle_pair(request: &IpcRequest, state: &AppState) -> IpcResponse {
    let (Some(id), Some(number)) = (&request.id, &request.number) else {
        return IpcResponse::error("missing required 'id' or 'number' field");
    };
    IpcResponse::from_result(
        lifecycle::request_pairing(state, id, number)
            .await
            .map(|code| json!({ "code": code })),
    )
}

async fn handle_session(request: &IpcRequest, state: &AppState) -> IpcResponse {
    let (Some(owner), Some(bot)) = (&request.owner, &request.bot) else {
        return IpcResponse::error("missing required 'owner' or 'bot' field");
    };
    IpcResponse::from_result(state.sessions.info(owner, bot).await)
}
