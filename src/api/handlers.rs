//! Route handlers. Each is a thin adapter over a lifecycle operation or
//! a session store call.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiError, ApiResult};
use crate::models::process::{DeployResult, ProcessInfo};
use crate::models::session::{SessionCheck, SessionInfo};
use crate::orchestrator::lifecycle::{self, BotStatusView, VerifyResult};
use crate::state::AppState;
use crate::AppError;

/// Body of `POST /bots/{id}/pair`.
#[derive(Debug, Deserialize)]
pub struct PairBody {
    /// Account number to pair with.
    pub number: String,
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn list_processes(State(state): State<Arc<AppState>>) -> Json<Vec<ProcessInfo>> {
    Json(state.deployer.active_processes().await)
}

pub async fn bot_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<BotStatusView> {
    Ok(Json(lifecycle::bot_status(&state, &id).await?))
}

pub async fn deploy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<DeployResult> {
    Ok(Json(lifecycle::deploy_bot(&state, &id).await?))
}

pub async fn stop(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Value> {
    let stopped = lifecycle::stop_bot(&state, &id).await?;
    Ok(Json(json!({ "stopped": stopped })))
}

pub async fn restart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<DeployResult> {
    Ok(Json(lifecycle::restart_bot(&state, &id).await?))
}

pub async fn process_info(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<ProcessInfo> {
    state
        .deployer
        .process_info(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError(AppError::NotFound(format!("no running process for bot {id}"))))
}

pub async fn pair(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<PairBody>,
) -> ApiResult<Value> {
    let code = lifecycle::request_pairing(&state, &id, &body.number).await?;
    Ok(Json(json!({ "code": code })))
}

pub async fn verify(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<VerifyResult> {
    Ok(Json(lifecycle::verify_pairing(&state, &id).await?))
}

pub async fn session_status(
    State(state): State<Arc<AppState>>,
    Path((owner, bot)): Path<(String, String)>,
) -> ApiResult<SessionCheck> {
    Ok(Json(state.sessions.check_status(&owner, &bot).await?))
}

pub async fn session_info(
    State(state): State<Arc<AppState>>,
    Path((owner, bot)): Path<(String, String)>,
) -> ApiResult<SessionInfo> {
    Ok(Json(state.sessions.info(&owner, &bot).await?))
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path((owner, bot)): Path<(String, String)>,
) -> ApiResult<Value> {
    if state.pairing.in_flight(&owner, &bot).await {
        return Err(ApiError(AppError::Conflict(format!(
            "pairing in progress for bot {bot}"
        ))));
    }
    let deleted = state.sessions.delete(&owner, &bot).await?;
    Ok(Json(json!({ "deleted": deleted })))
}
