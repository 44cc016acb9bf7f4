//! Bot lifecycle operations exposed to the HTTP and IPC layers.
//!
//! Each operation loads the bot record, drives the deployer or the
//! pairing manager, and writes the resulting status back.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::models::bot::{Bot, BotStatus, BotUpdate, PairingStatus};
use crate::models::process::{DeployResult, ProcessInfo};
use crate::models::session::SessionCheck;
use crate::pairing::manager::{normalize_number, PairingOutcome};
use crate::state::AppState;
use crate::{AppError, Result};

/// Bot record combined with the registry's view of its process.
#[derive(Debug, Clone, Serialize)]
pub struct BotStatusView {
    /// Persisted record.
    pub bot: Bot,
    /// Whether a process is registered; authoritative over `bot.status`.
    pub running: bool,
    /// Live process snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessInfo>,
}

/// Result of an explicit pairing verification.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    /// Session status at verification time.
    pub session: SessionCheck,
    /// Deployment triggered by the verification, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployResult>,
}

/// Load a bot with its live process state.
///
/// # Errors
///
/// Returns `AppError::NotFound` if the bot does not exist.
pub async fn bot_status(state: &AppState, bot_id: &str) -> Result<BotStatusView> {
    let bot = state.bots.require(bot_id).await?;
    let process = state.deployer.process_info(bot_id).await;
    Ok(BotStatusView {
        running: process.is_some(),
        bot,
        process,
    })
}

/// Deploy a bot by id.
///
/// # Errors
///
/// Returns `AppError::NotFound` if the bot does not exist. Deployment
/// failures are reported in the returned [`DeployResult`].
pub async fn deploy_bot(state: &AppState, bot_id: &str) -> Result<DeployResult> {
    let bot = state.bots.require(bot_id).await?;
    Ok(state.deployer.deploy(&bot).await)
}

/// Stop a bot. Returns whether a running process was stopped.
///
/// A bot with no registered process is still marked `offline`.
///
/// # Errors
///
/// Returns `AppError::NotFound` if the bot does not exist.
pub async fn stop_bot(state: &AppState, bot_id: &str) -> Result<bool> {
    state.bots.require(bot_id).await?;
    let stopped = state.deployer.stop(bot_id).await;

    let table = state.deployer.registry().lock().await;
    if !stopped && !table.contains_key(bot_id) {
        // Conditional so an exit recorded meanwhile is not overwritten.
        state
            .bots
            .update_if_status(
                bot_id,
                &[BotStatus::Online, BotStatus::Restarting],
                BotUpdate {
                    last_stopped_at: Some(Utc::now()),
                    ..BotUpdate::terminal(BotStatus::Offline)
                },
            )
            .await?;
    }
    drop(table);

    Ok(stopped)
}

/// Stop then redeploy a bot.
///
/// # Errors
///
/// Returns `AppError::NotFound` if the bot does not exist.
pub async fn restart_bot(state: &AppState, bot_id: &str) -> Result<DeployResult> {
    let span = info_span!("restart", bot_id = %bot_id);
    async {
        state.bots.require(bot_id).await?;
        state.deployer.stop(bot_id).await;

        let bot = state
            .bots
            .update(
                bot_id,
                BotUpdate {
                    last_restart_at: Some(Utc::now()),
                    ..BotUpdate::terminal(BotStatus::Restarting)
                },
            )
            .await?;
        info!("restarting bot");

        Ok(state.deployer.deploy(&bot).await)
    }
    .instrument(span)
    .await
}

/// Start pairing a bot to `number` and return the pairing code.
///
/// The outcome is applied to the bot record in the background:
/// `pending` + `connected` on success, `pairing_failed` otherwise.
///
/// # Errors
///
/// - `AppError::NotFound` if the bot does not exist.
/// - `AppError::Conflict` if the bot is running or already pairing.
/// - Any pairing error raised before a code was issued.
pub async fn request_pairing(state: &AppState, bot_id: &str, number: &str) -> Result<String> {
    let bot = state.bots.require(bot_id).await?;
    let span = info_span!("request_pairing", bot_id = %bot.id, owner = %bot.owner_id);

    async {
        if state.deployer.is_running(&bot.id).await {
            return Err(AppError::Conflict(format!(
                "bot {} is running; stop it before pairing",
                bot.id
            )));
        }

        let phone_number = normalize_number(number)?;
        let ticket = match state
            .pairing
            .start_pairing(&phone_number, &bot.owner_id, &bot.id)
            .await
        {
            Ok(ticket) => ticket,
            Err(err @ (AppError::Conflict(_) | AppError::Validation(_))) => return Err(err),
            Err(err) => {
                persist(state, &bot.id, failure_update(&err)).await;
                return Err(err);
            }
        };

        state
            .bots
            .update(
                &bot.id,
                BotUpdate {
                    status: Some(BotStatus::Pairing),
                    phone_number: Some(Some(phone_number)),
                    pairing_code: Some(Some(ticket.code.clone())),
                    pairing_status: Some(PairingStatus::Pairing),
                    error: Some(None),
                    ..BotUpdate::default()
                },
            )
            .await?;

        let watcher = state.clone();
        let watched_id = bot.id.clone();
        tokio::spawn(
            async move {
                match ticket.outcome.await {
                    Ok(PairingOutcome::Connected { .. }) => {
                        persist(&watcher, &watched_id, connected_update()).await;
                    }
                    Ok(PairingOutcome::Failed(err)) => {
                        persist(&watcher, &watched_id, failure_update(&err)).await;
                    }
                    Err(_) => warn!("pairing task ended without an outcome"),
                }
            }
            .in_current_span(),
        );

        Ok(ticket.code)
    }
    .instrument(span)
    .await
}

/// Check the session and deploy when it is authorized and nothing runs.
///
/// # Errors
///
/// Returns `AppError::NotFound` if the bot does not exist.
pub async fn verify_pairing(state: &AppState, bot_id: &str) -> Result<VerifyResult> {
    let bot = state.bots.require(bot_id).await?;
    let session = state.sessions.check_status(&bot.owner_id, &bot.id).await?;

    if !session.connected {
        return Ok(VerifyResult {
            session,
            deploy: None,
        });
    }

    let bot = if bot.pairing_status == PairingStatus::Connected {
        bot
    } else {
        state
            .bots
            .update(
                &bot.id,
                BotUpdate {
                    pairing_status: Some(PairingStatus::Connected),
                    pairing_code: Some(None),
                    ..BotUpdate::default()
                },
            )
            .await?
    };

    if state.deployer.is_running(&bot.id).await {
        return Ok(VerifyResult {
            session,
            deploy: None,
        });
    }

    let deploy = state.deployer.deploy(&bot).await;
    Ok(VerifyResult {
        session,
        deploy: Some(deploy),
    })
}

fn connected_update() -> BotUpdate {
    BotUpdate {
        status: Some(BotStatus::Pending),
        pairing_status: Some(PairingStatus::Connected),
        pairing_code: Some(None),
        error: Some(None),
        ..BotUpdate::default()
    }
}

fn failure_update(err: &AppError) -> BotUpdate {
    let pairing_status = if matches!(err, AppError::PairingTimeout(_)) {
        PairingStatus::TimedOut
    } else {
        PairingStatus::Failed
    };
    BotUpdate {
        status: Some(BotStatus::PairingFailed),
        pairing_status: Some(pairing_status),
        pairing_code: Some(None),
        error: Some(Some(err.message().to_owned())),
        ..BotUpdate::default()
    }
}

async fn persist(state: &AppState, bot_id: &str, patch: BotUpdate) {
    if let Err(err) = state.bots.update(bot_id, patch).await {
        warn!(%err, "failed to record pairing outcome");
    }
}
