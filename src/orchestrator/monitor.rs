//! Process monitor: periodic reconciliation of bot records.
//!
//! Each tick corrects drift between persisted status and the process
//! registry, and auto-deploys bots whose pairing session has become
//! authorized. The monitor never resurrects a crashed process; it only
//! fixes records and starts bots that were never started.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::bot::{Bot, BotStatus, BotUpdate};
use crate::state::AppState;
use crate::{AppError, Result};

/// Summary of one reconciliation tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Bots corrected from `online` to `offline`.
    pub corrected: Vec<String>,
    /// Bots deployed because their session became authorized.
    pub deployed: Vec<String>,
    /// Bots whose reconciliation failed this tick.
    pub failed: Vec<String>,
}

/// Reconciliation loop with an overlap guard.
#[derive(Clone)]
pub struct ProcessMonitor {
    state: Arc<AppState>,
    busy: Arc<AtomicBool>,
}

/// Clears the overlap guard on drop.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ProcessMonitor {
    /// Create a monitor over `state`.
    #[must_use]
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run one tick. Returns `None` if a previous tick is still running.
    pub async fn run_tick(&self) -> Option<TickReport> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("previous monitor tick still running, skipping");
            return None;
        }
        let _guard = TickGuard(&self.busy);

        let span = info_span!("monitor_tick");
        Some(self.reconcile().instrument(span).await)
    }

    async fn reconcile(&self) -> TickReport {
        let mut report = TickReport::default();

        match self.state.bots.list_by_status(BotStatus::Online).await {
            Ok(bots) => {
                for bot in bots {
                    match self.correct_stale(&bot).await {
                        Ok(true) => report.corrected.push(bot.id),
                        Ok(false) => {}
                        Err(err) => {
                            warn!(bot_id = %bot.id, %err, "monitor failed to reconcile bot");
                            report.failed.push(bot.id);
                        }
                    }
                }
            }
            Err(err) => warn!(%err, "monitor could not list online bots"),
        }

        match self.state.bots.list_by_status(BotStatus::Pending).await {
            Ok(bots) => {
                for bot in bots {
                    match self.deploy_if_authorized(&bot.id).await {
                        Ok(true) => report.deployed.push(bot.id),
                        Ok(false) => {}
                        Err(err) => {
                            warn!(bot_id = %bot.id, %err, "monitor failed to reconcile bot");
                            report.failed.push(bot.id);
                        }
                    }
                }
            }
            Err(err) => warn!(%err, "monitor could not list pending bots"),
        }

        if !report.corrected.is_empty() || !report.deployed.is_empty() || !report.failed.is_empty()
        {
            info!(
                corrected = report.corrected.len(),
                deployed = report.deployed.len(),
                failed = report.failed.len(),
                "monitor tick complete"
            );
        }
        report
    }

    /// Mark an `online` record with no live process `offline`.
    ///
    /// Runs under the registry lock and only while the stored status is
    /// still `online`, so an exit written since the listing is kept.
    async fn correct_stale(&self, bot: &Bot) -> Result<bool> {
        let table = self.state.deployer.registry().lock().await;
        if table.contains_key(&bot.id) {
            return Ok(false);
        }

        let corrected = self
            .state
            .bots
            .update_if_status(
                &bot.id,
                &[BotStatus::Online],
                BotUpdate {
                    last_checked_at: Some(Utc::now()),
                    ..BotUpdate::terminal(BotStatus::Offline)
                },
            )
            .await?;
        drop(table);

        if corrected.is_some() {
            info!(bot_id = %bot.id, stale_pid = ?bot.pid, "online bot has no live process, marked offline");
        }
        Ok(corrected.is_some())
    }

    /// Deploy a `pending` bot whose session has been authorized.
    ///
    /// The record is re-read first; earlier deploys in the same tick may
    /// have taken long enough for it to change.
    async fn deploy_if_authorized(&self, bot_id: &str) -> Result<bool> {
        let Some(bot) = self.state.bots.get_by_id(bot_id).await? else {
            return Ok(false);
        };
        let deployer = &self.state.deployer;
        if bot.status != BotStatus::Pending
            || bot.phone_number.is_none()
            || bot.pid.is_some()
            || deployer.is_running(&bot.id).await
        {
            return Ok(false);
        }

        let session = self
            .state
            .sessions
            .check_status(&bot.owner_id, &bot.id)
            .await?;
        if !session.connected {
            return Ok(false);
        }

        info!(bot_id = %bot.id, "session authorized, deploying");
        let result = deployer.deploy(&bot).await;
        if result.success {
            Ok(true)
        } else {
            Err(AppError::Spawn(
                result.error.unwrap_or_else(|| "deployment failed".into()),
            ))
        }
    }
}

/// Spawn the periodic monitor task. Stops when `ct` is cancelled.
#[must_use]
pub fn spawn_process_monitor(
    monitor: ProcessMonitor,
    ct: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let interval = monitor.state.config.monitor_interval();
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "process monitor started");
        loop {
            tokio::select! {
                () = ct.cancelled() => {
                    info!("process monitor shutting down");
                    break;
                }
                () = tokio::time::sleep(interval) => {}
            }

            monitor.run_tick().await;
        }
    })
}
