//! Deployment orchestrator.
//!
//! Clones bot source, installs dependencies, locates an entrypoint and
//! spawns the bot as a supervised child process. Each process gets two
//! log reader tasks and one exit watcher. The watcher owns the child
//! handle, so forced kills always go through the handle and never
//! through a pid that may have been reused.
//!
//! Status transitions written here:
//! - `online` after the startup grace window, under the registry lock;
//! - `offline` or `error` from the exit watcher, also under the registry
//!   lock, so the two can never interleave;
//! - `error` for every failed deployment step.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::entrypoint::find_entrypoint;
use super::registry::{ProcessEntry, ProcessExit, ProcessRegistry};
use crate::atomic::write_json_atomic;
use crate::config::{DeployConfig, GlobalConfig, InstallFailurePolicy};
use crate::models::bot::{Bot, BotRuntimeConfig, BotStatus, BotUpdate};
use crate::models::process::{DeployResult, ProcessInfo, ProcessState};
use crate::pairing::store::SessionStore;
use crate::paths::scoped_dir;
use crate::persistence::bot_repo::BotRepo;
use crate::{AppError, Result};

/// Environment variables inherited by bot and bridge processes.
///
/// Everything else is stripped with `env_clear()`; each child's own
/// variables are injected explicitly.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "NODE_PATH",
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "APPDATA",
    "LOCALAPPDATA",
];

/// Longest stdout/stderr line kept; longer lines are discarded.
const MAX_LOG_LINE_BYTES: usize = 8192;

/// Upper bound on waiting for log readers after the process exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Runtime configuration file name inside a bot's config directory.
pub const RUNTIME_CONFIG_FILE: &str = "config.json";

/// Number of distinct port offsets handed out above `base_port`.
const PORT_SPAN: u32 = 1000;

/// Port assigned to a bot: `base_port` plus a stable per-bot offset.
#[must_use]
pub fn bot_port(base_port: u16, bot_id: &str) -> u16 {
    let hash = bot_id
        .bytes()
        .fold(2_166_136_261_u32, |acc, b| (acc ^ u32::from(b)).wrapping_mul(16_777_619));
    let offset = u16::try_from(hash % PORT_SPAN).unwrap_or(0);
    base_port.saturating_add(offset)
}

/// Load the runtime configuration at `path`, writing the default when absent.
///
/// A corrupt file is left untouched and defaults are used.
///
/// # Errors
///
/// Returns `AppError::Io` if the default cannot be written.
pub fn load_runtime_config(path: &Path) -> Result<BotRuntimeConfig> {
    match std::fs::read(path) {
        Ok(raw) => match serde_json::from_slice(&raw) {
            Ok(config) => Ok(config),
            Err(err) => {
                warn!(path = %path.display(), %err, "bot config is corrupt, using defaults");
                Ok(BotRuntimeConfig::default())
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let config = BotRuntimeConfig::default();
            write_json_atomic(path, &config)?;
            info!(path = %path.display(), "wrote default bot config");
            Ok(config)
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "bot config unreadable, using defaults");
            Ok(BotRuntimeConfig::default())
        }
    }
}

/// Spawns, supervises and stops bot processes.
#[derive(Clone)]
pub struct Deployer {
    config: Arc<DeployConfig>,
    deployments_root: PathBuf,
    configs_root: PathBuf,
    sessions: SessionStore,
    repo: BotRepo,
    registry: ProcessRegistry,
    deploying: Arc<std::sync::Mutex<HashSet<String>>>,
}

/// Releases a bot's single-flight slot on drop.
struct DeploySlot {
    deploying: Arc<std::sync::Mutex<HashSet<String>>>,
    bot_id: String,
}

impl Drop for DeploySlot {
    fn drop(&mut self) {
        self.deploying
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.bot_id);
    }
}

/// A successfully spawned process, before the grace window.
struct Spawned {
    pid: u32,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl Deployer {
    /// Create a deployer using the directory layout in `config`.
    #[must_use]
    pub fn new(config: &GlobalConfig, repo: BotRepo, sessions: SessionStore) -> Self {
        Self {
            config: Arc::new(config.deploy.clone()),
            deployments_root: config.deployments_root(),
            configs_root: config.configs_root(),
            sessions,
            repo,
            registry: ProcessRegistry::new(),
            deploying: Arc::new(std::sync::Mutex::new(HashSet::new())),
        }
    }

    /// Registry of live processes.
    #[must_use]
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Directory holding the cloned source for a bot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if either identifier is unsafe.
    pub fn deploy_dir(&self, owner_id: &str, bot_id: &str) -> Result<PathBuf> {
        scoped_dir(&self.deployments_root, owner_id, bot_id)
    }

    /// Path of a bot's runtime configuration file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if either identifier is unsafe.
    pub fn runtime_config_path(&self, owner_id: &str, bot_id: &str) -> Result<PathBuf> {
        Ok(scoped_dir(&self.configs_root, owner_id, bot_id)?.join(RUNTIME_CONFIG_FILE))
    }

    /// Deploy `bot`, replacing any running process.
    ///
    /// Never returns an error: every failure is written into the bot
    /// record and reported through [`DeployResult::error`].
    pub async fn deploy(&self, bot: &Bot) -> DeployResult {
        let span = info_span!("deploy", bot_id = %bot.id, owner = %bot.owner_id);
        async {
            let Some(_slot) = self.claim(&bot.id) else {
                warn!("deployment already in progress");
                return DeployResult::failure("deployment already in progress");
            };

            match self.run_deploy(bot).await {
                Ok(result) => result,
                Err(err) => {
                    let message = err.message().to_owned();
                    warn!(%err, "deployment failed");
                    if let Err(db_err) = self.repo.update(&bot.id, BotUpdate::failed(&message)).await {
                        warn!(%db_err, "failed to record deployment failure");
                    }
                    DeployResult::failure(message)
                }
            }
        }
        .instrument(span)
        .await
    }

    fn claim(&self, bot_id: &str) -> Option<DeploySlot> {
        let mut deploying = self
            .deploying
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !deploying.insert(bot_id.to_owned()) {
            return None;
        }
        Some(DeploySlot {
            deploying: Arc::clone(&self.deploying),
            bot_id: bot_id.to_owned(),
        })
    }

    async fn run_deploy(&self, bot: &Bot) -> Result<DeployResult> {
        if self.registry.contains(&bot.id).await {
            info!("stopping running process before redeploy");
            self.stop(&bot.id).await;
        }

        let deploy_dir = self.deploy_dir(&bot.owner_id, &bot.id)?;
        match tokio::fs::remove_dir_all(&deploy_dir).await {
            Ok(()) => debug!(dir = %deploy_dir.display(), "removed previous deployment"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(AppError::Io(format!(
                    "failed to clear {}: {err}",
                    deploy_dir.display()
                )));
            }
        }
        if let Some(parent) = deploy_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        self.clone_source(&bot.repo_url, &deploy_dir).await?;

        let has_package = deploy_dir.join(&self.config.manifest_file).is_file();
        if has_package {
            self.install_dependencies(&deploy_dir).await?;
        }

        let main_file = find_entrypoint(&deploy_dir, &self.config)?;

        let config_path = self.runtime_config_path(&bot.owner_id, &bot.id)?;
        let runtime_config = load_runtime_config(&config_path)?;
        debug!(prefix = %runtime_config.prefix, "bot runtime config loaded");

        let spawned = self
            .spawn_bot(bot, &deploy_dir, &main_file, &config_path)
            .await?;
        let pid = self.await_startup(&bot.id, spawned).await?;

        info!(pid, main_file = %main_file, "bot deployed");
        Ok(DeployResult {
            success: true,
            pid: Some(pid),
            deploy_dir: Some(deploy_dir.to_string_lossy().into_owned()),
            main_file: Some(main_file),
            has_package,
            error: None,
        })
    }

    async fn clone_source(&self, repo_url: &str, deploy_dir: &Path) -> Result<()> {
        let (program, args) = self
            .config
            .clone_command
            .split_first()
            .ok_or_else(|| AppError::Config("clone command is empty".into()))?;

        info!(repo_url, "cloning bot source");
        let output = Command::new(program)
            .args(args)
            .arg(repo_url)
            .arg(deploy_dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| AppError::Clone(format!("Failed to clone repository: {err}")))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(AppError::Clone(format!(
                "Failed to clone repository: {}",
                stderr.trim()
            )))
        }
    }

    async fn install_dependencies(&self, deploy_dir: &Path) -> Result<()> {
        let (program, args) = self
            .config
            .install_command
            .split_first()
            .ok_or_else(|| AppError::Config("install command is empty".into()))?;

        info!("installing dependencies");
        let failure = match Command::new(program)
            .args(args)
            .current_dir(deploy_dir)
            .stdin(Stdio::null())
            .output()
            .await
        {
            Ok(output) if output.status.success() => return Ok(()),
            Ok(output) => String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            Err(err) => err.to_string(),
        };

        match self.config.install_failure_policy {
            InstallFailurePolicy::Continue => {
                warn!(error = %failure, "dependency install failed, continuing");
                Ok(())
            }
            InstallFailurePolicy::Abort => Err(AppError::Install(format!(
                "Failed to install dependencies: {failure}"
            ))),
        }
    }

    async fn spawn_bot(
        &self,
        bot: &Bot,
        deploy_dir: &Path,
        main_file: &str,
        config_path: &Path,
    ) -> Result<Spawned> {
        let session_dir = self.sessions.session_dir(&bot.owner_id, &bot.id)?;
        let port = bot_port(self.config.base_port, &bot.id);

        let mut cmd = Command::new(&self.config.runtime_command);
        cmd.arg(main_file);

        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }

        cmd.env("OWNER_ID", &bot.owner_id)
            .env("BOT_ID", &bot.id)
            .env("BOT_NAME", &bot.name)
            .env("BOT_NUMBER", bot.phone_number.as_deref().unwrap_or_default())
            .env("SESSION_PATH", &session_dir)
            .env("CONFIG_PATH", config_path)
            .env("NODE_ENV", "production")
            .env("PORT", port.to_string())
            .env("LOG_LEVEL", &self.config.bot_log_level)
            .current_dir(deploy_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        // Registering under the lock keeps the pid invisible to readers
        // until the entry exists.
        let mut table = self.registry.lock().await;

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Spawn(format!("Failed to start bot process: {err}")))?;
        let pid = child
            .id()
            .ok_or_else(|| AppError::Spawn("bot process exited before registration".into()))?;

        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        table.insert(
            bot.id.clone(),
            ProcessEntry::new(pid, self.config.log_buffer_lines, kill.clone(), exit_rx.clone()),
        );
        drop(table);

        info!(pid, port, main_file, "bot process spawned");

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_log_reader(&bot.id, pid, stdout, ""));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_log_reader(&bot.id, pid, stderr, "ERROR: "));
        }

        let watcher = self.clone();
        let bot_id = bot.id.clone();
        tokio::spawn(
            async move {
                watcher
                    .watch_exit(&bot_id, pid, child, kill, readers, exit_tx)
                    .await;
            }
            .in_current_span(),
        );

        Ok(Spawned { pid, exit: exit_rx })
    }

    /// Wait out the startup grace window, then persist `online`.
    async fn await_startup(&self, bot_id: &str, spawned: Spawned) -> Result<u32> {
        let Spawned { pid, mut exit } = spawned;

        let early_exit =
            tokio::time::timeout(self.config.startup_grace(), exit.wait_for(Option::is_some))
                .await
                .map(|observed| observed.ok().and_then(|seen| *seen));
        if let Ok(observed) = early_exit {
            return Err(immediate_exit(observed.and_then(|e| e.code)));
        }

        let table = self.registry.lock().await;
        let alive = table
            .get(bot_id)
            .is_some_and(|entry| entry.pid == pid && entry.state == ProcessState::Running);
        if !alive {
            drop(table);
            let code = exit
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|seen| *seen)
                .and_then(|e| e.code);
            return Err(immediate_exit(code));
        }

        self.repo
            .update(
                bot_id,
                BotUpdate {
                    status: Some(BotStatus::Online),
                    pid: Some(Some(pid)),
                    error: Some(None),
                    deployed_at: Some(Utc::now()),
                    ..BotUpdate::default()
                },
            )
            .await?;
        drop(table);

        Ok(pid)
    }

    fn spawn_log_reader<R>(
        &self,
        bot_id: &str,
        pid: u32,
        stream: R,
        prefix: &'static str,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let deployer = self.clone();
        let bot_id = bot_id.to_owned();
        tokio::spawn(
            async move {
                let mut lines =
                    FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LOG_LINE_BYTES));
                while let Some(item) = lines.next().await {
                    match item {
                        Ok(line) => deployer.append_log(&bot_id, pid, format!("{prefix}{line}")).await,
                        Err(LinesCodecError::MaxLineLengthExceeded) => {
                            debug!("discarding over-long log line");
                        }
                        Err(LinesCodecError::Io(err)) => {
                            debug!(%err, "log stream closed");
                            break;
                        }
                    }
                }
            }
            .in_current_span(),
        )
    }

    async fn append_log(&self, bot_id: &str, pid: u32, line: String) {
        let mut table = self.registry.lock().await;
        let Some(entry) = table.get_mut(bot_id).filter(|entry| entry.pid == pid) else {
            return;
        };
        let appended = entry.logs.push(line);
        if appended % self.config.log_flush_every != 0 {
            return;
        }

        // Flushed under the lock so snapshots land in append order.
        let patch = BotUpdate {
            logs: Some(entry.logs.tail(self.config.persisted_log_lines)),
            ..BotUpdate::default()
        };
        if let Err(err) = self.repo.update(bot_id, patch).await {
            warn!(%err, "failed to flush bot logs");
        }
        drop(table);
    }

    /// Own the child until it exits, then settle registry and record.
    async fn watch_exit(
        &self,
        bot_id: &str,
        pid: u32,
        mut child: Child,
        kill: CancellationToken,
        readers: Vec<JoinHandle<()>>,
        exit_tx: watch::Sender<Option<ProcessExit>>,
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            () = kill.cancelled() => {
                warn!(pid, "forcing bot process to stop");
                force_kill(&mut child, pid);
                child.wait().await
            }
        };

        let code = match status {
            Ok(status) => status.code(),
            Err(err) => {
                warn!(pid, %err, "failed to observe bot process exit");
                None
            }
        };

        if tokio::time::timeout(READER_DRAIN_TIMEOUT, join_all(readers))
            .await
            .is_err()
        {
            debug!(pid, "log readers still open after exit");
        }

        let mut table = self.registry.lock().await;
        let requested = match table.get_mut(bot_id).filter(|entry| entry.pid == pid) {
            Some(entry) => {
                let requested = entry.state == ProcessState::Stopping;
                entry.state = ProcessState::Stopped;
                entry.exit_code = code;
                let logs = entry.logs.tail(self.config.persisted_log_lines);
                table.remove(bot_id);
                Some((requested, logs))
            }
            None => None,
        };

        if let Some((requested, logs)) = requested {
            let patch = exit_update(code, requested, logs);
            info!(pid, exit_code = ?code, status = patch.status.map(BotStatus::as_str), "bot process exited");
            if let Err(err) = self.repo.update(bot_id, patch).await {
                warn!(%err, "failed to record bot exit");
            }
        }
        drop(table);

        let _ = exit_tx.send(Some(ProcessExit { code }));
    }

    /// Stop a bot's process: SIGTERM, then a forced kill after the grace
    /// period. Returns `false` when nothing is registered for `bot_id`.
    pub async fn stop(&self, bot_id: &str) -> bool {
        let span = info_span!("stop", bot_id = %bot_id);
        async {
            let (pid, mut exit, kill) = {
                let mut table = self.registry.lock().await;
                let Some(entry) = table.get_mut(bot_id) else {
                    debug!("no registered process");
                    return false;
                };
                entry.state = ProcessState::Stopping;
                (entry.pid, entry.exit.clone(), entry.kill.clone())
            };

            if !terminate(pid) {
                kill.cancel();
            }

            let graceful =
                tokio::time::timeout(self.config.stop_grace(), exit.wait_for(Option::is_some))
                    .await
                    .is_ok();
            if !graceful {
                warn!(pid, "bot process ignored SIGTERM, escalating");
                kill.cancel();
                let _ = exit.wait_for(Option::is_some).await.map(|_| ());
            }

            info!(pid, "bot process stopped");
            true
        }
        .instrument(span)
        .await
    }

    /// Stop every registered process.
    pub async fn stop_all(&self) {
        let ids = self.registry.bot_ids().await;
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "stopping all bot processes");
        join_all(ids.iter().map(|id| self.stop(id))).await;
    }

    /// Whether a process is registered for `bot_id`.
    pub async fn is_running(&self, bot_id: &str) -> bool {
        self.registry.contains(bot_id).await
    }

    /// Snapshot of one bot's process.
    pub async fn process_info(&self, bot_id: &str) -> Option<ProcessInfo> {
        self.registry.get(bot_id).await
    }

    /// Snapshot of every registered process.
    pub async fn active_processes(&self) -> Vec<ProcessInfo> {
        self.registry.list().await
    }
}

fn immediate_exit(code: Option<i32>) -> AppError {
    let code = code.map_or_else(|| "signal".to_owned(), |c| c.to_string());
    AppError::Spawn(format!("Bot process exited immediately (code {code})"))
}

/// Terminal record update for an exited process.
fn exit_update(code: Option<i32>, requested: bool, logs: Vec<String>) -> BotUpdate {
    let (status, error) = if requested || code == Some(0) {
        (BotStatus::Offline, None)
    } else {
        let message = code.map_or_else(
            || "Bot process terminated by signal".to_owned(),
            |c| format!("Bot process exited with code {c}"),
        );
        (BotStatus::Error, Some(message))
    };

    BotUpdate {
        status: Some(status),
        pid: Some(None),
        error: Some(error),
        logs: Some(logs),
        last_stopped_at: Some(Utc::now()),
        ..BotUpdate::default()
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => true,
        Err(err) => {
            warn!(pid, %err, "failed to send SIGTERM");
            false
        }
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> bool {
    false
}

/// SIGKILL the whole process group, falling back to the leader alone.
///
/// The caller still owns the unreaped `Child`, so the group id cannot
/// have been reused.
fn force_kill(child: &mut Child, pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Ok(raw) = i32::try_from(pid) {
            match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
                Ok(()) => return,
                Err(err) => warn!(pid, %err, "failed to kill bot process group"),
            }
        }
    }

    if let Err(err) = child.start_kill() {
        warn!(pid, %err, "failed to kill bot process");
    }
}
