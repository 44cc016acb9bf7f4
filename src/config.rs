//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// What to do when the dependency install step fails.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstallFailurePolicy {
    /// Log the failure and attempt to spawn anyway.
    #[default]
    Continue,
    /// Mark the bot `error` and abort the deployment.
    Abort,
}

/// Deployment pipeline settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DeployConfig {
    /// Command used to fetch source; `<repo_url> <target_dir>` are appended.
    #[serde(default = "default_clone_command")]
    pub clone_command: Vec<String>,
    /// Manifest whose presence triggers the install step.
    #[serde(default = "default_manifest_file")]
    pub manifest_file: String,
    /// Install command run inside the deployment directory.
    #[serde(default = "default_install_command")]
    pub install_command: Vec<String>,
    /// Behavior when the install command fails.
    #[serde(default)]
    pub install_failure_policy: InstallFailurePolicy,
    /// Interpreter used to run the entrypoint.
    #[serde(default = "default_runtime_command")]
    pub runtime_command: String,
    /// Conventional entrypoint names, checked in order.
    #[serde(default = "default_entrypoints")]
    pub entrypoints: Vec<String>,
    /// Extension for the top-level source file fallback.
    #[serde(default = "default_source_extension")]
    pub source_extension: String,
    /// How long a fresh process must survive to count as deployed.
    #[serde(default = "default_startup_grace_millis")]
    pub startup_grace_millis: u64,
    /// Grace period between SIGTERM and a forced kill.
    #[serde(default = "default_stop_grace_seconds")]
    pub stop_grace_seconds: u64,
    /// In-memory log lines retained per process.
    #[serde(default = "default_log_buffer_lines")]
    pub log_buffer_lines: usize,
    /// Log lines copied into the bot record on each flush.
    #[serde(default = "default_persisted_log_lines")]
    pub persisted_log_lines: usize,
    /// Flush to the bot record every N appended lines.
    #[serde(default = "default_log_flush_every")]
    pub log_flush_every: usize,
    /// First port handed out to bot processes.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Value of `LOG_LEVEL` injected into bot processes.
    #[serde(default = "default_bot_log_level")]
    pub bot_log_level: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            clone_command: default_clone_command(),
            manifest_file: default_manifest_file(),
            install_command: default_install_command(),
            install_failure_policy: InstallFailurePolicy::default(),
            runtime_command: default_runtime_command(),
            entrypoints: default_entrypoints(),
            source_extension: default_source_extension(),
            startup_grace_millis: default_startup_grace_millis(),
            stop_grace_seconds: default_stop_grace_seconds(),
            log_buffer_lines: default_log_buffer_lines(),
            persisted_log_lines: default_persisted_log_lines(),
            log_flush_every: default_log_flush_every(),
            base_port: default_base_port(),
            bot_log_level: default_bot_log_level(),
        }
    }
}

impl DeployConfig {
    /// Startup grace window as a [`Duration`].
    #[must_use]
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_millis)
    }

    /// SIGTERM-to-kill escalation window as a [`Duration`].
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }
}

/// Pairing handshake settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PairingConfig {
    /// Bridge helper command speaking the NDJSON pairing protocol.
    #[serde(default = "default_bridge_command")]
    pub bridge_command: Vec<String>,
    /// Upper bound on a whole pairing attempt.
    #[serde(default = "default_pairing_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Delay between a successful `open` and closing the connection.
    #[serde(default = "default_close_delay_millis")]
    pub close_delay_millis: u64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            bridge_command: default_bridge_command(),
            timeout_seconds: default_pairing_timeout_seconds(),
            close_delay_millis: default_close_delay_millis(),
        }
    }
}

fn default_clone_command() -> Vec<String> {
    ["git", "clone", "--depth", "1", "--"]
        .iter()
        .map(|s| (*s).to_owned())
        .collect()
}

fn default_manifest_file() -> String {
    "package.json".into()
}

fn default_install_command() -> Vec<String> {
    let npm = if cfg!(windows) { "npm.cmd" } else { "npm" };
    vec![npm.into(), "install".into(), "--omit=dev".into()]
}

fn default_runtime_command() -> String {
    "node".into()
}

fn default_entrypoints() -> Vec<String> {
    ["index.js", "main.js", "bot.js", "app.js", "server.js", "start.js"]
        .iter()
        .map(|s| (*s).to_owned())
        .collect()
}

fn default_source_extension() -> String {
    "js".into()
}

fn default_startup_grace_millis() -> u64 {
    3000
}

fn default_stop_grace_seconds() -> u64 {
    5
}

fn default_log_buffer_lines() -> usize {
    200
}

fn default_persisted_log_lines() -> usize {
    50
}

fn default_log_flush_every() -> usize {
    10
}

fn default_base_port() -> u16 {
    4000
}

fn default_bot_log_level() -> String {
    "info".into()
}

fn default_bridge_command() -> Vec<String> {
    vec!["node".into(), "pairing-bridge.js".into()]
}

fn default_pairing_timeout_seconds() -> u64 {
    120
}

fn default_close_delay_millis() -> u64 {
    3000
}

fn default_monitor_interval_seconds() -> u64 {
    30
}

fn default_http_port() -> u16 {
    3000
}

fn default_ipc_name() -> String {
    "botdock".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Root for sessions, deployments, bot configs and the database.
    pub data_dir: PathBuf,
    /// HTTP port for the route API.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Named pipe / Unix socket identifier.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Seconds between process monitor ticks.
    #[serde(default = "default_monitor_interval_seconds")]
    pub monitor_interval_seconds: u64,
    /// Deployment pipeline settings.
    #[serde(default)]
    pub deploy: DeployConfig,
    /// Pairing handshake settings.
    #[serde(default)]
    pub pairing: PairingConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Directory holding one session directory per (owner, bot).
    #[must_use]
    pub fn sessions_root(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Directory holding one cloned source tree per (owner, bot).
    #[must_use]
    pub fn deployments_root(&self) -> PathBuf {
        self.data_dir.join("deployments")
    }

    /// Directory holding per-bot runtime configuration files.
    #[must_use]
    pub fn configs_root(&self) -> PathBuf {
        self.data_dir.join("configs")
    }

    /// Path of the `SQLite` database file.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("botdock.db")
    }

    /// Monitor tick interval.
    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_seconds)
    }

    fn validate(&mut self) -> Result<()> {
        if self.monitor_interval_seconds == 0 {
            return Err(AppError::Config(
                "monitor_interval_seconds must be greater than zero".into(),
            ));
        }

        if self.deploy.clone_command.is_empty() {
            return Err(AppError::Config("deploy.clone_command must not be empty".into()));
        }

        if self.deploy.install_command.is_empty() {
            return Err(AppError::Config(
                "deploy.install_command must not be empty".into(),
            ));
        }

        if self.deploy.runtime_command.trim().is_empty() {
            return Err(AppError::Config(
                "deploy.runtime_command must not be empty".into(),
            ));
        }

        if self.deploy.log_buffer_lines == 0 || self.deploy.log_flush_every == 0 {
            return Err(AppError::Config(
                "deploy.log_buffer_lines and deploy.log_flush_every must be greater than zero"
                    .into(),
            ));
        }

        if self.pairing.bridge_command.is_empty() {
            return Err(AppError::Config(
                "pairing.bridge_command must not be empty".into(),
            ));
        }

        if self.pairing.timeout_seconds == 0 {
            return Err(AppError::Config(
                "pairing.timeout_seconds must be greater than zero".into(),
            ));
        }

        fs::create_dir_all(&self.data_dir)
            .map_err(|err| AppError::Config(format!("data_dir not creatable: {err}")))?;
        self.data_dir = self
            .data_dir
            .canonicalize()
            .map_err(|err| AppError::Config(format!("data_dir invalid: {err}")))?;

        Ok(())
    }
}
