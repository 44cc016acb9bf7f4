//! Process registry views and deployment results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a registered bot process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Process is alive.
    Running,
    /// Stop requested; waiting for exit.
    Stopping,
    /// Exit observed.
    Stopped,
}

/// Snapshot of one registered process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProcessInfo {
    /// Bot that owns the process.
    pub bot_id: String,
    /// OS process id.
    pub pid: u32,
    /// Whether the process is still considered alive.
    pub running: bool,
    /// Spawn time.
    pub start_time: DateTime<Utc>,
    /// Seconds since spawn.
    pub uptime_seconds: i64,
    /// Buffered log lines, oldest first.
    pub logs: Vec<String>,
    /// Registry state.
    pub status: ProcessState,
    /// Exit code, once known.
    pub exit_code: Option<i32>,
}

/// Outcome of a deployment, returned to route collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeployResult {
    /// Whether the bot is running.
    pub success: bool,
    /// Process id of the running bot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Directory holding the cloned source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy_dir: Option<String>,
    /// Entrypoint chosen for the spawn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_file: Option<String>,
    /// Whether a dependency manifest was present.
    pub has_package: bool,
    /// Failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeployResult {
    /// Failed deployment with a message.
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}
