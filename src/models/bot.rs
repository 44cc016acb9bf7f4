//! Bot record model, patch type and per-bot runtime configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status for a deployed bot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    /// Created, waiting for pairing or deployment.
    Pending,
    /// A pairing attempt is in flight.
    Pairing,
    /// The last pairing attempt failed.
    PairingFailed,
    /// A supervised process is running.
    Online,
    /// Stopped cleanly, by request or zero exit.
    Offline,
    /// A stop-then-deploy cycle is in progress.
    Restarting,
    /// Deployment failed or the process died with a failure.
    Error,
}

impl BotStatus {
    /// Wire representation stored in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Pairing => "pairing",
            Self::PairingFailed => "pairing_failed",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Restarting => "restarting",
            Self::Error => "error",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "pairing" => Some(Self::Pairing),
            "pairing_failed" => Some(Self::PairingFailed),
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            "restarting" => Some(Self::Restarting),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Pairing progress as recorded on the bot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    /// No attempt has been made.
    #[default]
    None,
    /// Code issued, waiting for the user to enter it.
    Pairing,
    /// Handshake completed.
    Connected,
    /// Handshake rejected or connection closed early.
    Failed,
    /// No handshake event within the deadline.
    TimedOut,
}

impl PairingStatus {
    /// Wire representation stored in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pairing => "pairing",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "pairing" => Some(Self::Pairing),
            "connected" => Some(Self::Connected),
            "failed" => Some(Self::Failed),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }
}

/// Bot domain entity persisted in `SQLite`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Bot {
    /// Unique record identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Owning account identifier.
    pub owner_id: String,
    /// Source repository URL.
    pub repo_url: String,
    /// Current lifecycle status.
    pub status: BotStatus,
    /// Messaging account number assigned to the bot.
    pub phone_number: Option<String>,
    /// Most recent pairing code.
    pub pairing_code: Option<String>,
    /// Pairing progress.
    pub pairing_status: PairingStatus,
    /// OS process id, only while a process is registered.
    pub pid: Option<u32>,
    /// Last failure message.
    pub error: Option<String>,
    /// Recent log lines, most recent last.
    pub logs: Vec<String>,
    /// Last successful deployment.
    pub deployed_at: Option<DateTime<Utc>>,
    /// Last restart request.
    pub last_restart_at: Option<DateTime<Utc>>,
    /// Last stop, requested or not.
    pub last_stopped_at: Option<DateTime<Utc>>,
    /// Last time the monitor corrected this record.
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Bot {
    /// Construct a new `pending` bot with a generated identifier.
    #[must_use]
    pub fn new(name: String, owner_id: String, repo_url: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            owner_id,
            repo_url,
            status: BotStatus::Pending,
            phone_number: None,
            pairing_code: None,
            pairing_status: PairingStatus::None,
            pid: None,
            error: None,
            logs: Vec::new(),
            deployed_at: None,
            last_restart_at: None,
            last_stopped_at: None,
            last_checked_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Shallow-merge patch applied by `BotRepo::update`.
///
/// `None` leaves a field untouched. Nullable columns use a nested `Option`
/// so `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BotUpdate {
    /// New lifecycle status.
    pub status: Option<BotStatus>,
    /// New account number.
    pub phone_number: Option<Option<String>>,
    /// New pairing code.
    pub pairing_code: Option<Option<String>>,
    /// New pairing progress.
    pub pairing_status: Option<PairingStatus>,
    /// New process id.
    pub pid: Option<Option<u32>>,
    /// New failure message.
    pub error: Option<Option<String>>,
    /// Replacement log tail.
    pub logs: Option<Vec<String>>,
    /// Deployment timestamp.
    pub deployed_at: Option<DateTime<Utc>>,
    /// Restart timestamp.
    pub last_restart_at: Option<DateTime<Utc>>,
    /// Stop timestamp.
    pub last_stopped_at: Option<DateTime<Utc>>,
    /// Reconciliation timestamp.
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl BotUpdate {
    /// Transition to a status that has no live process: clears `pid`.
    #[must_use]
    pub fn terminal(status: BotStatus) -> Self {
        Self {
            status: Some(status),
            pid: Some(None),
            ..Self::default()
        }
    }

    /// Transition to `error` with a message, clearing `pid`.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(Some(message.into())),
            ..Self::terminal(BotStatus::Error)
        }
    }
}

fn default_prefix() -> String {
    ".".into()
}

fn default_online() -> bool {
    true
}

fn default_welcome_message() -> String {
    "Hello! I'm online and ready. Send .menu to see what I can do.".into()
}

fn default_goodbye_message() -> String {
    "Goodbye! I'm going offline for now.".into()
}

/// Per-bot runtime configuration handed to the bot through `CONFIG_PATH`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BotRuntimeConfig {
    /// Command prefix.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Whether the bot should announce itself as online.
    #[serde(default = "default_online")]
    pub online: bool,
    /// Message sent when the bot comes online.
    #[serde(default = "default_welcome_message")]
    pub welcome_message: String,
    /// Message sent when the bot goes offline.
    #[serde(default = "default_goodbye_message")]
    pub goodbye_message: String,
}

impl Default for BotRuntimeConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            online: default_online(),
            welcome_message: default_welcome_message(),
            goodbye_message: default_goodbye_message(),
        }
    }
}
