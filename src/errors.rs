//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Source repository could not be cloned.
    Clone(String),
    /// Dependency installation step failed.
    Install(String),
    /// No runnable entrypoint was found in the cloned tree.
    NoEntrypoint(String),
    /// Bot process could not be spawned or exited during the grace window.
    Spawn(String),
    /// Pairing attempt exceeded its deadline.
    PairingTimeout(String),
    /// Protocol layer refused the pairing handshake.
    PairingRejected(String),
    /// Protocol connection closed before the handshake completed.
    ConnectionClosed(String),
    /// Session store read or write failure.
    Session(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Operation conflicts with one already in flight.
    Conflict(String),
    /// Caller-supplied input failed validation.
    Validation(String),
    /// IPC communication failure.
    Ipc(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Clone(msg) => write!(f, "clone failed: {msg}"),
            Self::Install(msg) => write!(f, "install failed: {msg}"),
            Self::NoEntrypoint(msg) => write!(f, "no entrypoint: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn failed: {msg}"),
            Self::PairingTimeout(msg) => write!(f, "pairing timeout: {msg}"),
            Self::PairingRejected(msg) => write!(f, "pairing rejected: {msg}"),
            Self::ConnectionClosed(msg) => write!(f, "connection closed: {msg}"),
            Self::Session(msg) => write!(f, "session: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Human-readable message without the category prefix.
    ///
    /// This is what gets written into a bot record's `error` field.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Config(msg)
            | Self::Db(msg)
            | Self::Clone(msg)
            | Self::Install(msg)
            | Self::NoEntrypoint(msg)
            | Self::Spawn(msg)
            | Self::PairingTimeout(msg)
            | Self::PairingRejected(msg)
            | Self::ConnectionClosed(msg)
            | Self::Session(msg)
            | Self::NotFound(msg)
            | Self::Conflict(msg)
            | Self::Validation(msg)
            | Self::Ipc(msg)
            | Self::Io(msg) => msg,
        }
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Io(format!("json: {err}"))
    }
}
