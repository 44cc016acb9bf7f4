//! Pairing session status record and resolver results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State persisted in a session's `status.json`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Code issued; handshake not completed.
    Pairing,
    /// Handshake completed; credentials are usable.
    Connected,
}

/// Status record written next to the credential material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionRecord {
    /// Current handshake state.
    pub status: SessionState,
    /// Account number being paired.
    pub phone_number: String,
    /// When the pairing attempt started.
    pub started_at: DateTime<Utc>,
    /// When the protocol layer reported the connection open.
    pub connected_at: Option<DateTime<Utc>>,
    /// Protocol-level session identifier once connected.
    pub session_id: Option<String>,
}

impl SessionRecord {
    /// Fresh record for a new pairing attempt.
    #[must_use]
    pub fn pairing(phone_number: String) -> Self {
        Self {
            status: SessionState::Pairing,
            phone_number,
            started_at: Utc::now(),
            connected_at: None,
            session_id: None,
        }
    }

    /// Promote the record to `connected`.
    #[must_use]
    pub fn connected(mut self, session_id: String) -> Self {
        self.status = SessionState::Connected;
        self.connected_at = Some(Utc::now());
        self.session_id = Some(session_id);
        self
    }
}

/// Why a session exists but is not usable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotConnectedReason {
    /// No credential artifact in the directory.
    NoCreds,
    /// Status record missing or unparseable.
    StatusUnreadable,
    /// Status record says the handshake has not completed.
    NotPaired,
}

/// Result of a side-effect-free session status check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionCheck {
    /// Whether the session directory exists.
    pub exists: bool,
    /// Whether the session is authorized.
    pub connected: bool,
    /// Set when `exists` but not `connected`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<NotConnectedReason>,
    /// Parsed status record, when readable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<SessionRecord>,
}

impl SessionCheck {
    /// No directory for this (owner, bot).
    #[must_use]
    pub fn absent() -> Self {
        Self {
            exists: false,
            connected: false,
            reason: None,
            record: None,
        }
    }

    /// Directory exists but is not usable.
    #[must_use]
    pub fn not_connected(reason: NotConnectedReason, record: Option<SessionRecord>) -> Self {
        Self {
            exists: true,
            connected: false,
            reason: Some(reason),
            record,
        }
    }
}

/// Descriptive view of a session directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionInfo {
    /// Session directory path.
    pub path: String,
    /// Result of the status check.
    pub check: SessionCheck,
    /// File names found in the directory.
    pub files: Vec<String>,
}
