//! Filesystem-backed session store and status resolver.
//!
//! Layout, one directory per (owner, bot) under the sessions root:
//!
//! ```text
//! <sessions_root>/<owner>/<bot>/creds.json   credential material (opaque)
//! <sessions_root>/<owner>/<bot>/status.json  SessionRecord, written atomically
//! ```
//!
//! The resolver never opens a protocol connection: `connected` is read
//! strictly from the persisted status record, and only when the credential
//! artifact is present.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::atomic::write_json_atomic;
use crate::models::session::{
    NotConnectedReason, SessionCheck, SessionInfo, SessionRecord, SessionState,
};
use crate::paths::scoped_dir;
use crate::{AppError, Result};

/// Credential artifact written by the protocol layer.
pub const CREDS_FILE: &str = "creds.json";

/// Status record written by the pairing manager.
pub const STATUS_FILE: &str = "status.json";

/// Session directory manager rooted at the configured sessions root.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// Create a store rooted at `root`.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Root directory holding all sessions.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for one (owner, bot) session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if either identifier is unsafe.
    pub fn session_dir(&self, owner_id: &str, bot_id: &str) -> Result<PathBuf> {
        scoped_dir(&self.root, owner_id, bot_id)
    }

    /// Remove any existing session directory and create an empty one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` on filesystem failure.
    pub async fn reset(&self, owner_id: &str, bot_id: &str) -> Result<PathBuf> {
        let dir = self.session_dir(owner_id, bot_id)?;
        remove_dir_if_exists(&dir).await?;
        tokio::fs::create_dir_all(&dir).await.map_err(|err| {
            AppError::Session(format!("failed to create {}: {err}", dir.display()))
        })?;
        Ok(dir)
    }

    /// Atomically write the status record for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` if the record cannot be written.
    pub fn write_record(&self, owner_id: &str, bot_id: &str, record: &SessionRecord) -> Result<()> {
        let path = self.session_dir(owner_id, bot_id)?.join(STATUS_FILE);
        write_json_atomic(&path, record)
            .map_err(|err| AppError::Session(format!("failed to write status record: {err}")))
    }

    /// Read the status record, if present and parseable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if either identifier is unsafe.
    pub async fn read_record(&self, owner_id: &str, bot_id: &str) -> Result<Option<SessionRecord>> {
        let path = self.session_dir(owner_id, bot_id)?.join(STATUS_FILE);
        Ok(read_record_at(&path).await)
    }

    /// Delete a session directory. Returns `true` when something was removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` on filesystem failure.
    pub async fn delete(&self, owner_id: &str, bot_id: &str) -> Result<bool> {
        let dir = self.session_dir(owner_id, bot_id)?;
        remove_dir_if_exists(&dir).await
    }

    /// Report whether a session exists and is authorized.
    ///
    /// Pure read: directory absence, missing credentials, and a missing or
    /// corrupt status record all resolve to `connected: false`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if either identifier is unsafe.
    pub async fn check_status(&self, owner_id: &str, bot_id: &str) -> Result<SessionCheck> {
        let dir = self.session_dir(owner_id, bot_id)?;

        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(SessionCheck::absent());
        }

        if !tokio::fs::try_exists(dir.join(CREDS_FILE))
            .await
            .unwrap_or(false)
        {
            return Ok(SessionCheck::not_connected(
                NotConnectedReason::NoCreds,
                read_record_at(&dir.join(STATUS_FILE)).await,
            ));
        }

        let Some(record) = read_record_at(&dir.join(STATUS_FILE)).await else {
            return Ok(SessionCheck::not_connected(
                NotConnectedReason::StatusUnreadable,
                None,
            ));
        };

        if record.status == SessionState::Connected {
            Ok(SessionCheck {
                exists: true,
                connected: true,
                reason: None,
                record: Some(record),
            })
        } else {
            Ok(SessionCheck::not_connected(
                NotConnectedReason::NotPaired,
                Some(record),
            ))
        }
    }

    /// Status check plus the list of files in the session directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if either identifier is unsafe, or
    /// `AppError::Session` if the directory cannot be listed.
    pub async fn info(&self, owner_id: &str, bot_id: &str) -> Result<SessionInfo> {
        let dir = self.session_dir(owner_id, bot_id)?;
        let check = self.check_status(owner_id, bot_id).await?;

        let mut files = Vec::new();
        if check.exists {
            let mut entries = tokio::fs::read_dir(&dir).await.map_err(|err| {
                AppError::Session(format!("failed to list {}: {err}", dir.display()))
            })?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| AppError::Session(format!("failed to list session: {err}")))?
            {
                files.push(entry.file_name().to_string_lossy().into_owned());
            }
            files.sort();
        }

        Ok(SessionInfo {
            path: dir.to_string_lossy().into_owned(),
            check,
            files,
        })
    }
}

async fn read_record_at(path: &Path) -> Option<SessionRecord> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) => {
            debug!(path = %path.display(), %err, "session status record not readable");
            return None;
        }
    };

    match serde_json::from_slice(&raw) {
        Ok(record) => Some(record),
        Err(err) => {
            warn!(path = %path.display(), %err, "session status record is corrupt");
            None
        }
    }
}

async fn remove_dir_if_exists(dir: &Path) -> Result<bool> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(AppError::Session(format!(
            "failed to remove {}: {err}",
            dir.display()
        ))),
    }
}
