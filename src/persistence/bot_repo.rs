//! Bot repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};

use crate::models::bot::{Bot, BotStatus, BotUpdate, PairingStatus};
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for bot records.
#[derive(Clone)]
pub struct BotRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct BotRow {
    id: String,
    name: String,
    owner_id: String,
    repo_url: String,
    status: String,
    phone_number: Option<String>,
    pairing_code: Option<String>,
    pairing_status: String,
    pid: Option<i64>,
    error: Option<String>,
    logs: String,
    deployed_at: Option<String>,
    last_restart_at: Option<String>,
    last_stopped_at: Option<String>,
    last_checked_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl BotRow {
    /// Convert a database row into the domain model.
    fn into_bot(self) -> Result<Bot> {
        let status = BotStatus::parse(&self.status)
            .ok_or_else(|| AppError::Db(format!("invalid bot status: {}", self.status)))?;
        let pairing_status = PairingStatus::parse(&self.pairing_status).ok_or_else(|| {
            AppError::Db(format!("invalid pairing status: {}", self.pairing_status))
        })?;
        let pid = self
            .pid
            .map(u32::try_from)
            .transpose()
            .map_err(|e| AppError::Db(format!("invalid pid: {e}")))?;
        let logs: Vec<String> = serde_json::from_str(&self.logs)
            .map_err(|e| AppError::Db(format!("invalid logs: {e}")))?;

        Ok(Bot {
            id: self.id,
            name: self.name,
            owner_id: self.owner_id,
            repo_url: self.repo_url,
            status,
            phone_number: self.phone_number,
            pairing_code: self.pairing_code,
            pairing_status,
            pid,
            error: self.error,
            logs,
            deployed_at: parse_optional_ts(self.deployed_at.as_deref(), "deployed_at")?,
            last_restart_at: parse_optional_ts(self.last_restart_at.as_deref(), "last_restart_at")?,
            last_stopped_at: parse_optional_ts(self.last_stopped_at.as_deref(), "last_stopped_at")?,
            last_checked_at: parse_optional_ts(self.last_checked_at.as_deref(), "last_checked_at")?,
            created_at: parse_ts(&self.created_at, "created_at")?,
            updated_at: parse_ts(&self.updated_at, "updated_at")?,
        })
    }
}

fn parse_ts(raw: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

fn parse_optional_ts(raw: Option<&str>, field: &str) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(s, field)).transpose()
}

fn rows_into_bots(rows: Vec<BotRow>) -> Result<Vec<Bot>> {
    rows.into_iter().map(BotRow::into_bot).collect()
}

impl BotRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new bot record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn create(&self, bot: &Bot) -> Result<Bot> {
        let logs = serde_json::to_string(&bot.logs)
            .map_err(|e| AppError::Db(format!("serialize logs: {e}")))?;

        sqlx::query(
            "INSERT INTO bot (id, name, owner_id, repo_url, status, phone_number,
             pairing_code, pairing_status, pid, error, logs, deployed_at,
             last_restart_at, last_stopped_at, last_checked_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        )
        .bind(&bot.id)
        .bind(&bot.name)
        .bind(&bot.owner_id)
        .bind(&bot.repo_url)
        .bind(bot.status.as_str())
        .bind(&bot.phone_number)
        .bind(&bot.pairing_code)
        .bind(bot.pairing_status.as_str())
        .bind(bot.pid.map(i64::from))
        .bind(&bot.error)
        .bind(&logs)
        .bind(bot.deployed_at.map(|ts| ts.to_rfc3339()))
        .bind(bot.last_restart_at.map(|ts| ts.to_rfc3339()))
        .bind(bot.last_stopped_at.map(|ts| ts.to_rfc3339()))
        .bind(bot.last_checked_at.map(|ts| ts.to_rfc3339()))
        .bind(bot.created_at.to_rfc3339())
        .bind(bot.updated_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        Ok(bot.clone())
    }

    /// Retrieve a bot by identifier.
    ///
    /// Returns `Ok(None)` if the bot does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Bot>> {
        let row: Option<BotRow> = sqlx::query_as("SELECT * FROM bot WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(BotRow::into_bot).transpose()
    }

    /// Retrieve a bot by identifier, failing when absent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the bot does not exist.
    pub async fn require(&self, id: &str) -> Result<Bot> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("bot {id} not found")))
    }

    /// List all bots owned by an account, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Bot>> {
        let rows: Vec<BotRow> =
            sqlx::query_as("SELECT * FROM bot WHERE owner_id = ?1 ORDER BY created_at")
                .bind(owner_id)
                .fetch_all(self.db.as_ref())
                .await?;

        rows_into_bots(rows)
    }

    /// List every bot, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_all(&self) -> Result<Vec<Bot>> {
        let rows: Vec<BotRow> = sqlx::query_as("SELECT * FROM bot ORDER BY created_at")
            .fetch_all(self.db.as_ref())
            .await?;

        rows_into_bots(rows)
    }

    /// List bots in a given lifecycle status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_by_status(&self, status: BotStatus) -> Result<Vec<Bot>> {
        let rows: Vec<BotRow> =
            sqlx::query_as("SELECT * FROM bot WHERE status = ?1 ORDER BY created_at")
                .bind(status.as_str())
                .fetch_all(self.db.as_ref())
                .await?;

        rows_into_bots(rows)
    }

    /// Shallow-merge `patch` into the stored record and stamp `updated_at`.
    ///
    /// Any status other than `online` forces `pid` to `NULL` in the same
    /// statement.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the bot does not exist, or
    /// `AppError::Db` if the update fails.
    pub async fn update(&self, id: &str, patch: BotUpdate) -> Result<Bot> {
        self.apply_update(id, patch, &[])
            .await?
            .ok_or_else(|| AppError::NotFound(format!("bot {id} not found")))
    }

    /// Like [`Self::update`], but only applies while the stored status is
    /// one of `expected`.
    ///
    /// Returns `Ok(None)` when the bot is missing or its status has moved
    /// on, leaving the record untouched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn update_if_status(
        &self,
        id: &str,
        expected: &[BotStatus],
        patch: BotUpdate,
    ) -> Result<Option<Bot>> {
        if expected.is_empty() {
            return Ok(None);
        }
        self.apply_update(id, patch, expected).await
    }

    async fn apply_update(
        &self,
        id: &str,
        patch: BotUpdate,
        expected: &[BotStatus],
    ) -> Result<Option<Bot>> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("UPDATE bot SET updated_at = ");
        qb.push_bind(Utc::now().to_rfc3339());

        let clears_pid = patch.status.is_some_and(|s| s != BotStatus::Online);

        if let Some(status) = patch.status {
            qb.push(", status = ").push_bind(status.as_str());
        }
        if let Some(phone_number) = patch.phone_number {
            qb.push(", phone_number = ").push_bind(phone_number);
        }
        if let Some(pairing_code) = patch.pairing_code {
            qb.push(", pairing_code = ").push_bind(pairing_code);
        }
        if let Some(pairing_status) = patch.pairing_status {
            qb.push(", pairing_status = ").push_bind(pairing_status.as_str());
        }
        if clears_pid {
            qb.push(", pid = NULL");
        } else if let Some(pid) = patch.pid {
            if patch.status == Some(BotStatus::Online) {
                qb.push(", pid = ").push_bind(pid.map(i64::from));
            } else {
                // Status untouched: only keep a pid on rows that are online.
                qb.push(", pid = CASE WHEN status = 'online' THEN ")
                    .push_bind(pid.map(i64::from))
                    .push(" ELSE NULL END");
            }
        }
        if let Some(error) = patch.error {
            qb.push(", error = ").push_bind(error);
        }
        if let Some(logs) = patch.logs {
            let logs = serde_json::to_string(&logs)
                .map_err(|e| AppError::Db(format!("serialize logs: {e}")))?;
            qb.push(", logs = ").push_bind(logs);
        }
        if let Some(ts) = patch.deployed_at {
            qb.push(", deployed_at = ").push_bind(ts.to_rfc3339());
        }
        if let Some(ts) = patch.last_restart_at {
            qb.push(", last_restart_at = ").push_bind(ts.to_rfc3339());
        }
        if let Some(ts) = patch.last_stopped_at {
            qb.push(", last_stopped_at = ").push_bind(ts.to_rfc3339());
        }
        if let Some(ts) = patch.last_checked_at {
            qb.push(", last_checked_at = ").push_bind(ts.to_rfc3339());
        }

        qb.push(" WHERE id = ").push_bind(id);
        if !expected.is_empty() {
            qb.push(" AND status IN (");
            let mut statuses = qb.separated(", ");
            for status in expected {
                statuses.push_bind(status.as_str());
            }
            statuses.push_unseparated(")");
        }
        qb.push(" RETURNING *");

        let row: Option<BotRow> = qb
            .build_query_as()
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(BotRow::into_bot).transpose()
    }

    /// Delete a bot record.
    ///
    /// Returns `true` when a row was removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM bot WHERE id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
