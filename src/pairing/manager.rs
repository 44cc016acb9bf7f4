//! Pairing state machine driven as a structured task.
//!
//! Per (owner, bot) key: `none -> pairing -> {connected | failed | timed_out}`.
//!
//! [`PairingManager::start_pairing`] resets the session directory, opens a
//! transport link and waits for the protocol's pairing code. Once the code
//! arrives a driver task owns the link and the single outcome sender until
//! the attempt settles. Every failure path closes the link, deletes the
//! session directory and releases the in-flight key before the outcome is
//! published, so a retry always starts from a clean slate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::store::SessionStore;
use super::{PairingEvent, PairingLink, PairingRequest, PairingTransport};
use crate::config::PairingConfig;
use crate::models::bot::PairingStatus;
use crate::models::session::SessionRecord;
use crate::{AppError, Result};

/// Characters accepted in a caller-supplied account number.
const NUMBER_PATTERN: &str = r"^\+?[0-9 ().\-]+$";

/// Minimum digits in a normalized account number.
pub const MIN_NUMBER_DIGITS: usize = 7;

/// Maximum digits in a normalized account number (E.164).
pub const MAX_NUMBER_DIGITS: usize = 15;

/// Strip formatting from an account number, leaving digits only.
///
/// # Errors
///
/// Returns `AppError::Validation` if the input contains anything other
/// than digits and common phone punctuation, or if the digit count is
/// outside `7..=15`.
pub fn normalize_number(raw: &str) -> Result<String> {
    let pattern = Regex::new(NUMBER_PATTERN)
        .map_err(|err| AppError::Validation(format!("number pattern invalid: {err}")))?;
    let trimmed = raw.trim();
    if !pattern.is_match(trimmed) {
        return Err(AppError::Validation(format!(
            "'{trimmed}' is not a valid account number"
        )));
    }

    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if !(MIN_NUMBER_DIGITS..=MAX_NUMBER_DIGITS).contains(&digits.len()) {
        return Err(AppError::Validation(format!(
            "account number must have {MIN_NUMBER_DIGITS}-{MAX_NUMBER_DIGITS} digits, got {}",
            digits.len()
        )));
    }

    Ok(digits)
}

/// Timing knobs for a pairing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingSettings {
    /// Upper bound on the whole attempt, code wait included.
    pub timeout: Duration,
    /// Delay between the `open` event and closing the link.
    pub close_delay: Duration,
}

impl From<&PairingConfig> for PairingSettings {
    fn from(config: &PairingConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_seconds),
            close_delay: Duration::from_millis(config.close_delay_millis),
        }
    }
}

/// Final result of one pairing attempt.
#[derive(Debug)]
pub enum PairingOutcome {
    /// The handshake completed and the session was marked connected.
    Connected {
        /// Protocol-level session identifier.
        session_id: String,
    },
    /// The attempt failed; the session directory has been removed.
    Failed(AppError),
}

impl PairingOutcome {
    /// Pairing status to record on the bot for this outcome.
    #[must_use]
    pub fn pairing_status(&self) -> PairingStatus {
        match self {
            Self::Connected { .. } => PairingStatus::Connected,
            Self::Failed(AppError::PairingTimeout(_)) => PairingStatus::TimedOut,
            Self::Failed(_) => PairingStatus::Failed,
        }
    }
}

/// Handle returned once the protocol has issued a pairing code.
#[derive(Debug)]
pub struct PairingTicket {
    /// Human-entry pairing code.
    pub code: String,
    /// Resolves exactly once with the attempt's outcome.
    pub outcome: oneshot::Receiver<PairingOutcome>,
}

type PairingKey = (String, String);

/// Drives pairing attempts, one in flight per (owner, bot).
#[derive(Clone)]
pub struct PairingManager {
    store: SessionStore,
    transport: Arc<dyn PairingTransport>,
    settings: PairingSettings,
    in_flight: Arc<Mutex<HashMap<PairingKey, CancellationToken>>>,
}

impl PairingManager {
    /// Create a manager writing sessions into `store`.
    #[must_use]
    pub fn new(
        store: SessionStore,
        transport: Arc<dyn PairingTransport>,
        settings: PairingSettings,
    ) -> Self {
        Self {
            store,
            transport,
            settings,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Session store used by this manager.
    #[must_use]
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Start pairing and return only the code.
    ///
    /// The attempt keeps running in the background; its outcome is only
    /// reflected in the session store.
    ///
    /// # Errors
    ///
    /// See [`Self::start_pairing`].
    pub async fn generate_pairing_code(
        &self,
        number: &str,
        owner_id: &str,
        bot_id: &str,
    ) -> Result<String> {
        self.start_pairing(number, owner_id, bot_id)
            .await
            .map(|ticket| ticket.code)
    }

    /// Start a pairing attempt and wait for the protocol's pairing code.
    ///
    /// # Errors
    ///
    /// - `AppError::Validation` for a malformed number or unsafe ids.
    /// - `AppError::Conflict` if an attempt for the same key is in flight,
    ///   or if the protocol reports the session open before issuing a code.
    /// - `AppError::PairingTimeout`, `AppError::PairingRejected` or
    ///   `AppError::ConnectionClosed` if the attempt fails before a code is
    ///   issued. The session directory is removed in these cases.
    pub async fn start_pairing(
        &self,
        number: &str,
        owner_id: &str,
        bot_id: &str,
    ) -> Result<PairingTicket> {
        let phone_number = normalize_number(number)?;
        let session_dir = self.store.session_dir(owner_id, bot_id)?;
        let key: PairingKey = (owner_id.to_owned(), bot_id.to_owned());

        let cancel = {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight.contains_key(&key) {
                return Err(AppError::Conflict(format!(
                    "pairing already in progress for bot {bot_id}"
                )));
            }
            let token = CancellationToken::new();
            in_flight.insert(key.clone(), token.clone());
            token
        };

        let deadline = Instant::now() + self.settings.timeout;
        let span = info_span!("pairing", owner = %owner_id, bot_id = %bot_id);

        let opened = self
            .open_and_await_code(
                PairingRequest {
                    owner_id: owner_id.to_owned(),
                    bot_id: bot_id.to_owned(),
                    phone_number,
                    session_dir,
                },
                deadline,
                &cancel,
            )
            .instrument(span.clone())
            .await;

        let (link, code) = match opened {
            Ok(CodeWait::Code(link, code)) => (link, code),
            Ok(CodeWait::AlreadyOpen(link, session_id)) => {
                let result = self.store.write_record(
                    owner_id,
                    bot_id,
                    &self.pairing_record(owner_id, bot_id).await.connected(session_id),
                );
                drop(link);
                self.release(&key).await;
                result?;
                return Err(AppError::Conflict(format!(
                    "bot {bot_id} is already paired; verify the session to deploy"
                )));
            }
            Err((link, err)) => {
                self.fail(&key, link).await;
                warn!(parent: &span, %err, "pairing failed before a code was issued");
                return Err(err);
            }
        };

        info!(parent: &span, "pairing code issued");

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let manager = self.clone();
        tokio::spawn(
            async move {
                let outcome = manager.drive(&key, link, deadline, &cancel).await;
                match &outcome {
                    PairingOutcome::Connected { session_id } => {
                        info!(session_id = %session_id, "pairing completed");
                    }
                    PairingOutcome::Failed(err) => warn!(%err, "pairing failed"),
                }
                if outcome_tx.send(outcome).is_err() {
                    debug!("pairing outcome receiver dropped");
                }
            }
            .instrument(span),
        );

        Ok(PairingTicket {
            code,
            outcome: outcome_rx,
        })
    }

    /// Whether an attempt for (owner, bot) is currently in flight.
    pub async fn in_flight(&self, owner_id: &str, bot_id: &str) -> bool {
        self.in_flight
            .lock()
            .await
            .contains_key(&(owner_id.to_owned(), bot_id.to_owned()))
    }

    /// Cancel every in-flight attempt. Each resolves as a failure.
    pub async fn cancel_all(&self) {
        let in_flight = self.in_flight.lock().await;
        for token in in_flight.values() {
            token.cancel();
        }
        if !in_flight.is_empty() {
            info!(count = in_flight.len(), "cancelled in-flight pairing attempts");
        }
    }

    async fn open_and_await_code(
        &self,
        request: PairingRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> std::result::Result<CodeWait, (Option<PairingLink>, AppError)> {
        let owner_id = request.owner_id.clone();
        let bot_id = request.bot_id.clone();

        self.store
            .reset(&owner_id, &bot_id)
            .await
            .map_err(|err| (None, err))?;
        self.store
            .write_record(
                &owner_id,
                &bot_id,
                &SessionRecord::pairing(request.phone_number.clone()),
            )
            .map_err(|err| (None, err))?;

        let mut link = tokio::select! {
            opened = self.transport.open(request) => opened.map_err(|err| (None, err))?,
            () = tokio::time::sleep_until(deadline) => {
                return Err((None, timed_out(self.settings.timeout)));
            }
            () = cancel.cancelled() => {
                return Err((None, cancelled()));
            }
        };

        loop {
            let event = tokio::select! {
                event = link.next_event() => event,
                () = tokio::time::sleep_until(deadline) => {
                    return Err((Some(link), timed_out(self.settings.timeout)));
                }
                () = cancel.cancelled() => return Err((Some(link), cancelled())),
            };

            match event {
                Some(PairingEvent::CodeIssued(code)) => return Ok(CodeWait::Code(link, code)),
                Some(PairingEvent::Connected { session_id }) => {
                    return Ok(CodeWait::AlreadyOpen(link, session_id));
                }
                Some(PairingEvent::Rejected { reason }) => {
                    return Err((Some(link), AppError::PairingRejected(reason)));
                }
                Some(PairingEvent::Closed { reason }) => {
                    return Err((Some(link), AppError::ConnectionClosed(reason)));
                }
                None => {
                    return Err((
                        Some(link),
                        AppError::ConnectionClosed("connection closed before a code was issued".into()),
                    ));
                }
            }
        }
    }

    async fn drive(
        &self,
        key: &PairingKey,
        mut link: PairingLink,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> PairingOutcome {
        let (owner_id, bot_id) = (key.0.as_str(), key.1.as_str());

        let result = loop {
            let event = tokio::select! {
                event = link.next_event() => event,
                () = tokio::time::sleep_until(deadline) => {
                    break Err(timed_out(self.settings.timeout));
                }
                () = cancel.cancelled() => break Err(cancelled()),
            };

            match event {
                Some(PairingEvent::Connected { session_id }) => break Ok(session_id),
                Some(PairingEvent::CodeIssued(code)) => {
                    debug!(code = %code, "protocol refreshed pairing code, keeping the first one");
                }
                Some(PairingEvent::Rejected { reason }) => {
                    break Err(AppError::PairingRejected(reason));
                }
                Some(PairingEvent::Closed { reason }) => {
                    break Err(AppError::ConnectionClosed(reason));
                }
                None => {
                    break Err(AppError::ConnectionClosed(
                        "connection closed before pairing completed".into(),
                    ));
                }
            }
        };

        let session_id = match result {
            Ok(session_id) => session_id,
            Err(err) => {
                self.fail(key, Some(link)).await;
                return PairingOutcome::Failed(err);
            }
        };

        let record = self
            .pairing_record(owner_id, bot_id)
            .await
            .connected(session_id.clone());
        if let Err(err) = self.store.write_record(owner_id, bot_id, &record) {
            self.fail(key, Some(link)).await;
            return PairingOutcome::Failed(err);
        }
        self.release(key).await;

        let close_delay = self.settings.close_delay;
        let close_cancel = cancel.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    () = tokio::time::sleep(close_delay) => {}
                    () = close_cancel.cancelled() => {}
                }
                link.close();
                debug!("pairing link closed");
            }
            .in_current_span(),
        );

        PairingOutcome::Connected { session_id }
    }

    /// Status record for the current attempt, falling back to a fresh one
    /// when the on-disk record is unreadable.
    async fn pairing_record(&self, owner_id: &str, bot_id: &str) -> SessionRecord {
        match self.store.read_record(owner_id, bot_id).await {
            Ok(Some(record)) => record,
            _ => SessionRecord::pairing(String::new()),
        }
    }

    async fn fail(&self, key: &PairingKey, link: Option<PairingLink>) {
        if let Some(link) = link {
            link.close();
        }
        if let Err(err) = self.store.delete(&key.0, &key.1).await {
            warn!(%err, "failed to remove session directory after pairing failure");
        }
        self.release(key).await;
    }

    async fn release(&self, key: &PairingKey) {
        self.in_flight.lock().await.remove(key);
    }
}

enum CodeWait {
    Code(PairingLink, String),
    AlreadyOpen(PairingLink, String),
}

fn timed_out(timeout: Duration) -> AppError {
    AppError::PairingTimeout(format!("pairing timed out after {}s", timeout.as_secs()))
}

fn cancelled() -> AppError {
    AppError::ConnectionClosed("pairing cancelled".into())
}
