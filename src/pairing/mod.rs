//! Device pairing: session store, protocol transport, and the pairing
//! state machine.
//!
//! The [`PairingTransport`] trait is the seam between the pairing manager
//! and whatever speaks the messaging protocol. The production transport
//! is [`bridge::BridgeTransport`], which drives an external helper process
//! over NDJSON; tests substitute an in-process fake.

pub mod bridge;
pub mod codec;
pub mod manager;
pub mod store;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Connection events reported by the protocol layer during a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// The protocol issued a human-entry pairing code.
    CodeIssued(String),
    /// The user completed pairing on their device; the connection is open.
    Connected {
        /// Protocol-level session identifier.
        session_id: String,
    },
    /// The protocol refused the handshake.
    Rejected {
        /// Reason reported by the protocol layer.
        reason: String,
    },
    /// The connection closed.
    Closed {
        /// Reason reported by the protocol layer.
        reason: String,
    },
}

/// Parameters for opening a pairing connection.
#[derive(Debug, Clone)]
pub struct PairingRequest {
    /// Owning account identifier.
    pub owner_id: String,
    /// Bot being paired.
    pub bot_id: String,
    /// Normalized account number (digits only).
    pub phone_number: String,
    /// Session directory where the protocol persists credentials.
    pub session_dir: PathBuf,
}

/// An open protocol connection: an event stream plus a close handle.
///
/// Dropping the link closes the connection.
#[derive(Debug)]
pub struct PairingLink {
    events: mpsc::Receiver<PairingEvent>,
    close: CancellationToken,
}

impl PairingLink {
    /// Wrap an event receiver and the token that closes the connection.
    #[must_use]
    pub fn new(events: mpsc::Receiver<PairingEvent>, close: CancellationToken) -> Self {
        Self { events, close }
    }

    /// Next connection event; `None` once the protocol side has gone away.
    pub async fn next_event(&mut self) -> Option<PairingEvent> {
        self.events.recv().await
    }

    /// Close the underlying connection. Idempotent.
    pub fn close(&self) {
        self.close.cancel();
    }
}

impl Drop for PairingLink {
    fn drop(&mut self) {
        self.close.cancel();
    }
}

/// Opens protocol connections for pairing attempts.
pub trait PairingTransport: Send + Sync {
    /// Open a connection using the credential state in
    /// `request.session_dir` and ask the protocol for a pairing code.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    fn open(
        &self,
        request: PairingRequest,
    ) -> Pin<Box<dyn Future<Output = Result<PairingLink>> + Send + '_>>;
}
