//! Shared application context.
//!
//! Built once at startup and handed to the HTTP router, the IPC server
//! and the process monitor.

use std::sync::Arc;

use crate::config::GlobalConfig;
use crate::orchestrator::deployer::Deployer;
use crate::pairing::manager::{PairingManager, PairingSettings};
use crate::pairing::store::SessionStore;
use crate::pairing::PairingTransport;
use crate::persistence::bot_repo::BotRepo;
use crate::persistence::db::Database;

/// Everything a request handler or background task needs.
#[derive(Clone)]
pub struct AppState {
    /// Global configuration.
    pub config: Arc<GlobalConfig>,
    /// Database connection pool.
    pub db: Arc<Database>,
    /// Bot record repository.
    pub bots: BotRepo,
    /// Session directories and status resolver.
    pub sessions: SessionStore,
    /// Process deployment and supervision.
    pub deployer: Deployer,
    /// Pairing state machine.
    pub pairing: PairingManager,
    /// Shared secret required on IPC requests, if set.
    pub ipc_auth_token: Option<String>,
}

impl AppState {
    /// Wire up the application context.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        db: Arc<Database>,
        transport: Arc<dyn PairingTransport>,
    ) -> Self {
        let bots = BotRepo::new(Arc::clone(&db));
        let sessions = SessionStore::new(config.sessions_root());
        let deployer = Deployer::new(&config, bots.clone(), sessions.clone());
        let pairing = PairingManager::new(
            sessions.clone(),
            transport,
            PairingSettings::from(&config.pairing),
        );

        Self {
            config,
            db,
            bots,
            sessions,
            deployer,
            pairing,
            ipc_auth_token: None,
        }
    }

    /// Require `token` on every IPC request.
    #[must_use]
    pub fn with_ipc_auth_token(mut self, token: Option<String>) -> Self {
        self.ipc_auth_token = token;
        self
    }
}
