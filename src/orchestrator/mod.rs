//! Bot orchestration: deployment, process supervision, reconciliation,
//! and the lifecycle operations built on top of them.

pub mod deployer;
pub mod entrypoint;
pub mod lifecycle;
pub mod monitor;
pub mod registry;
