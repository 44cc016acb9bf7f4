#![forbid(unsafe_code)]

//! `botdock`: deploys messaging bots from source repositories, pairs
//! them to messaging accounts and supervises them as child processes.

pub mod api;
pub mod atomic;
pub mod config;
pub mod errors;
pub mod ipc;
pub mod models;
pub mod orchestrator;
pub mod pairing;
pub mod paths;
pub mod persistence;
pub mod state;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
