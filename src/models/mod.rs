//! Domain model module declarations.

pub mod bot;
pub mod process;
pub mod session;
