//! # beacond - Beacon server
//!
//! The process entry point: runs migrations, brings up the websocket hub,
//! serves the REST API and layers the CDC consumer on top as a best-effort
//! subsystem. See the crate-level modules for the individual pieces.

pub mod api;
pub mod cli;
pub mod handlers;
pub mod migrate;
pub mod server;
pub mod store;

pub use cli::Cli;
pub use server::{run, TRACKED_TABLES};
