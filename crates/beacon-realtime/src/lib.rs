//! # beacon-realtime - Live event fan-out
//!
//! A websocket hub with named rooms and targeted delivery. The [`Hub`] is
//! the transport-agnostic core (usable on its own in tests and HTTP-only
//! deployments); [`serve`] attaches the actual websocket listener.
//!
//! Delivery semantics are deliberately loose: fire-and-forget, at-most-once
//! per connected client, no persistence and no replay. Slow clients lose
//! frames rather than slow anyone else down.

mod hub;
mod protocol;
mod server;

use thiserror::Error;

pub use hub::{ClientId, Hub};
pub use protocol::{ClientCommand, EventFrame};
pub use server::serve;

/// Realtime transport errors.
#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
