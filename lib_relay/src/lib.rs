//! # lib_relay
//!
//! A bidirectional WebSocket relay: many browser clients on one side, a single
//! upstream processing server on the other.
//!
//! - Upstream messages are broadcast to every client (`pong` excepted).
//! - Client signaling (`{...}`) is relayed to every other client.
//! - Client `ping` is answered with `pong`.
//! - Client image frames (`data:image...`) are forwarded upstream.
//!
//! Module groups are feature gated the same way across the workspace:
//! `core` is always built, `transports` pulls in axum and tokio-tungstenite,
//! `loggers` pulls in the tracing subscriber stack.

pub mod core;

#[cfg(feature = "loggers")]
pub mod loggers;

#[cfg(feature = "transports")]
pub mod transports;

pub use crate::core::{
    ClientConnection, ConnectionRegistry, Relay, RelayError, RelayOptions, RelayStatus, Router,
    SessionController, UpstreamLink,
};
