//! # Transports
//!
//! Socket-facing adapters around the relay core. The core never touches a
//! socket; these modules do.
//!
//! - **`ws_upstream`**: `tokio-tungstenite` client implementing
//!   `UpstreamConnector`.
//! - **`ws_downstream`**: axum WebSocket endpoint plus `/health` and
//!   `/status`.

/// Axum bridge for browser sessions.
pub mod ws_downstream;
/// WebSocket connector for the upstream server.
pub mod ws_upstream;

pub use ws_downstream::{relay_router, serve_client};
pub use ws_upstream::WsUpstreamConnector;
