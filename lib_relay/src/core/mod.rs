//! # Relay Core
//!
//! The transport-agnostic heart of the relay. Nothing in here knows about
//! sockets: clients are [`ClientConnection`] handles backed by queues, and
//! the upstream server is reached through an [`UpstreamConnector`].
//!
//! ## Components:
//!
//! - **`registry`**: the set of open client sessions, snapshot-iterated for
//!   every fan-out.
//! - **`upstream_link`**: the one shared upstream connection with its
//!   `Disconnected → Connecting → Connected` state machine and constant-delay
//!   reconnect timer.
//! - **`memory_guard`**: caps the bytes waiting in the upstream write queue.
//! - **`router`**: classifies each payload and sends it to peers, to
//!   upstream, back to the sender, or nowhere.
//! - **`session`**: maps open/message/close/error events onto the above.
//! - **`relay`**: assembles the four for a server.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Client session handles.
pub mod connection;
/// Error taxonomy.
pub mod error;
/// Byte accounting for queued upstream payloads.
pub mod memory_guard;
/// Payload classification and protocol tokens.
pub mod message;
/// Thread-safe set of open clients.
pub mod registry;
/// Assembly of the relay components.
pub mod relay;
/// Client and upstream payload routing.
pub mod router;
/// Client lifecycle handling.
pub mod session;
/// The shared upstream connection.
pub mod upstream_link;

// --- Public API Re-exports ---
pub use connection::{ClientConnection, ClientId, OutboundFrame};
pub use error::{RelayError, RelayResult};
pub use memory_guard::{ByteBudget, BytePermit};
pub use message::{ClientMessage, UpstreamMessage};
pub use registry::ConnectionRegistry;
pub use relay::{Relay, RelayOptions, RelayStatus};
pub use router::{Dispatch, Router, RouterOptions};
pub use session::{SessionController, SessionOptions};
pub use upstream_link::{
    ClosingLink, LinkOptions, LinkState, UpstreamConnector, UpstreamEvent, UpstreamFrame, UpstreamLink,
    UpstreamTransport,
};
