//! # Message Classification
//!
//! Inbound payloads are classified by looking at their first bytes only. An
//! image frame can be close to the 2 MiB frame limit, so nothing here parses
//! or scans the whole payload: every check is a prefix or an exact compare
//! against a short token.

/// Heartbeat probe sent by clients and by the relay towards upstream.
pub const HEARTBEAT_PING: &str = "ping";
/// Heartbeat acknowledgement.
pub const HEARTBEAT_PONG: &str = "pong";
/// First byte of a structured signaling payload.
pub const SIGNALING_MARKER: &str = "{";
/// Prefix of an image frame destined for upstream.
pub const BINARY_MARKER: &str = "data:image";
/// Prefix of every error text sent back to a client.
pub const ERROR_PREFIX: &str = "错误：";

/// Classification of a payload received from a client.
///
/// Rules are checked in declaration order and the first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessage {
    /// Structured peer-to-peer signaling. Relayed to every other client.
    Signaling,
    /// Exactly `ping`. Answered with `pong` to the sender only.
    Heartbeat,
    /// A `data:image` payload. Forwarded upstream.
    BinaryPayload,
    /// Anything else.
    Unknown,
}

impl ClientMessage {
    /// Classifies a client payload.
    pub fn classify(payload: &str) -> Self {
        if payload.starts_with(SIGNALING_MARKER) {
            Self::Signaling
        } else if payload == HEARTBEAT_PING {
            Self::Heartbeat
        } else if payload.starts_with(BINARY_MARKER) {
            Self::BinaryPayload
        } else {
            Self::Unknown
        }
    }

    /// Short label used in log events.
    pub fn label(self) -> &'static str {
        match self {
            Self::Signaling => "signaling",
            Self::Heartbeat => "heartbeat",
            Self::BinaryPayload => "binary",
            Self::Unknown => "unknown",
        }
    }
}

/// Classification of a payload received from upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamMessage {
    /// Exactly `pong`. Consumed by the link.
    Heartbeat,
    /// Any other text. Broadcast to every client.
    Broadcast,
}

impl UpstreamMessage {
    /// Classifies an upstream payload.
    pub fn classify(payload: &str) -> Self {
        if payload == HEARTBEAT_PONG {
            Self::Heartbeat
        } else {
            Self::Broadcast
        }
    }
}
