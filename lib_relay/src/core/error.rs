//! # Relay Error Taxonomy
//!
//! Every fallible operation in the relay core returns a [`RelayError`]. The
//! variants map one-to-one onto the ways the relay can fail:
//!
//! - **`Transport`**: a send or receive failed on a client or upstream link.
//!   The affected client is told in-band; the connection stays open.
//! - **`UpstreamUnavailable`**: a payload had to go upstream while the link was
//!   not `Connected`. The payload is dropped, never queued.
//! - **`ConnectFailure`**: an upstream connect attempt failed. Handled entirely
//!   inside the upstream link by its retry timer and never shown to clients.
//! - **`DuplicateConnection`**: a client id was registered twice. This is a
//!   logic fault, not a runtime condition.
//! - **`ClientClosed`**: the outbound queue of a client session is gone.

use thiserror::Error;

use crate::core::connection::ClientId;
use crate::core::message::ERROR_PREFIX;

/// Errors raised by the relay core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// A send or receive failed on either side of the relay.
    #[error("transport error: {0}")]
    Transport(String),

    /// The upstream link is not connected.
    #[error("upstream server is not connected")]
    UpstreamUnavailable,

    /// An upstream connect attempt failed.
    #[error("failed to connect upstream: {0}")]
    ConnectFailure(String),

    /// A client id was registered while already present.
    #[error("client {0} is already registered")]
    DuplicateConnection(ClientId),

    /// The client session no longer accepts outbound frames.
    #[error("client {0} is closed")]
    ClientClosed(ClientId),
}

impl RelayError {
    /// Renders the error as the in-band text sent to the originating client.
    pub fn client_text(&self) -> String {
        format!("{}{}", ERROR_PREFIX, self)
    }
}

/// Result alias used throughout the relay core.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_text_carries_prefix() {
        let text = RelayError::UpstreamUnavailable.client_text();
        assert_eq!(text, "错误：upstream server is not connected");
    }

    #[test]
    fn transport_error_keeps_cause() {
        let err = RelayError::Transport("broken pipe".into());
        assert!(err.client_text().ends_with("broken pipe"));
    }
}
