//! # Session Lifecycle Controller
//!
//! Maps the four transport signals onto the registry and the upstream link:
//!
//! - **opened**: register the client, then make sure the upstream link is
//!   connected or connecting.
//! - **message**: hand the payload to the router.
//! - **closed**: deregister; when the last client leaves, close the link.
//! - **error**: record it. The transport decides whether the socket survives.
//!
//! Opens and closes are serialized through an async gate. Without it a client
//! could register and see a live link that a concurrent "last client left"
//! close is about to tear down.

use std::fmt::Display;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::core::connection::{ClientConnection, ClientId};
use crate::core::error::RelayResult;
use crate::core::registry::ConnectionRegistry;
use crate::core::router::{Dispatch, Router};
use crate::core::upstream_link::UpstreamLink;

/// Close reason sent upstream when the last client leaves.
pub const IDLE_CLOSE_REASON: &str = "Client disconnected";

/// Lifecycle switches.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Close the upstream link when no client remains.
    pub close_upstream_when_idle: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            close_upstream_when_idle: true,
        }
    }
}

/// Reacts to client lifecycle events.
pub struct SessionController {
    registry: Arc<ConnectionRegistry>,
    upstream: Arc<UpstreamLink>,
    router: Arc<Router>,
    options: SessionOptions,
    gate: Mutex<()>,
}

impl SessionController {
    /// Creates a controller over the shared relay components.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        upstream: Arc<UpstreamLink>,
        router: Arc<Router>,
        options: SessionOptions,
    ) -> Self {
        Self {
            registry,
            upstream,
            router,
            options,
            gate: Mutex::new(()),
        }
    }

    /// The shared registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The shared upstream link.
    pub fn upstream(&self) -> &Arc<UpstreamLink> {
        &self.upstream
    }

    /// A client connected.
    pub async fn on_open(&self, conn: ClientConnection) -> RelayResult<()> {
        let _gate = self.gate.lock().await;
        let id = conn.id();
        let peer = conn.peer();
        self.registry.add(conn)?;
        tracing::info!(
            client_id = id,
            peer = ?peer,
            clients = self.registry.count(),
            "client connected"
        );
        self.upstream.connect();
        Ok(())
    }

    /// A client sent a text payload.
    pub fn on_message(&self, conn: &ClientConnection, payload: Arc<str>) -> Dispatch {
        self.router.dispatch_client(conn, payload)
    }

    /// A client disconnected. Repeated closes for the same id are ignored.
    ///
    /// Only the state change happens under the gate. The close frame to
    /// upstream is awaited afterwards, so joining clients are not held up.
    pub async fn on_close(&self, id: ClientId) {
        let closing = {
            let _gate = self.gate.lock().await;
            if self.registry.remove(id).is_none() {
                return;
            }
            let remaining = self.registry.count();
            tracing::info!(client_id = id, clients = remaining, "client disconnected");

            if remaining == 0 && self.options.close_upstream_when_idle {
                self.upstream.detach()
            } else {
                None
            }
        };

        if let Some(closing) = closing {
            closing.finish(IDLE_CLOSE_REASON).await;
        }
    }

    /// A transport reported an error on a client session.
    pub fn on_error(&self, id: ClientId, cause: &dyn Display) {
        tracing::warn!(client_id = id, error = %cause, "client transport error");
    }
}
