//! # Relay Assembly
//!
//! Builds the registry, upstream link, router and session controller, and
//! starts the task that carries upstream payloads to the router. The server
//! owns the returned `Relay` for the lifetime of the process.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::core::registry::ConnectionRegistry;
use crate::core::router::{Router, RouterOptions};
use crate::core::session::{SessionController, SessionOptions};
use crate::core::upstream_link::{LinkOptions, LinkState, UpstreamConnector, UpstreamLink};

/// Default per-message limit for client frames (2 MiB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 2 * 1024 * 1024;

/// Every tunable of the relay core.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Upstream link tunables.
    pub link: LinkOptions,
    /// Router switches.
    pub router: RouterOptions,
    /// Lifecycle switches.
    pub session: SessionOptions,
    /// Largest accepted client message, in bytes.
    pub max_message_bytes: usize,
    /// Connect upstream at start instead of on the first client.
    pub connect_on_start: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            link: LinkOptions::default(),
            router: RouterOptions::default(),
            session: SessionOptions::default(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            connect_on_start: false,
        }
    }
}

/// Point-in-time view of the relay, served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    /// When the snapshot was taken.
    pub ts: DateTime<Utc>,
    /// Registered clients.
    pub clients: usize,
    /// Upstream link state.
    pub upstream: LinkState,
    /// Upstream connect attempts since start.
    pub connect_attempts: u64,
}

/// A running relay.
pub struct Relay {
    registry: Arc<ConnectionRegistry>,
    link: Arc<UpstreamLink>,
    sessions: Arc<SessionController>,
    max_message_bytes: usize,
    pump: JoinHandle<()>,
}

impl Relay {
    /// Wires the components and spawns the upstream pump.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(connector: Arc<dyn UpstreamConnector>, options: RelayOptions) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let (link, upstream_rx) = UpstreamLink::new(connector, options.link);
        let router = Arc::new(Router::new(registry.clone(), link.clone(), options.router));
        let sessions = Arc::new(SessionController::new(
            registry.clone(),
            link.clone(),
            router.clone(),
            options.session,
        ));

        let pump = tokio::spawn(router.run_upstream_pump(upstream_rx));
        if options.connect_on_start {
            link.connect();
        }

        Self {
            registry,
            link,
            sessions,
            max_message_bytes: options.max_message_bytes,
            pump,
        }
    }

    /// The session controller transports report events to.
    pub fn sessions(&self) -> &Arc<SessionController> {
        &self.sessions
    }

    /// The upstream link.
    pub fn link(&self) -> &Arc<UpstreamLink> {
        &self.link
    }

    /// Largest accepted client message, in bytes.
    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    /// Current counts and link state.
    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            ts: Utc::now(),
            clients: self.registry.count(),
            upstream: self.link.state(),
            connect_attempts: self.link.connect_attempts(),
        }
    }

    /// Closes every client, shuts the upstream link and stops the pump.
    pub async fn shutdown(&self) {
        for client in self.registry.snapshot() {
            client.close();
        }
        self.link.shutdown().await;
        self.pump.abort();
        tracing::info!("relay stopped");
    }
}
