//! # Message Router
//!
//! Decides where every payload goes.
//!
//! From a client, in priority order:
//!
//! | payload              | action                                          |
//! |----------------------|-------------------------------------------------|
//! | starts with `{`      | relay to every other client, never upstream     |
//! | exactly `ping`       | answer `pong` to the sender only                |
//! | starts with `data:image` | forward upstream if connected, else error   |
//! | anything else        | drop (or reject, when configured)               |
//!
//! From upstream: `pong` is suppressed, everything else goes to every client.
//!
//! Fan-out works on a registry snapshot and queues one `Arc<str>` per
//! recipient. A failing recipient never stops delivery to the rest.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::core::connection::ClientConnection;
use crate::core::error::RelayError;
use crate::core::message::{ClientMessage, UpstreamMessage, HEARTBEAT_PONG};
use crate::core::registry::ConnectionRegistry;
use crate::core::upstream_link::UpstreamLink;

/// What the router did with one client payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Signaling was queued for `delivered` peers; `failed` peers could not take it.
    Relayed {
        /// Peers that accepted the frame.
        delivered: usize,
        /// Peers whose queue was gone.
        failed: usize,
    },
    /// `pong` was queued for the sender.
    HeartbeatAck,
    /// The payload was handed to the upstream link.
    ForwardedUpstream,
    /// The sender was told why the payload was refused.
    Rejected(RelayError),
    /// Unclassified payload, dropped.
    Dropped,
}

/// Router behaviour switches.
#[derive(Debug, Clone, Default)]
pub struct RouterOptions {
    /// Answer unclassified payloads with an error instead of dropping them.
    pub reject_unknown: bool,
}

/// Routes client and upstream payloads.
pub struct Router {
    registry: Arc<ConnectionRegistry>,
    upstream: Arc<UpstreamLink>,
    options: RouterOptions,
}

impl Router {
    /// Creates a router over a shared registry and upstream link.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        upstream: Arc<UpstreamLink>,
        options: RouterOptions,
    ) -> Self {
        Self {
            registry,
            upstream,
            options,
        }
    }

    /// Routes one payload received from `sender`.
    pub fn dispatch_client(&self, sender: &ClientConnection, payload: Arc<str>) -> Dispatch {
        let kind = ClientMessage::classify(&payload);
        tracing::debug!(
            client_id = sender.id(),
            kind = kind.label(),
            bytes = payload.len(),
            "client message"
        );

        match kind {
            ClientMessage::Signaling => self.relay_signaling(sender, payload),
            ClientMessage::Heartbeat => self.answer_heartbeat(sender),
            ClientMessage::BinaryPayload => self.forward_upstream(sender, payload),
            ClientMessage::Unknown if self.options.reject_unknown => {
                let err = RelayError::Transport("unsupported message".to_string());
                sender.send_error(&err);
                Dispatch::Rejected(err)
            }
            ClientMessage::Unknown => Dispatch::Dropped,
        }
    }

    fn relay_signaling(&self, sender: &ClientConnection, payload: Arc<str>) -> Dispatch {
        let mut delivered = 0;
        let mut failed = 0;

        for peer in self.registry.snapshot_except(sender.id()) {
            // Deregistered mid-flight; a peer whose writer died is a failure.
            if peer.is_marked_closed() {
                continue;
            }
            match peer.send_text(Arc::clone(&payload)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(client_id = sender.id(), peer = peer.id(), error = %e, "signaling relay failed");
                    sender.send_error(&RelayError::Transport(format!(
                        "failed to relay signaling to client {}: {}",
                        peer.id(),
                        e
                    )));
                }
            }
        }

        tracing::debug!(client_id = sender.id(), peers = delivered, "signaling relayed");
        Dispatch::Relayed { delivered, failed }
    }

    fn answer_heartbeat(&self, sender: &ClientConnection) -> Dispatch {
        match sender.send_text(Arc::from(HEARTBEAT_PONG)) {
            Ok(()) => Dispatch::HeartbeatAck,
            Err(e) => {
                tracing::debug!(client_id = sender.id(), error = %e, "heartbeat reply not delivered");
                Dispatch::Rejected(e)
            }
        }
    }

    fn forward_upstream(&self, sender: &ClientConnection, payload: Arc<str>) -> Dispatch {
        let bytes = payload.len();
        match self.upstream.send(payload) {
            Ok(ack) => {
                tracing::debug!(client_id = sender.id(), bytes, "payload forwarded upstream");
                let origin = sender.clone();
                tokio::spawn(async move {
                    // A dropped responder means the link went away mid-write.
                    let outcome = ack.await.unwrap_or_else(|_| {
                        Err(RelayError::Transport("upstream link closed during send".into()))
                    });
                    if let Err(e) = outcome {
                        tracing::warn!(client_id = origin.id(), error = %e, "upstream send failed");
                        origin.send_error(&RelayError::Transport(format!(
                            "failed to send data upstream: {}",
                            e
                        )));
                    }
                });
                Dispatch::ForwardedUpstream
            }
            Err(e) => {
                tracing::warn!(client_id = sender.id(), bytes, error = %e, "payload not forwarded upstream");
                sender.send_error(&e);
                Dispatch::Rejected(e)
            }
        }
    }

    /// Queues `payload` for every registered client. Returns how many accepted it.
    pub fn broadcast(&self, payload: Arc<str>) -> usize {
        let mut delivered = 0;
        for client in self.registry.snapshot() {
            if !client.is_open() {
                continue;
            }
            match client.send_text(Arc::clone(&payload)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(client_id = client.id(), error = %e, "broadcast delivery failed");
                }
            }
        }
        tracing::debug!(clients = delivered, bytes = payload.len(), "broadcast");
        delivered
    }

    /// Routes one payload received from upstream.
    pub fn dispatch_upstream(&self, payload: Arc<str>) -> usize {
        match UpstreamMessage::classify(&payload) {
            UpstreamMessage::Heartbeat => 0,
            UpstreamMessage::Broadcast => self.broadcast(payload),
        }
    }

    /// Drains the upstream link's output until the link is dropped.
    pub async fn run_upstream_pump(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Arc<str>>) {
        while let Some(payload) = inbound.recv().await {
            self.dispatch_upstream(payload);
        }
        tracing::debug!("upstream pump stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::OutboundFrame;
    use crate::core::upstream_link::testing::{quiet_options, settle, ScriptedConnector};
    use crate::core::upstream_link::UpstreamFrame;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        link: Arc<UpstreamLink>,
        router: Arc<Router>,
        connector: Arc<ScriptedConnector>,
        peers: mpsc::UnboundedReceiver<crate::core::upstream_link::testing::MockPeer>,
        upstream_rx: Option<mpsc::UnboundedReceiver<Arc<str>>>,
    }

    fn fixture(options: RouterOptions) -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let (connector, peers) = ScriptedConnector::new(0);
        let (link, upstream_rx) = UpstreamLink::new(connector.clone(), quiet_options());
        let router = Arc::new(Router::new(registry.clone(), link.clone(), options));
        Fixture {
            registry,
            link,
            router,
            connector,
            peers,
            upstream_rx: Some(upstream_rx),
        }
    }

    fn join(
        registry: &ConnectionRegistry,
        id: u64,
    ) -> (ClientConnection, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (conn, rx) = ClientConnection::with_id(id, None);
        registry.add(conn.clone()).unwrap();
        (conn, rx)
    }

    fn texts(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let OutboundFrame::Text(t) = frame {
                out.push(t.to_string());
            }
        }
        out
    }

    #[tokio::test]
    async fn signaling_reaches_everyone_but_the_sender() {
        let fx = fixture(RouterOptions::default());
        let (a, mut ra) = join(&fx.registry, 1);
        let (_b, mut rb) = join(&fx.registry, 2);
        let (_c, mut rc) = join(&fx.registry, 3);

        let offer = r#"{"type":"offer","sdp":"v=0"}"#;
        let outcome = fx.router.dispatch_client(&a, Arc::from(offer));

        assert_eq!(outcome, Dispatch::Relayed { delivered: 2, failed: 0 });
        assert!(texts(&mut ra).is_empty());
        assert_eq!(texts(&mut rb), vec![offer.to_string()]);
        assert_eq!(texts(&mut rc), vec![offer.to_string()]);
        assert_eq!(fx.connector.attempts(), 0);
    }

    #[tokio::test]
    async fn signaling_to_peer_with_dead_writer_reports_to_sender() {
        let fx = fixture(RouterOptions::default());
        let (a, mut ra) = join(&fx.registry, 1);
        let (b, rb) = join(&fx.registry, 2);
        let (_c, mut rc) = join(&fx.registry, 3);

        // b's writer dies but b is still registered.
        drop(rb);
        assert!(!b.is_open());
        assert!(!b.is_marked_closed());
        let outcome = fx.router.dispatch_client(&a, Arc::from("{\"candidate\":1}"));

        assert_eq!(outcome, Dispatch::Relayed { delivered: 1, failed: 1 });
        assert_eq!(texts(&mut rc).len(), 1);
        let replies = texts(&mut ra);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with("错误："));
        assert!(replies[0].contains("client 2"));
    }

    #[tokio::test]
    async fn signaling_skips_deregistered_peer_silently() {
        let fx = fixture(RouterOptions::default());
        let (a, mut ra) = join(&fx.registry, 1);
        let (b, _rb) = join(&fx.registry, 2);
        let (_c, mut rc) = join(&fx.registry, 3);

        // Snapshot holders may still see b after deregistration marks it closed.
        b.mark_closed();
        let outcome = fx.router.dispatch_client(&a, Arc::from("{\"candidate\":2}"));

        assert_eq!(outcome, Dispatch::Relayed { delivered: 1, failed: 0 });
        assert_eq!(texts(&mut rc).len(), 1);
        assert!(texts(&mut ra).is_empty());
    }

    #[tokio::test]
    async fn image_to_stalled_upstream_is_refused_with_error() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (connector, mut peers) = ScriptedConnector::new(0);
        let options = crate::core::upstream_link::LinkOptions {
            max_pending_bytes: 64,
            ..quiet_options()
        };
        let (link, _upstream_rx) = UpstreamLink::new(connector, options);
        let router = Router::new(registry.clone(), link.clone(), RouterOptions::default());
        let (a, mut ra) = join(&registry, 1);
        link.connect();
        settle().await;
        // The writer never drains.
        let _peer = peers.try_recv().unwrap();

        let frame = format!("data:image/png;base64,{}", "A".repeat(30));
        assert_eq!(router.dispatch_client(&a, Arc::from(frame.as_str())), Dispatch::ForwardedUpstream);
        let outcome = router.dispatch_client(&a, Arc::from(frame.as_str()));

        assert!(matches!(outcome, Dispatch::Rejected(RelayError::Transport(_))));
        let replies = texts(&mut ra);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with("错误："));
        assert!(link.pending_bytes() <= 64);
    }

    #[tokio::test]
    async fn ping_gets_exactly_one_pong() {
        let fx = fixture(RouterOptions::default());
        let (a, mut ra) = join(&fx.registry, 1);
        let (_b, mut rb) = join(&fx.registry, 2);

        assert_eq!(fx.router.dispatch_client(&a, Arc::from("ping")), Dispatch::HeartbeatAck);
        assert_eq!(texts(&mut ra), vec!["pong".to_string()]);
        assert!(texts(&mut rb).is_empty());
        assert_eq!(fx.connector.attempts(), 0);
    }

    #[tokio::test]
    async fn image_while_disconnected_yields_one_error() {
        let fx = fixture(RouterOptions::default());
        let (a, mut ra) = join(&fx.registry, 1);
        let (_b, mut rb) = join(&fx.registry, 2);

        let outcome = fx.router.dispatch_client(&a, Arc::from("data:image/jpeg;base64,AAAA"));

        assert_eq!(outcome, Dispatch::Rejected(RelayError::UpstreamUnavailable));
        let replies = texts(&mut ra);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with("错误："));
        assert!(texts(&mut rb).is_empty());
        assert_eq!(fx.connector.attempts(), 0);
    }

    #[tokio::test]
    async fn image_while_connected_goes_upstream() {
        let mut fx = fixture(RouterOptions::default());
        let (a, mut ra) = join(&fx.registry, 1);
        fx.link.connect();
        settle().await;
        let mut peer = fx.peers.try_recv().unwrap();

        let frame = "data:image/jpeg;base64,/9j/4AAQ";
        assert_eq!(fx.router.dispatch_client(&a, Arc::from(frame)), Dispatch::ForwardedUpstream);

        match peer.frames.try_recv().unwrap() {
            UpstreamFrame::Text { payload, responder, .. } => {
                assert_eq!(&*payload, frame);
                responder.unwrap().send(Ok(())).unwrap();
            }
            other => panic!("unexpected frame {:?}", other),
        }
        settle().await;
        assert!(texts(&mut ra).is_empty());
    }

    #[tokio::test]
    async fn failed_upstream_write_is_reported_to_sender() {
        let mut fx = fixture(RouterOptions::default());
        let (a, mut ra) = join(&fx.registry, 1);
        fx.link.connect();
        settle().await;
        let mut peer = fx.peers.try_recv().unwrap();

        fx.router.dispatch_client(&a, Arc::from("data:image/png;base64,AA"));
        if let Ok(UpstreamFrame::Text { responder, .. }) = peer.frames.try_recv() {
            responder
                .unwrap()
                .send(Err(RelayError::Transport("connection reset".into())))
                .unwrap();
        }
        settle().await;

        let replies = texts(&mut ra);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].contains("connection reset"));
    }

    #[tokio::test]
    async fn unknown_is_dropped_unless_rejecting() {
        let fx = fixture(RouterOptions::default());
        let (a, mut ra) = join(&fx.registry, 1);
        assert_eq!(fx.router.dispatch_client(&a, Arc::from("hello")), Dispatch::Dropped);
        assert!(texts(&mut ra).is_empty());

        let strict = fixture(RouterOptions { reject_unknown: true });
        let (s, mut rs) = join(&strict.registry, 1);
        assert!(matches!(
            strict.router.dispatch_client(&s, Arc::from("hello")),
            Dispatch::Rejected(_)
        ));
        assert_eq!(texts(&mut rs).len(), 1);
    }

    #[tokio::test]
    async fn upstream_text_reaches_all_but_pong_reaches_none() {
        let fx = fixture(RouterOptions::default());
        let (_a, mut ra) = join(&fx.registry, 1);
        let (_b, mut rb) = join(&fx.registry, 2);

        assert_eq!(fx.router.dispatch_upstream(Arc::from("pong")), 0);
        assert_eq!(fx.router.dispatch_upstream(Arc::from("{\"emotion\":\"sad\"}")), 2);

        assert_eq!(texts(&mut ra), vec!["{\"emotion\":\"sad\"}".to_string()]);
        assert_eq!(texts(&mut rb), vec!["{\"emotion\":\"sad\"}".to_string()]);
    }

    #[tokio::test]
    async fn broadcast_skips_client_removed_mid_flight() {
        let fx = fixture(RouterOptions::default());
        let (_a, mut ra) = join(&fx.registry, 1);
        let (_b, mut rb) = join(&fx.registry, 2);

        fx.registry.remove(2);
        assert_eq!(fx.router.broadcast(Arc::from("frame-1")), 1);
        assert_eq!(texts(&mut ra), vec!["frame-1".to_string()]);
        assert!(texts(&mut rb).is_empty());
    }

    #[tokio::test]
    async fn pump_broadcasts_in_order() {
        let mut fx = fixture(RouterOptions::default());
        let (_a, mut ra) = join(&fx.registry, 1);
        let upstream_rx = fx.upstream_rx.take().unwrap();
        let pump = tokio::spawn(fx.router.clone().run_upstream_pump(upstream_rx));

        for text in ["r1", "pong", "r2", "r3"] {
            fx.link.on_receive(text.to_string());
        }
        settle().await;

        assert_eq!(texts(&mut ra), vec!["r1", "r2", "r3"]);
        pump.abort();
    }

    #[tokio::test]
    async fn concurrent_broadcast_and_churn_never_faults() {
        let fx = fixture(RouterOptions::default());
        let mut receivers = Vec::new();
        for id in 1..=50 {
            receivers.push(join(&fx.registry, id).1);
        }

        let router = fx.router.clone();
        let sender = tokio::spawn(async move {
            for i in 0..200 {
                router.broadcast(Arc::from(format!("frame-{}", i)));
                tokio::task::yield_now().await;
            }
        });
        let registry = fx.registry.clone();
        let churn = tokio::spawn(async move {
            for id in 1..=50 {
                registry.remove(id);
                tokio::task::yield_now().await;
            }
        });
        sender.await.unwrap();
        churn.await.unwrap();

        assert_eq!(fx.registry.count(), 0);
        assert_eq!(fx.router.broadcast(Arc::from("after")), 0);
        for rx in receivers.iter_mut() {
            assert!(!texts(rx).contains(&"after".to_string()));
        }
    }
}
