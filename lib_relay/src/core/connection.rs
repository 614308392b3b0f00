//! # Client Connection Handle
//!
//! A `ClientConnection` is the relay's view of one downstream session. It does
//! not own the socket. Instead it holds the sending half of an unbounded MPSC
//! queue drained by the session's writer task, so a send never blocks the
//! caller and frames for one client are always written in the order they were
//! queued.
//!
//! Payloads travel as `Arc<str>`: a broadcast to N clients queues N pointers to
//! the same allocation rather than N copies of the text.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::core::error::{RelayError, RelayResult};

/// Unique identifier of a client session within one relay process.
pub type ClientId = u64;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a fresh, process-unique client id.
pub fn next_client_id() -> ClientId {
    NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A frame queued for delivery to a client socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// A text message.
    Text(Arc<str>),
    /// Ask the writer task to close the socket.
    Close,
}

#[derive(Debug)]
struct Inner {
    id: ClientId,
    peer: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    open: AtomicBool,
    sender: mpsc::UnboundedSender<OutboundFrame>,
}

/// Cheaply clonable handle to one downstream session.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    inner: Arc<Inner>,
}

impl ClientConnection {
    /// Creates a handle with a freshly allocated id.
    ///
    /// The returned receiver must be drained by the task that owns the socket.
    pub fn new(peer: Option<SocketAddr>) -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        Self::with_id(next_client_id(), peer)
    }

    /// Creates a handle with an explicit id.
    pub fn with_id(
        id: ClientId,
        peer: Option<SocketAddr>,
    ) -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (sender, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            id,
            peer,
            connected_at: Utc::now(),
            open: AtomicBool::new(true),
            sender,
        };
        (Self { inner: Arc::new(inner) }, rx)
    }

    /// The session id.
    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    /// Remote address, when the transport knows it.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// When the handle was created.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    /// `false` once the session closed or its writer went away.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire) && !self.inner.sender.is_closed()
    }

    /// `true` once the relay closed the session, by deregistering it or via
    /// [`close`](Self::close). A dead writer alone does not count.
    pub fn is_marked_closed(&self) -> bool {
        !self.inner.open.load(Ordering::Acquire)
    }

    /// Marks the session closed. Later sends fail with `ClientClosed`.
    pub fn mark_closed(&self) {
        self.inner.open.store(false, Ordering::Release);
    }

    /// Queues a text frame for this client.
    pub fn send_text(&self, text: Arc<str>) -> RelayResult<()> {
        if !self.inner.open.load(Ordering::Acquire) {
            return Err(RelayError::ClientClosed(self.inner.id));
        }
        self.inner
            .sender
            .send(OutboundFrame::Text(text))
            .map_err(|_| RelayError::ClientClosed(self.inner.id))
    }

    /// Sends an error back to this client as in-band text.
    ///
    /// Failure to deliver the error is only logged: the client is gone.
    pub fn send_error(&self, err: &RelayError) {
        let text: Arc<str> = Arc::from(err.client_text());
        if let Err(e) = self.send_text(text) {
            tracing::debug!(client_id = self.inner.id, error = %e, "error reply not delivered");
        }
    }

    /// Asks the writer task to close the socket and marks the handle closed.
    pub fn close(&self) {
        let _ = self.inner.sender.send(OutboundFrame::Close);
        self.mark_closed();
    }
}

impl PartialEq for ClientConnection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ClientConnection {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let (a, _ra) = ClientConnection::new(None);
        let (b, _rb) = ClientConnection::new(None);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn frames_arrive_in_queue_order() {
        let (conn, mut rx) = ClientConnection::with_id(7, None);
        conn.send_text(Arc::from("one")).unwrap();
        conn.send_text(Arc::from("two")).unwrap();
        assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Text(Arc::from("one")));
        assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Text(Arc::from("two")));
    }

    #[test]
    fn send_fails_once_writer_is_gone() {
        let (conn, rx) = ClientConnection::with_id(8, None);
        drop(rx);
        assert!(!conn.is_open());
        assert_eq!(conn.send_text(Arc::from("x")), Err(RelayError::ClientClosed(8)));
    }

    #[test]
    fn closed_handle_rejects_sends() {
        let (conn, mut rx) = ClientConnection::with_id(9, None);
        conn.close();
        assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Close);
        assert!(conn.send_text(Arc::from("late")).is_err());
    }

    #[test]
    fn error_reply_is_prefixed() {
        let (conn, mut rx) = ClientConnection::with_id(10, None);
        conn.send_error(&RelayError::UpstreamUnavailable);
        match rx.try_recv().unwrap() {
            OutboundFrame::Text(t) => assert!(t.starts_with("错误：")),
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
