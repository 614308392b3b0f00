//! # WebSocket Upstream Connector
//!
//! Opens the upstream connection with `tokio-tungstenite` and bridges it to
//! the link's channels. One task per connection owns both halves of the
//! socket: it writes queued frames, reports each write's outcome, and turns
//! inbound frames into [`UpstreamEvent`]s. Aborting that task releases the
//! socket.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::core::error::{RelayError, RelayResult};
use crate::core::upstream_link::{UpstreamConnector, UpstreamEvent, UpstreamFrame, UpstreamTransport};

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a fixed `ws://` or `wss://` address.
#[derive(Debug, Clone)]
pub struct WsUpstreamConnector {
    url: String,
}

impl WsUpstreamConnector {
    /// Creates a connector for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl UpstreamConnector for WsUpstreamConnector {
    fn connect(&self) -> BoxFuture<'static, RelayResult<UpstreamTransport>> {
        let url = self.url.clone();
        Box::pin(async move {
            let (socket, _response) = connect_async(url.as_str())
                .await
                .map_err(|e| RelayError::ConnectFailure(e.to_string()))?;

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(bridge(socket, outbound_rx, inbound_tx));

            Ok(UpstreamTransport {
                outbound: outbound_tx,
                inbound: inbound_rx,
                io_task: Some(task.abort_handle()),
            })
        })
    }

    fn target(&self) -> String {
        self.url.clone()
    }
}

async fn bridge(
    socket: UpstreamSocket,
    mut outbound: mpsc::UnboundedReceiver<UpstreamFrame>,
    inbound: mpsc::UnboundedSender<UpstreamEvent>,
) {
    let (mut write, mut read) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(UpstreamFrame::Text { payload, responder, permit }) => {
                    let result = write
                        .send(Message::text(payload.to_string()))
                        .await
                        .map_err(|e| RelayError::Transport(e.to_string()));
                    drop(permit);
                    let failed = result.is_err();
                    if let Some(responder) = responder {
                        let _ = responder.send(result);
                    }
                    if failed {
                        let _ = inbound.send(UpstreamEvent::Error("upstream write failed".into()));
                        break;
                    }
                }
                Some(UpstreamFrame::Close { reason, done }) => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: reason.into(),
                    };
                    if let Err(e) = write.send(Message::Close(Some(frame))).await {
                        tracing::debug!(error = %e, "upstream close frame not sent");
                    }
                    let _ = done.send(());
                    break;
                }
                None => {
                    let _ = write.close().await;
                    break;
                }
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(UpstreamEvent::Text(text.as_str().to_owned())).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    tracing::debug!(bytes = data.len(), "ignoring binary frame from upstream");
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.as_str().to_owned()),
                        None => (None, String::new()),
                    };
                    let _ = inbound.send(UpstreamEvent::Closed { code, reason });
                    break;
                }
                // Protocol-level ping/pong is answered by tungstenite.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = inbound.send(UpstreamEvent::Error(e.to_string()));
                    break;
                }
                None => {
                    let _ = inbound.send(UpstreamEvent::Closed {
                        code: None,
                        reason: "stream ended".into(),
                    });
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    async fn echo_upstream() -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut seen = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(t) => {
                        let text = t.as_str().to_owned();
                        let reply = if text == "ping" { "pong".to_string() } else { format!("ack:{}", text) };
                        seen.push(text);
                        ws.send(Message::text(reply)).await.unwrap();
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            seen
        });
        (url, server)
    }

    #[tokio::test]
    async fn refused_connection_is_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = WsUpstreamConnector::new(format!("ws://{}", addr));
        match connector.connect().await {
            Err(RelayError::ConnectFailure(_)) => {}
            other => panic!("expected connect failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn bridges_text_both_ways_and_closes() {
        let (url, server) = echo_upstream().await;
        let connector = WsUpstreamConnector::new(url.clone());
        assert_eq!(connector.target(), url);

        let mut transport = connector.connect().await.unwrap();
        let (ack_tx, ack_rx) = oneshot::channel();
        transport
            .outbound
            .send(UpstreamFrame::Text {
                payload: Arc::from("data:image/png;base64,AA"),
                responder: Some(ack_tx),
                permit: None,
            })
            .unwrap();
        assert_eq!(ack_rx.await.unwrap(), Ok(()));
        assert_eq!(
            transport.inbound.recv().await.unwrap(),
            UpstreamEvent::Text("ack:data:image/png;base64,AA".into())
        );

        let (done_tx, done_rx) = oneshot::channel();
        transport
            .outbound
            .send(UpstreamFrame::Close {
                reason: "Client disconnected".into(),
                done: done_tx,
            })
            .unwrap();
        done_rx.await.unwrap();

        let seen = server.await.unwrap();
        assert_eq!(seen, vec!["data:image/png;base64,AA".to_string()]);
    }
}
