//! Message-oriented transports.
//!
//! A [`Transport`] is a send handle plus a receiver of [`Inbound`] events.
//! One `send` on one side is exactly one [`Inbound::Frame`] on the other, in
//! order. Two backends exist: a WebSocket pump and an in-memory link used by
//! tests and same-process bindings.

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use url::Url;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("websocket handshake failed: {0}")]
    Accept(String),

    #[error("transport closed")]
    Closed,
}

/// What the receiving side observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame(String),
    /// The connection is gone; nothing follows.
    Closed,
}

#[derive(Debug)]
enum Outbound {
    Frame(String),
    Close,
}

/// Cloneable sending half of a transport.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    tx: mpsc::UnboundedSender<Outbound>,
    peer: String,
}

impl TransportHandle {
    pub fn send(&self, frame: impl Into<String>) -> Result<(), TransportError> {
        self.tx
            .send(Outbound::Frame(frame.into()))
            .map_err(|_| TransportError::Closed)
    }

    /// Requests a close. Safe to call more than once.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Address or label of the remote end.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

/// A connected transport.
#[derive(Debug)]
pub struct Transport {
    pub handle: TransportHandle,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// Pumps a WebSocket stream: text messages in both directions, one frame per
/// message.
pub fn websocket<S>(stream: WebSocketStream<S>, peer: impl Into<String>) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer = peer.into();
    let (mut ws_sink, mut ws_stream) = stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Inbound>();

    let writer_peer = peer.clone();
    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            match message {
                Outbound::Frame(frame) => {
                    if let Err(e) = ws_sink.send(WsMessage::Text(frame)).await {
                        tracing::debug!(peer = %writer_peer, "failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sink.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
        let _ = ws_sink.close().await;
    });

    let reader_peer = peer.clone();
    tokio::spawn(async move {
        while let Some(result) = ws_stream.next().await {
            match result {
                Ok(WsMessage::Text(text)) => {
                    if in_tx.send(Inbound::Frame(text)).is_err() {
                        break;
                    }
                }
                Ok(WsMessage::Close(_)) => break,
                Err(e) => {
                    tracing::debug!(peer = %reader_peer, "WebSocket error: {}", e);
                    break;
                }
                _ => {
                    // Ping/pong/binary frames carry nothing for us.
                }
            }
        }
        let _ = in_tx.send(Inbound::Closed);
    });

    Transport {
        handle: TransportHandle { tx: out_tx, peer },
        inbound: in_rx,
    }
}

/// Normalizes `host:port` or a full URL into a `ws://` URL.
pub fn websocket_url(address: &str) -> Result<Url, TransportError> {
    let address = address.trim();
    let candidate = if address.contains("://") {
        address.to_string()
    } else {
        format!("ws://{}", address)
    };
    let url = Url::parse(&candidate)
        .map_err(|e| TransportError::InvalidAddress(format!("{}: {}", address, e)))?;
    if url.scheme() != "ws" {
        return Err(TransportError::InvalidAddress(format!(
            "{}: only ws:// is supported",
            address
        )));
    }
    Ok(url)
}

/// Opens a WebSocket connection to `address`.
pub async fn connect(address: &str) -> Result<Transport, TransportError> {
    let url = websocket_url(address)?;
    tracing::info!("Connecting to {}", url);
    let (stream, _) = connect_async(url.as_str())
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    Ok(websocket(stream, url.to_string()))
}

/// Completes the server side of a WebSocket handshake.
pub async fn accept(stream: TcpStream) -> Result<Transport, TransportError> {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let stream = accept_async(stream)
        .await
        .map_err(|e| TransportError::Accept(e.to_string()))?;
    Ok(websocket(stream, peer))
}

/// Two transports wired back to back.
pub fn memory_pair() -> (Transport, Transport) {
    let (a_out_tx, a_out_rx) = mpsc::unbounded_channel();
    let (b_out_tx, b_out_rx) = mpsc::unbounded_channel();
    let (a_in_tx, a_in_rx) = mpsc::unbounded_channel();
    let (b_in_tx, b_in_rx) = mpsc::unbounded_channel();

    tokio::spawn(relay(a_out_rx, b_in_tx.clone(), a_in_tx.clone()));
    tokio::spawn(relay(b_out_rx, a_in_tx, b_in_tx));

    (
        Transport {
            handle: TransportHandle {
                tx: a_out_tx,
                peer: "memory:b".to_string(),
            },
            inbound: a_in_rx,
        },
        Transport {
            handle: TransportHandle {
                tx: b_out_tx,
                peer: "memory:a".to_string(),
            },
            inbound: b_in_rx,
        },
    )
}

async fn relay(
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    remote: mpsc::UnboundedSender<Inbound>,
    local: mpsc::UnboundedSender<Inbound>,
) {
    while let Some(message) = outbound.recv().await {
        match message {
            Outbound::Frame(frame) => {
                if remote.send(Inbound::Frame(frame)).is_err() {
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = remote.send(Inbound::Closed);
    let _ = local.send(Inbound::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url() {
        assert_eq!(
            websocket_url("127.0.0.1:8080").unwrap().as_str(),
            "ws://127.0.0.1:8080/"
        );
        assert_eq!(
            websocket_url("ws://localhost:9000/term").unwrap().as_str(),
            "ws://localhost:9000/term"
        );
        assert!(websocket_url("wss://localhost:9000").is_err());
        assert!(websocket_url("http://[::1").is_err());
    }

    #[tokio::test]
    async fn test_memory_pair_preserves_order() {
        let (a, mut b) = memory_pair();
        a.handle.send("one").unwrap();
        a.handle.send("two").unwrap();

        assert_eq!(b.inbound.recv().await, Some(Inbound::Frame("one".into())));
        assert_eq!(b.inbound.recv().await, Some(Inbound::Frame("two".into())));
    }

    #[tokio::test]
    async fn test_memory_close_reaches_both_ends() {
        let (mut a, mut b) = memory_pair();
        a.handle.close();

        assert_eq!(b.inbound.recv().await, Some(Inbound::Closed));
        assert_eq!(a.inbound.recv().await, Some(Inbound::Closed));
    }

    #[tokio::test]
    async fn test_websocket_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut transport = accept(stream).await.unwrap();
            let frame = transport.inbound.recv().await;
            transport.handle.send("pong").unwrap();
            frame
        });

        let mut client = connect(&addr.to_string()).await.unwrap();
        client.handle.send("ping").unwrap();
        assert_eq!(
            client.inbound.recv().await,
            Some(Inbound::Frame("pong".into()))
        );
        assert_eq!(
            server.await.unwrap(),
            Some(Inbound::Frame("ping".into()))
        );
    }
}
