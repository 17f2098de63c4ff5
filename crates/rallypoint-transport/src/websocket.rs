//! Client-side WebSocket transport using `tokio-tungstenite`.
//!
//! Each pooled [`ConnectionId`] gets its own socket per target, opened
//! lazily on first use. A request travels as one binary frame holding the
//! JSON-encoded [`Request`]; the next binary frame back is the [`Response`].

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::{ConnectionId, Request, Response, Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketKey = (ConnectionId, String);

/// A [`Transport`] that speaks request/response frames over WebSockets.
#[derive(Default)]
pub struct WebSocketTransport {
    sockets: Mutex<HashMap<SocketKey, Arc<Mutex<WsStream>>>>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the socket for `(connection, target)`, dialing if needed.
    async fn socket(
        &self,
        connection: ConnectionId,
        target: &str,
    ) -> Result<Arc<Mutex<WsStream>>, TransportError> {
        let key = (connection, target.to_string());
        if let Some(existing) = self.sockets.lock().await.get(&key) {
            return Ok(Arc::clone(existing));
        }

        let url = if target.starts_with("ws://") || target.starts_with("wss://") {
            target.to_string()
        } else {
            format!("ws://{target}")
        };
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| {
                TransportError::ConnectFailed(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    e,
                ))
            })?;
        tracing::debug!(%connection, %url, "WebSocket connected");

        let ws = Arc::new(Mutex::new(ws));
        self.sockets.lock().await.insert(key, Arc::clone(&ws));
        Ok(ws)
    }

    /// Forgets a socket after an I/O failure so the next send redials.
    async fn evict(&self, connection: ConnectionId, target: &str) {
        self.sockets
            .lock()
            .await
            .remove(&(connection, target.to_string()));
    }

    async fn exchange(
        socket: &Mutex<WsStream>,
        frame: Vec<u8>,
    ) -> Result<Response, TransportError> {
        let mut ws = socket.lock().await;
        ws.send(Message::Binary(frame.into())).await.map_err(|e| {
            TransportError::SendFailed(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                e,
            ))
        })?;

        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    return serde_json::from_slice(&data)
                        .map_err(|e| TransportError::Malformed(e.to_string()));
                }
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(text.as_str())
                        .map_err(|e| TransportError::Malformed(e.to_string()));
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(TransportError::ConnectionClosed(
                        "socket closed before response".into(),
                    ));
                }
                Some(Ok(_)) => continue, // ping/pong/frame
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(
                        std::io::Error::new(
                            std::io::ErrorKind::ConnectionReset,
                            e,
                        ),
                    ));
                }
            }
        }
    }
}

impl Transport for WebSocketTransport {
    async fn send(
        &self,
        connection: ConnectionId,
        request: &Request,
    ) -> Result<Response, TransportError> {
        let frame = serde_json::to_vec(request)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        let socket = self.socket(connection, &request.target).await?;

        let result = Self::exchange(&socket, frame).await;
        if matches!(
            result,
            Err(TransportError::SendFailed(_)
                | TransportError::ReceiveFailed(_)
                | TransportError::ConnectionClosed(_))
        ) {
            self.evict(connection, &request.target).await;
        }
        result
    }

    async fn close(&self, connection: ConnectionId) {
        let stale: Vec<Arc<Mutex<WsStream>>> = {
            let mut sockets = self.sockets.lock().await;
            let keys: Vec<SocketKey> = sockets
                .keys()
                .filter(|(id, _)| *id == connection)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| sockets.remove(k)).collect()
        };
        for socket in stale {
            let _ = socket.lock().await.close(None).await;
        }
        tracing::debug!(%connection, "WebSocket connection closed");
    }
}
