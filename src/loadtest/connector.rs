//! How simulated clients reach the server engine: an in-process loopback into
//! this server's own registry, or a real websocket to a remote endpoint.

use crate::audiohook::codec::{Opcode, RawFrame};
use crate::audiohook::connection::run_server_connection;
use crate::audiohook::registry::SessionRegistry;
use crate::audiohook::transport::{self, Outgoing, SocketEnd, TransportEvent};
use crate::config::ProtocolConfig;
use crate::error::ProtocolError;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

#[derive(Clone)]
pub enum Connector {
    Loopback {
        config: Arc<ProtocolConfig>,
        registry: Arc<SessionRegistry>,
    },
    WebSocket {
        url: String,
    },
}

impl Connector {
    pub fn describe(&self) -> String {
        match self {
            Connector::Loopback { .. } => "loopback".to_string(),
            Connector::WebSocket { url } => url.clone(),
        }
    }

    pub async fn connect(&self) -> Result<ClientConnection, ProtocolError> {
        match self {
            Connector::Loopback { config, registry } => {
                let (session_end, socket_end) = transport::channel(config);
                tokio::spawn(run_server_connection(
                    config.clone(),
                    registry.clone(),
                    session_end,
                    Some("loopback".to_string()),
                ));
                Ok(ClientConnection::Loopback(socket_end))
            }
            Connector::WebSocket { url } => {
                let (stream, _) = connect_async(url.as_str())
                    .await
                    .map_err(|e| ProtocolError::TransportFailure(format!("connect to {} failed: {}", url, e)))?;
                debug!(url = %url, "Load-test client connected");
                Ok(ClientConnection::WebSocket(Box::new(stream)))
            }
        }
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connector({})", self.describe())
    }
}

/// The client's end of one connection.
pub enum ClientConnection {
    Loopback(SocketEnd),
    WebSocket(Box<WebSocketStream<MaybeTlsStream<TcpStream>>>),
}

impl ClientConnection {
    pub async fn send(&mut self, frame: RawFrame) -> Result<(), ProtocolError> {
        match self {
            ClientConnection::Loopback(end) => end
                .inbound
                .send(TransportEvent::Frame(frame))
                .await
                .map_err(|_| ProtocolError::TransportFailure("server connection ended".to_string())),
            ClientConnection::WebSocket(stream) => {
                let message = match frame.opcode {
                    Opcode::Text => Message::Text(
                        String::from_utf8(frame.payload.to_vec())
                            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?,
                    ),
                    Opcode::Binary => Message::Binary(frame.payload.to_vec()),
                };
                stream
                    .send(message)
                    .await
                    .map_err(|e| ProtocolError::TransportFailure(e.to_string()))
            }
        }
    }

    /// Next data frame from the server, or `None` once the connection is closed.
    pub async fn recv(&mut self) -> Result<Option<RawFrame>, ProtocolError> {
        match self {
            ClientConnection::Loopback(end) => match end.outbound.recv().await {
                Some(Outgoing::Frame(frame)) => Ok(Some(frame)),
                Some(Outgoing::Close(_)) | None => Ok(None),
            },
            ClientConnection::WebSocket(stream) => loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => return Ok(Some(RawFrame::text(text))),
                    Some(Ok(Message::Binary(data))) => return Ok(Some(RawFrame::binary(data))),
                    Some(Ok(Message::Close(_))) | None => return Ok(None),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(ProtocolError::TransportFailure(e.to_string())),
                }
            },
        }
    }

    pub async fn close(&mut self) {
        match self {
            ClientConnection::Loopback(end) => {
                // The server side may already be gone
                let _ = end.inbound.send(TransportEvent::Closed).await;
            }
            ClientConnection::WebSocket(stream) => {
                // Inherent close handshake, not `SinkExt::close`
                let _ = (**stream).close(None).await;
            }
        }
    }
}
