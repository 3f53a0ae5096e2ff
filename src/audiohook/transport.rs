//! # Transport Adapter
//!
//! Decouples the session engine from any particular websocket library. A
//! connection is a pair of bounded channels:
//!
//! ```text
//!   socket side (actix actor / loopback client)        session task
//!   ───────────────────────────────────────────        ────────────
//!   SocketEnd.inbound  ── TransportEvent ──────────▶   SessionEnd.inbound
//!   SocketEnd.outbound ◀───────── Outgoing ────────    SessionEnd.outbound
//! ```
//!
//! The outbound channel is the per-session outbound queue. Its capacity and the
//! send timeout come from [`ProtocolConfig`]; a send that cannot complete in time
//! is a transport failure.

use crate::audiohook::codec::RawFrame;
use crate::audiohook::message::CloseReason;
use crate::config::ProtocolConfig;
use crate::error::ProtocolError;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

/// Something that happened on the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A complete data frame
    Frame(RawFrame),
    /// The socket refused a frame before it reached the codec (e.g. oversized)
    Rejected(String),
    /// The peer closed the connection
    Closed,
    /// The connection broke
    Failed(String),
}

/// Instruction for the socket side.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Frame(RawFrame),
    /// Close the underlying connection after everything queued before it
    Close(Option<CloseReason>),
}

/// The half of a connection owned by the session task.
#[derive(Debug)]
pub struct SessionEnd {
    pub inbound: mpsc::Receiver<TransportEvent>,
    pub outbound: mpsc::Sender<Outgoing>,
    send_timeout: Duration,
}

/// The half of a connection owned by the socket.
#[derive(Debug)]
pub struct SocketEnd {
    pub inbound: mpsc::Sender<TransportEvent>,
    pub outbound: mpsc::Receiver<Outgoing>,
}

/// Create both halves of a connection sized from the protocol settings.
pub fn channel(config: &ProtocolConfig) -> (SessionEnd, SocketEnd) {
    let (in_tx, in_rx) = mpsc::channel(config.inbound_queue_capacity);
    let (out_tx, out_rx) = mpsc::channel(config.outbound_queue_capacity);
    (
        SessionEnd {
            inbound: in_rx,
            outbound: out_tx,
            send_timeout: config.send_timeout(),
        },
        SocketEnd {
            inbound: in_tx,
            outbound: out_rx,
        },
    )
}

impl SessionEnd {
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }

    /// Queue one item for the socket, waiting at most the send timeout.
    pub async fn send(&self, item: Outgoing) -> Result<(), ProtocolError> {
        match self.outbound.send_timeout(item, self.send_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(ProtocolError::TransportFailure(format!(
                "outbound queue full for {}ms",
                self.send_timeout.as_millis()
            ))),
            Err(SendTimeoutError::Closed(_)) => Err(ProtocolError::TransportFailure(
                "connection closed".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ProtocolConfig {
        ProtocolConfig {
            outbound_queue_capacity: 1,
            inbound_queue_capacity: 1,
            send_timeout_ms: 50,
            ..ProtocolConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_when_queue_stays_full() {
        let (session, _socket) = channel(&small_config());
        session.send(Outgoing::Frame(RawFrame::text("a"))).await.unwrap();

        let err = session
            .send(Outgoing::Frame(RawFrame::text("b")))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::TransportFailure(_)));
    }

    #[tokio::test]
    async fn test_send_fails_when_socket_gone() {
        let (session, socket) = channel(&small_config());
        drop(socket);
        assert!(session.send(Outgoing::Close(None)).await.is_err());
    }

    #[tokio::test]
    async fn test_events_flow_in_order() {
        let (mut session, mut socket) = channel(&ProtocolConfig::default());
        socket.inbound.send(TransportEvent::Frame(RawFrame::text("x"))).await.unwrap();
        socket.inbound.send(TransportEvent::Closed).await.unwrap();
        assert_eq!(session.recv().await, Some(TransportEvent::Frame(RawFrame::text("x"))));
        assert_eq!(session.recv().await, Some(TransportEvent::Closed));

        session.send(Outgoing::Close(Some(CloseReason::End))).await.unwrap();
        assert_eq!(socket.outbound.recv().await, Some(Outgoing::Close(Some(CloseReason::End))));
    }
}
