//! # Connection Driver
//!
//! One task per connection. The task owns the [`ServerSession`] exclusively and
//! is the only caller of its transition methods. It suspends in exactly two
//! places: waiting for the next event (inbound frame, close request or the
//! session's next deadline) and waiting for room in the outbound queue.

use crate::audiohook::codec::FrameCodec;
use crate::audiohook::message::{CloseReason, ControlMessage};
use crate::audiohook::registry::SessionRegistry;
use crate::audiohook::session::{ServerSession, SessionState, SessionSummary};
use crate::audiohook::transport::{Outgoing, SessionEnd, TransportEvent};
use crate::config::ProtocolConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// How often an open session refreshes its registry snapshot while streaming.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

/// Keeps a session listed in the registry until dropped, whatever the exit path.
struct Registration {
    registry: Arc<SessionRegistry>,
    session_id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(&self.session_id);
    }
}

/// Run one server-role connection to completion and return its final summary.
pub async fn run_server_connection(
    config: Arc<ProtocolConfig>,
    registry: Arc<SessionRegistry>,
    mut transport: SessionEnd,
    peer: Option<String>,
) -> SessionSummary {
    let peer = peer.unwrap_or_else(|| "unknown".to_string());
    let codec = FrameCodec::default();
    let mut session = ServerSession::new(config, Instant::now());
    let mut cancel = registry.shutdown_token();
    let mut close_requested = false;
    let mut registration: Option<Registration> = None;
    let mut last_snapshot = Instant::now();

    debug!(peer = %peer, "Connection accepted");

    while !session.is_terminal() {
        let state_before = session.state();
        let deadline = session
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        let replies: Vec<ControlMessage> = tokio::select! {
            _ = cancel.cancelled(), if !close_requested => {
                close_requested = true;
                let reason = registration
                    .as_ref()
                    .map(|r| registry.requested_close_reason(&r.session_id))
                    .unwrap_or(CloseReason::Shutdown);
                session.request_close(reason, Instant::now())
            }
            event = transport.recv() => match event {
                Some(TransportEvent::Frame(raw)) => session.on_frame(&raw, Instant::now(), &*registry),
                Some(TransportEvent::Rejected(reason)) => session.on_rejected(&reason, Instant::now()),
                Some(TransportEvent::Failed(reason)) => {
                    session.on_transport_lost(&reason, Instant::now());
                    Vec::new()
                }
                Some(TransportEvent::Closed) | None => {
                    session.on_transport_lost("peer closed the connection", Instant::now());
                    Vec::new()
                }
            },
            _ = sleep_until(deadline) => session.on_tick(Instant::now()),
        };

        for reply in replies {
            let sent = match codec.encode_control(&reply) {
                Ok(raw) => transport.send(Outgoing::Frame(raw)).await,
                Err(err) => Err(err),
            };
            if let Err(err) = sent {
                session.on_send_failed(&err, Instant::now());
                break;
            }
        }

        if registration.is_none() && state_before == SessionState::AwaitingOpen {
            if let Some(id) = session.session_id() {
                let id = id.to_string();
                if let Some(token) = registry.close_token(&id) {
                    cancel = token;
                }
                registration = Some(Registration {
                    registry: registry.clone(),
                    session_id: id,
                });
            }
        }

        let now = Instant::now();
        if registration.is_some()
            && (session.state() != state_before || now.duration_since(last_snapshot) >= SNAPSHOT_INTERVAL)
        {
            registry.register(session.summary(now));
            last_snapshot = now;
        }
    }

    // Best effort: the socket may already be gone
    if transport.send(Outgoing::Close(session.close_reason())).await.is_err() {
        debug!(peer = %peer, "Socket closed before close frame");
    }

    let summary = session.summary(Instant::now());
    match summary.state {
        SessionState::Closed => info!(
            peer = %peer,
            session_id = ?summary.session_id,
            close_reason = ?summary.close_reason,
            duration_ms = summary.duration_ms,
            frames = summary.frames_received,
            position = summary.position,
            discarded_bytes = summary.discarded_bytes,
            "Session ended"
        ),
        _ => warn!(
            peer = %peer,
            session_id = ?summary.session_id,
            error_code = ?summary.error_code,
            close_reason = ?summary.close_reason,
            duration_ms = summary.duration_ms,
            frames = summary.frames_received,
            "Session failed"
        ),
    }

    registry.record_outcome(&summary);
    drop(registration);
    summary
}
