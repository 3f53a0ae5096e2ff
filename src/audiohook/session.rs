//! # AudioHook Session State Machine
//!
//! The authoritative per-connection protocol engine (server role). A session is
//! a plain value: every input goes through one of a handful of `&mut self`
//! methods, each of which validates the input against the current state, updates
//! counters and returns the control messages to send back. Nothing in here
//! touches a socket or a clock, so every transition is unit-testable.
//!
//! ## Session Lifecycle:
//! ```text
//! AwaitingOpen --open--> Open --close--> Closing --(closed sent)--> Closed
//!      |                  |  \--timeout/shutdown--> Closing --closed/grace--> Closed
//!      \------------------+------------ any violation ------------> Errored
//! ```
//!
//! ## Sequence Numbers:
//! - Client side: `open` is seq 0; audio frames, `close` and `closed` must each
//!   carry exactly the previous value + 1. `ping`, `pause` and `resume` carry the
//!   sender's next seq but neither consume nor check it.
//! - Server side: every message the server emits consumes the next server seq,
//!   starting with `opened` at 0.

use crate::audiohook::codec::{AudioFrame, Frame, FrameCodec, RawFrame};
use crate::audiohook::message::{CloseReason, ControlBody, ControlMessage, MediaFormat};
use crate::config::ProtocolConfig;
use crate::error::{ErrorCode, ProtocolError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Protocol state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    AwaitingOpen,
    Open,
    Closing,
    Closed,
    Errored,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::AwaitingOpen => "awaiting_open",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Errored => "errored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Errored)
    }

    /// Edges of the state graph. Anything not listed is a bug in the engine.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (AwaitingOpen, Open)
                | (Open, Closing)
                | (Closing, Closed)
                | (AwaitingOpen | Open | Closing, Errored)
        )
    }
}

/// Hands out session identifiers. Implemented by the session registry.
pub trait SessionIds {
    /// Claim `proposed` (or a fresh id when `None`). Ids are never handed out twice.
    fn reserve(&self, proposed: Option<&str>) -> Result<String, ProtocolError>;
}

/// A paused interval: audio that was received but excluded from `position`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscardedSpan {
    /// Position at which the pause began
    pub start_position: u64,
    pub frames: u64,
    pub bytes: u64,
    pub duration_ms: u64,
}

/// Record of a session, live or final. This is what the persistence
/// collaborator receives when a session ends.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub state: SessionState,
    pub close_reason: Option<CloseReason>,
    pub error_code: Option<ErrorCode>,
    pub media: Option<MediaFormat>,
    pub max_frame_size: usize,
    pub started_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub position: u64,
    pub position_ms: u64,
    pub paused: bool,
    pub discarded_frames: u64,
    pub discarded_bytes: u64,
    pub discarded_spans: Vec<DiscardedSpan>,
}

#[derive(Debug)]
struct OpenSpan {
    span: DiscardedSpan,
    started: Instant,
}

/// Server-role protocol engine for one connection.
#[derive(Debug)]
pub struct ServerSession {
    config: Arc<ProtocolConfig>,
    codec: FrameCodec,
    state: SessionState,
    session_id: Option<String>,
    media: Option<MediaFormat>,

    /// Next counted seq expected from the client
    next_client_seq: u64,
    /// Seq the next server message will carry
    next_server_seq: u64,

    position: u64,
    paused: bool,
    frames_received: u64,
    bytes_received: u64,
    discarded_frames: u64,
    discarded_bytes: u64,
    discarded_spans: Vec<DiscardedSpan>,
    current_pause: Option<OpenSpan>,

    started_at: DateTime<Utc>,
    opened_at: Option<DateTime<Utc>>,
    accepted: Instant,
    last_activity: Instant,
    closing_deadline: Option<Instant>,
    ended: Option<Instant>,
    close_reason: Option<CloseReason>,
    error_code: Option<ErrorCode>,
}

impl ServerSession {
    pub fn new(config: Arc<ProtocolConfig>, now: Instant) -> Self {
        let codec = FrameCodec::new(config.max_payload_bytes);
        Self {
            config,
            codec,
            state: SessionState::AwaitingOpen,
            session_id: None,
            media: None,
            next_client_seq: 0,
            next_server_seq: 0,
            position: 0,
            paused: false,
            frames_received: 0,
            bytes_received: 0,
            discarded_frames: 0,
            discarded_bytes: 0,
            discarded_spans: Vec::new(),
            current_pause: None,
            started_at: Utc::now(),
            opened_at: None,
            accepted: now,
            last_activity: now,
            closing_deadline: None,
            ended: None,
            close_reason: None,
            error_code: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error_code
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Handle one inbound data frame. Decoding failures are fatal to the session,
    /// except while closing, where anything but `closed` is ignored.
    pub fn on_frame(&mut self, raw: &RawFrame, now: Instant, ids: &dyn SessionIds) -> Vec<ControlMessage> {
        if self.is_terminal() {
            debug!(session_id = ?self.session_id, "Dropping frame for terminated session");
            return Vec::new();
        }
        self.last_activity = now;

        let frame = match self.codec.decode(raw) {
            Ok(frame) => frame,
            Err(err) if self.state == SessionState::Closing => {
                debug!(session_id = ?self.session_id, error = %err, "Ignoring undecodable frame while closing");
                return Vec::new();
            }
            Err(err) => return self.fail(err, now),
        };

        let result = match self.state {
            SessionState::AwaitingOpen => self.handle_awaiting_open(frame, now, ids),
            SessionState::Open => self.handle_open(frame, now),
            SessionState::Closing => Ok(self.handle_closing(frame, now)),
            SessionState::Closed | SessionState::Errored => Ok(Vec::new()),
        };

        match result {
            Ok(replies) => replies,
            Err(err) => self.fail(err, now),
        }
    }

    /// The transport refused a frame before it could be decoded (e.g. oversized).
    pub fn on_rejected(&mut self, reason: &str, now: Instant) -> Vec<ControlMessage> {
        if self.state == SessionState::Closing {
            debug!(session_id = ?self.session_id, reason = %reason, "Ignoring rejected frame while closing");
            return Vec::new();
        }
        self.fail(ProtocolError::MalformedFrame(reason.to_string()), now)
    }

    /// The connection is gone; nothing can be sent any more.
    pub fn on_transport_lost(&mut self, reason: &str, now: Instant) {
        match self.state {
            SessionState::Closing => {
                debug!(session_id = ?self.session_id, "Transport ended during close handshake");
                self.transition(SessionState::Closed, now);
            }
            SessionState::AwaitingOpen | SessionState::Open => {
                warn!(session_id = ?self.session_id, reason = %reason, "Transport lost");
                self.error_code = Some(ErrorCode::TransportFailure);
                self.close_reason.get_or_insert(CloseReason::Disconnect);
                self.transition(SessionState::Errored, now);
            }
            SessionState::Closed | SessionState::Errored => {}
        }
    }

    /// An outbound frame could not be delivered (queue overflow or closed socket).
    pub fn on_send_failed(&mut self, err: &ProtocolError, now: Instant) {
        if self.is_terminal() {
            return;
        }
        warn!(session_id = ?self.session_id, error = %err, "Outbound send failed");
        self.error_code = Some(ErrorCode::TransportFailure);
        self.close_reason.get_or_insert(CloseReason::Disconnect);
        self.transition(SessionState::Errored, now);
    }

    /// Server-initiated close (shutdown or operator request).
    pub fn request_close(&mut self, reason: CloseReason, now: Instant) -> Vec<ControlMessage> {
        match self.state {
            SessionState::Open => self.begin_close(reason, now),
            SessionState::AwaitingOpen => {
                self.close_reason = Some(reason);
                let close = self.emit(ControlBody::Close { reason: Some(reason) });
                self.transition(SessionState::Errored, now);
                vec![close]
            }
            _ => Vec::new(),
        }
    }

    /// Apply timeouts. Call whenever [`next_deadline`](Self::next_deadline) passes.
    pub fn on_tick(&mut self, now: Instant) -> Vec<ControlMessage> {
        match self.state {
            SessionState::AwaitingOpen if now >= self.inactivity_deadline() => {
                self.fail(ProtocolError::Timeout("no open received".to_string()), now)
            }
            SessionState::Open if now >= self.inactivity_deadline() => {
                info!(session_id = ?self.session_id, "Session inactive, closing");
                self.begin_close(CloseReason::Timeout, now)
            }
            SessionState::Closing => {
                if self.closing_deadline.map(|d| now >= d).unwrap_or(true) {
                    debug!(session_id = ?self.session_id, "Close grace elapsed");
                    self.transition(SessionState::Closed, now);
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// When the session next needs [`on_tick`](Self::on_tick), if ever.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            SessionState::AwaitingOpen | SessionState::Open => Some(self.inactivity_deadline()),
            SessionState::Closing => self.closing_deadline,
            SessionState::Closed | SessionState::Errored => None,
        }
    }

    pub fn summary(&self, now: Instant) -> SessionSummary {
        let end = self.ended.unwrap_or(now);
        let mut spans = self.discarded_spans.clone();
        if let Some(open) = &self.current_pause {
            let mut span = open.span.clone();
            span.duration_ms = end.saturating_duration_since(open.started).as_millis() as u64;
            spans.push(span);
        }

        SessionSummary {
            session_id: self.session_id.clone(),
            state: self.state,
            close_reason: self.close_reason,
            error_code: self.error_code,
            media: self.media,
            max_frame_size: self.codec.max_payload(),
            started_at: self.started_at,
            opened_at: self.opened_at,
            duration_ms: end.saturating_duration_since(self.accepted).as_millis() as u64,
            frames_received: self.frames_received,
            bytes_received: self.bytes_received,
            position: self.position,
            position_ms: self.media.map(|m| m.duration_ms(self.position)).unwrap_or(0),
            paused: self.paused,
            discarded_frames: self.discarded_frames,
            discarded_bytes: self.discarded_bytes,
            discarded_spans: spans,
        }
    }

    fn handle_awaiting_open(
        &mut self,
        frame: Frame,
        now: Instant,
        ids: &dyn SessionIds,
    ) -> Result<Vec<ControlMessage>, ProtocolError> {
        let msg = match frame {
            Frame::Control(msg) => msg,
            Frame::Audio(_) => {
                return Err(ProtocolError::ProtocolViolation("audio before open".to_string()))
            }
        };

        let ControlBody::Open { session_id, media, max_frame_size } = msg.body else {
            return Err(ProtocolError::ProtocolViolation(format!(
                "expected open, got {}",
                msg.body.kind()
            )));
        };
        self.check_client_seq(msg.seq)?;

        let selected = self.negotiate_media(&media)?;
        let id = ids.reserve(session_id.as_deref())?;

        let limit = self.config.max_payload_bytes;
        let negotiated = max_frame_size
            .filter(|requested| *requested > 0)
            .map(|requested| requested.min(limit))
            .unwrap_or(limit);
        self.codec.set_max_payload(negotiated);

        self.session_id = Some(id.clone());
        self.media = Some(selected);
        self.opened_at = Some(Utc::now());
        self.transition(SessionState::Open, now);

        info!(
            session_id = %id,
            format = ?selected.format,
            rate = selected.rate,
            max_frame_size = negotiated,
            "Session opened"
        );

        Ok(vec![self.emit(ControlBody::Opened {
            session_id: id,
            max_frame_size: negotiated,
            media: selected,
        })])
    }

    fn handle_open(&mut self, frame: Frame, now: Instant) -> Result<Vec<ControlMessage>, ProtocolError> {
        let msg = match frame {
            Frame::Audio(audio) => {
                self.check_client_seq(audio.seq)?;
                self.account_audio(&audio);
                return Ok(Vec::new());
            }
            Frame::Control(msg) => msg,
        };

        match msg.body {
            ControlBody::Ping { nonce } => Ok(vec![self.emit(ControlBody::Pong { nonce })]),
            ControlBody::Pause => {
                self.pause(now);
                Ok(Vec::new())
            }
            ControlBody::Resume => {
                self.resume(now);
                Ok(Vec::new())
            }
            ControlBody::Close { reason } => {
                self.check_client_seq(msg.seq)?;
                let reason = reason.unwrap_or(CloseReason::End);
                self.close_reason = Some(reason);
                let closed = self.emit(ControlBody::Closed { reason: Some(reason) });
                self.transition(SessionState::Closing, now);
                self.transition(SessionState::Closed, now);
                info!(session_id = ?self.session_id, position = self.position, "Session closed by peer");
                Ok(vec![closed])
            }
            ControlBody::Error { code, message } => {
                warn!(session_id = ?self.session_id, code = %code, message = %message, "Peer reported error");
                self.error_code = Some(code);
                self.close_reason.get_or_insert(CloseReason::Error);
                self.transition(SessionState::Errored, now);
                Ok(Vec::new())
            }
            other => Err(ProtocolError::ProtocolViolation(format!(
                "unexpected {} while open",
                other.kind()
            ))),
        }
    }

    /// Server-initiated close in progress: only the peer's `closed` matters, but
    /// in-flight audio is still accounted while the sequence stays contiguous.
    fn handle_closing(&mut self, frame: Frame, now: Instant) -> Vec<ControlMessage> {
        match frame {
            Frame::Audio(audio) => {
                if audio.seq == self.next_client_seq {
                    self.next_client_seq += 1;
                    self.account_audio(&audio);
                } else {
                    debug!(session_id = ?self.session_id, seq = audio.seq, "Ignoring non-contiguous audio while closing");
                }
                Vec::new()
            }
            Frame::Control(msg) => match msg.body {
                ControlBody::Closed { .. } => {
                    if msg.seq == self.next_client_seq {
                        self.next_client_seq += 1;
                    }
                    self.transition(SessionState::Closed, now);
                    Vec::new()
                }
                // Both sides asked to close at once
                ControlBody::Close { .. } => {
                    if msg.seq == self.next_client_seq {
                        self.next_client_seq += 1;
                    }
                    let closed = self.emit(ControlBody::Closed { reason: self.close_reason });
                    self.transition(SessionState::Closed, now);
                    vec![closed]
                }
                other => {
                    debug!(session_id = ?self.session_id, kind = other.kind(), "Ignoring message while closing");
                    Vec::new()
                }
            },
        }
    }

    fn begin_close(&mut self, reason: CloseReason, now: Instant) -> Vec<ControlMessage> {
        self.close_reason = Some(reason);
        self.closing_deadline = Some(now + self.config.close_grace());
        let close = self.emit(ControlBody::Close { reason: Some(reason) });
        self.transition(SessionState::Closing, now);
        vec![close]
    }

    fn fail(&mut self, err: ProtocolError, now: Instant) -> Vec<ControlMessage> {
        if self.is_terminal() {
            return Vec::new();
        }
        warn!(session_id = ?self.session_id, error = %err, "Session failed");

        let code = err.code();
        self.error_code = Some(code);
        self.close_reason.get_or_insert(if code == ErrorCode::Timeout {
            CloseReason::Timeout
        } else {
            CloseReason::Error
        });
        let error = self.emit(ControlBody::Error {
            code,
            message: err.to_string(),
        });
        self.transition(SessionState::Errored, now);
        vec![error]
    }

    fn check_client_seq(&mut self, seq: u64) -> Result<(), ProtocolError> {
        if seq != self.next_client_seq {
            return Err(ProtocolError::SequenceError {
                expected: self.next_client_seq,
                actual: seq,
            });
        }
        self.next_client_seq += 1;
        Ok(())
    }

    fn account_audio(&mut self, audio: &AudioFrame) {
        let len = audio.len() as u64;
        self.frames_received += 1;
        self.bytes_received += len;

        match self.current_pause.as_mut() {
            Some(open) => {
                open.span.frames += 1;
                open.span.bytes += len;
                self.discarded_frames += 1;
                self.discarded_bytes += len;
            }
            None => self.position += len,
        }
    }

    fn pause(&mut self, now: Instant) {
        if self.paused {
            debug!(session_id = ?self.session_id, "Already paused");
            return;
        }
        self.paused = true;
        self.current_pause = Some(OpenSpan {
            span: DiscardedSpan {
                start_position: self.position,
                frames: 0,
                bytes: 0,
                duration_ms: 0,
            },
            started: now,
        });
        debug!(session_id = ?self.session_id, position = self.position, "Session paused");
    }

    fn resume(&mut self, now: Instant) {
        let Some(open) = self.current_pause.take() else {
            debug!(session_id = ?self.session_id, "Resume without pause");
            return;
        };
        self.paused = false;
        let mut span = open.span;
        span.duration_ms = now.saturating_duration_since(open.started).as_millis() as u64;
        debug!(session_id = ?self.session_id, discarded_bytes = span.bytes, "Session resumed");
        self.discarded_spans.push(span);
    }

    fn negotiate_media(&self, offered: &[MediaFormat]) -> Result<MediaFormat, ProtocolError> {
        let supported = &self.config.supported_media;
        if offered.is_empty() {
            return supported
                .first()
                .copied()
                .ok_or_else(|| ProtocolError::ProtocolViolation("no media formats configured".to_string()));
        }
        offered
            .iter()
            .find(|offer| supported.contains(offer))
            .copied()
            .ok_or_else(|| ProtocolError::ProtocolViolation("no supported media format offered".to_string()))
    }

    fn emit(&mut self, body: ControlBody) -> ControlMessage {
        let msg = ControlMessage::new(self.next_server_seq, body);
        self.next_server_seq += 1;
        msg
    }

    fn transition(&mut self, next: SessionState, now: Instant) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        if next.is_terminal() {
            if let Some(open) = self.current_pause.take() {
                let mut span = open.span;
                span.duration_ms = now.saturating_duration_since(open.started).as_millis() as u64;
                self.discarded_spans.push(span);
            }
            self.ended = Some(now);
        }
        self.state = next;
    }

    fn inactivity_deadline(&self) -> Instant {
        self.last_activity + self.config.inactivity_timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audiohook::message::AudioEncoding;
    use crate::audiohook::registry::SessionRegistry;
    use std::time::Duration;

    fn config() -> Arc<ProtocolConfig> {
        Arc::new(ProtocolConfig {
            inactivity_timeout_ms: 1_000,
            close_grace_ms: 200,
            ..ProtocolConfig::default()
        })
    }

    fn text(seq: u64, body: ControlBody) -> RawFrame {
        FrameCodec::default()
            .encode_control(&ControlMessage::new(seq, body))
            .unwrap()
    }

    fn audio(seq: u64, len: usize) -> RawFrame {
        FrameCodec::default()
            .encode_audio(&AudioFrame::new(seq, vec![0u8; len]))
            .unwrap()
    }

    fn open_body() -> ControlBody {
        ControlBody::Open { session_id: None, media: vec![], max_frame_size: None }
    }

    fn opened(registry: &SessionRegistry, now: Instant) -> ServerSession {
        let mut session = ServerSession::new(config(), now);
        let replies = session.on_frame(&text(0, open_body()), now, registry);
        assert_eq!(replies.len(), 1);
        session
    }

    #[test]
    fn test_transition_graph() {
        use SessionState::*;
        assert!(AwaitingOpen.can_transition_to(Open));
        assert!(Open.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(Open.can_transition_to(Errored));
        assert!(!AwaitingOpen.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Errored));
        assert!(!Errored.can_transition_to(Open));
    }

    #[test]
    fn test_open_handshake() {
        let registry = SessionRegistry::new(10);
        let now = Instant::now();
        let mut session = ServerSession::new(config(), now);

        let replies = session.on_frame(&text(0, open_body()), now, &registry);
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].seq, 0);
        match &replies[0].body {
            ControlBody::Opened { session_id, max_frame_size, media } => {
                assert_eq!(Some(session_id.as_str()), session.session_id());
                assert_eq!(*max_frame_size, 65536);
                assert_eq!(*media, MediaFormat::new(AudioEncoding::Pcmu, 8000, 1));
            }
            other => panic!("expected opened, got {:?}", other),
        }
    }

    #[test]
    fn test_negotiated_frame_size_never_exceeds_limit() {
        let registry = SessionRegistry::new(10);
        let now = Instant::now();
        for requested in [Some(1usize), Some(4096), Some(65536), Some(1 << 20), Some(0), None] {
            let mut session = ServerSession::new(config(), now);
            let open = ControlBody::Open { session_id: None, media: vec![], max_frame_size: requested };
            let replies = session.on_frame(&text(0, open), now, &registry);
            let ControlBody::Opened { max_frame_size, .. } = &replies[0].body else {
                panic!("expected opened");
            };
            assert!(*max_frame_size <= 65536);
            if let Some(r) = requested.filter(|r| *r > 0) {
                assert!(*max_frame_size <= r);
            }
        }
    }

    #[test]
    fn test_media_negotiation_picks_first_supported_offer() {
        let registry = SessionRegistry::new(10);
        let now = Instant::now();
        let mut session = ServerSession::new(config(), now);
        let open = ControlBody::Open {
            session_id: None,
            media: vec![
                MediaFormat::new(AudioEncoding::L16, 44100, 2),
                MediaFormat::new(AudioEncoding::L16, 16000, 1),
            ],
            max_frame_size: None,
        };
        let replies = session.on_frame(&text(0, open), now, &registry);
        let ControlBody::Opened { media, .. } = &replies[0].body else {
            panic!("expected opened");
        };
        assert_eq!(*media, MediaFormat::new(AudioEncoding::L16, 16000, 1));

        let mut rejected = ServerSession::new(config(), now);
        let open = ControlBody::Open {
            session_id: None,
            media: vec![MediaFormat::new(AudioEncoding::L16, 44100, 2)],
            max_frame_size: None,
        };
        rejected.on_frame(&text(0, open), now, &registry);
        assert_eq!(rejected.state(), SessionState::Errored);
        assert_eq!(rejected.error_code(), Some(ErrorCode::ProtocolViolation));
    }

    #[test]
    fn test_non_open_first_message_is_violation() {
        let registry = SessionRegistry::new(10);
        let now = Instant::now();

        let mut session = ServerSession::new(config(), now);
        let replies = session.on_frame(&audio(0, 10), now, &registry);
        assert_eq!(session.state(), SessionState::Errored);
        assert!(matches!(
            replies[0].body,
            ControlBody::Error { code: ErrorCode::ProtocolViolation, .. }
        ));

        let mut session = ServerSession::new(config(), now);
        session.on_frame(&text(0, ControlBody::Ping { nonce: "x".into() }), now, &registry);
        assert_eq!(session.error_code(), Some(ErrorCode::ProtocolViolation));
    }

    #[test]
    fn test_duplicate_session_id_is_violation() {
        let registry = SessionRegistry::new(10);
        let now = Instant::now();
        let open = || ControlBody::Open {
            session_id: Some("call-1".into()),
            media: vec![],
            max_frame_size: None,
        };

        let mut first = ServerSession::new(config(), now);
        first.on_frame(&text(0, open()), now, &registry);
        assert_eq!(first.state(), SessionState::Open);

        let mut second = ServerSession::new(config(), now);
        second.on_frame(&text(0, open()), now, &registry);
        assert_eq!(second.state(), SessionState::Errored);
        assert_eq!(second.error_code(), Some(ErrorCode::ProtocolViolation));
        assert_eq!(first.state(), SessionState::Open);
    }

    #[test]
    fn test_position_is_sum_of_accounted_frames() {
        let registry = SessionRegistry::new(10);
        let now = Instant::now();
        let mut session = opened(&registry, now);

        for (seq, len) in [(1, 100), (2, 100), (3, 100)] {
            assert!(session.on_frame(&audio(seq, len), now, &registry).is_empty());
        }
        assert_eq!(session.position(), 300);

        let replies = session.on_frame(&text(4, ControlBody::Close { reason: None }), now, &registry);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::End));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].seq, 1);
        assert!(matches!(replies[0].body, ControlBody::Closed { .. }));
    }

    #[test]
    fn test_paused_audio_is_discarded_not_counted() {
        let registry = SessionRegistry::new(10);
        let now = Instant::now();
        let mut session = opened(&registry, now);

        session.on_frame(&audio(1, 100), now, &registry);
        session.on_frame(&text(2, ControlBody::Pause), now, &registry);
        assert!(session.summary(now).paused);
        session.on_frame(&audio(2, 50), now, &registry);
        session.on_frame(&audio(3, 50), now, &registry);
        assert_eq!(session.position(), 100);

        let later = now + Duration::from_millis(40);
        session.on_frame(&text(4, ControlBody::Resume), later, &registry);
        session.on_frame(&audio(4, 25), later, &registry);
        assert_eq!(session.position(), 125);

        let summary = session.summary(later);
        assert_eq!(summary.discarded_bytes, 100);
        assert_eq!(summary.discarded_frames, 2);
        assert_eq!(
            summary.discarded_spans,
            vec![DiscardedSpan { start_position: 100, frames: 2, bytes: 100, duration_ms: 40 }]
        );
        assert_eq!(summary.bytes_received, 225);
    }

    #[test]
    fn test_sequence_gap_is_fatal() {
        let registry = SessionRegistry::new(10);
        let now = Instant::now();
        let mut session = opened(&registry, now);

        session.on_frame(&audio(1, 10), now, &registry);
        let replies = session.on_frame(&audio(3, 10), now, &registry);
        assert_eq!(session.state(), SessionState::Errored);
        assert_eq!(session.position(), 10);
        match &replies[0].body {
            ControlBody::Error { code, message } => {
                assert_eq!(*code, ErrorCode::SequenceError);
                assert!(message.contains("expected seq 2"));
            }
            other => panic!("expected error, got {:?}", other),
        }

        assert!(session.on_frame(&audio(2, 10), now, &registry).is_empty());
        assert_eq!(session.position(), 10);
    }

    #[test]
    fn test_sequence_repeat_is_fatal() {
        let registry = SessionRegistry::new(10);
        let now = Instant::now();
        let mut session = opened(&registry, now);
        session.on_frame(&audio(1, 10), now, &registry);
        session.on_frame(&audio(1, 10), now, &registry);
        assert_eq!(session.error_code(), Some(ErrorCode::SequenceError));
    }

    #[test]
    fn test_ping_answered_with_pong_without_consuming_client_seq() {
        let registry = SessionRegistry::new(10);
        let now = Instant::now();
        let mut session = opened(&registry, now);

        let replies = session.on_frame(&text(1, ControlBody::Ping { nonce: "abc".into() }), now, &registry);
        assert_eq!(replies, vec![ControlMessage::new(1, ControlBody::Pong { nonce: "abc".into() })]);
        session.on_frame(&audio(1, 10), now, &registry);
        assert_eq!(session.state(), SessionState::Open);
    }

    #[test]
    fn test_inactivity_closes_without_peer() {
        let registry = SessionRegistry::new(10);
        let now = Instant::now();
        let mut session = opened(&registry, now);

        assert!(session.on_tick(now + Duration::from_millis(999)).is_empty());
        let deadline = session.next_deadline().unwrap();
        assert_eq!(deadline, now + Duration::from_secs(1));

        let replies = session.on_tick(deadline);
        assert_eq!(session.state(), SessionState::Closing);
        assert_eq!(
            replies,
            vec![ControlMessage::new(1, ControlBody::Close { reason: Some(CloseReason::Timeout) })]
        );

        let grace = session.next_deadline().unwrap();
        assert_eq!(grace, deadline + Duration::from_millis(200));
        session.on_tick(grace);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::Timeout));
        assert!(session.next_deadline().is_none());
    }

    #[test]
    fn test_closing_completes_on_peer_closed() {
        let registry = SessionRegistry::new(10);
        let now = Instant::now();
        let mut session = opened(&registry, now);

        session.request_close(CloseReason::Shutdown, now);
        assert_eq!(session.state(), SessionState::Closing);

        // In-flight audio still counts while contiguous
        session.on_frame(&audio(1, 30), now, &registry);
        session.on_frame(&audio(5, 30), now, &registry);
        session.on_frame(&text(2, ControlBody::Ping { nonce: String::new() }), now, &registry);
        assert_eq!(session.state(), SessionState::Closing);
        assert_eq!(session.position(), 30);

        session.on_frame(&text(2, ControlBody::Closed { reason: None }), now, &registry);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::Shutdown));
    }

    #[test]
    fn test_bad_frames_while_closing_are_ignored() {
        let registry = SessionRegistry::new(10);
        let now = Instant::now();
        let mut session = opened(&registry, now);
        session.request_close(CloseReason::Shutdown, now);

        assert!(session.on_frame(&RawFrame::text("{garbage"), now, &registry).is_empty());
        assert!(session.on_frame(&RawFrame::binary(vec![1u8, 2]), now, &registry).is_empty());
        assert!(session.on_rejected("message exceeds frame size", now).is_empty());
        assert_eq!(session.state(), SessionState::Closing);
        assert_eq!(session.close_reason(), Some(CloseReason::Shutdown));
        assert_eq!(session.error_code(), None);

        session.on_frame(&text(1, ControlBody::Closed { reason: None }), now, &registry);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::Shutdown));
    }

    #[test]
    fn test_small_frame_size_still_closes() {
        let registry = SessionRegistry::new(10);
        let now = Instant::now();
        let mut session = ServerSession::new(config(), now);
        let open = ControlBody::Open { session_id: None, media: vec![], max_frame_size: Some(16) };
        session.on_frame(&text(0, open), now, &registry);
        assert_eq!(session.state(), SessionState::Open);

        session.on_frame(&audio(1, 16), now, &registry);
        let replies = session.on_frame(&text(2, ControlBody::Close { reason: Some(CloseReason::End) }), now, &registry);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(replies[0].body, ControlBody::Closed { .. }));
        assert_eq!(session.position(), 16);

        let mut session = ServerSession::new(config(), now);
        let open = ControlBody::Open { session_id: None, media: vec![], max_frame_size: Some(16) };
        session.on_frame(&text(0, open), now, &registry);
        let replies = session.on_frame(&audio(1, 17), now, &registry);
        assert!(matches!(replies[0].body, ControlBody::Error { code: ErrorCode::MalformedFrame, .. }));
    }

    #[test]
    fn test_crossing_close_is_answered() {
        let registry = SessionRegistry::new(10);
        let now = Instant::now();
        let mut session = opened(&registry, now);

        session.request_close(CloseReason::Shutdown, now);
        let replies = session.on_frame(&text(1, ControlBody::Close { reason: None }), now, &registry);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(replies[0].body, ControlBody::Closed { .. }));
        assert_eq!(replies[0].seq, 2);
    }

    #[test]
    fn test_awaiting_open_timeout_errors() {
        let registry = SessionRegistry::new(10);
        let now = Instant::now();
        let mut session = ServerSession::new(config(), now);
        let replies = session.on_tick(now + Duration::from_secs(1));
        assert_eq!(session.state(), SessionState::Errored);
        assert!(matches!(replies[0].body, ControlBody::Error { code: ErrorCode::Timeout, .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_malformed_frame_is_fatal() {
        let registry = SessionRegistry::new(10);
        let now = Instant::now();
        let mut session = opened(&registry, now);
        let replies = session.on_frame(&RawFrame::text("{not json"), now, &registry);
        assert_eq!(session.state(), SessionState::Errored);
        assert!(matches!(replies[0].body, ControlBody::Error { code: ErrorCode::MalformedFrame, .. }));
    }

    #[test]
    fn test_transport_loss() {
        let registry = SessionRegistry::new(10);
        let now = Instant::now();
        let mut session = opened(&registry, now);
        session.on_transport_lost("reset by peer", now);
        assert_eq!(session.state(), SessionState::Errored);
        assert_eq!(session.error_code(), Some(ErrorCode::TransportFailure));
        assert_eq!(session.close_reason(), Some(CloseReason::Disconnect));
    }

    #[test]
    fn test_send_failure_while_closing_errors() {
        let registry = SessionRegistry::new(10);
        let now = Instant::now();
        let mut session = opened(&registry, now);
        session.request_close(CloseReason::Shutdown, now);
        session.on_send_failed(&ProtocolError::TransportFailure("queue full".into()), now);
        assert_eq!(session.state(), SessionState::Errored);
        assert_eq!(session.error_code(), Some(ErrorCode::TransportFailure));
        assert_eq!(session.close_reason(), Some(CloseReason::Shutdown));
    }
}
