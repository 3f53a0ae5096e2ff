//! # Client-Role Session
//!
//! The media-gateway side of the protocol, used by the load generator. It mirrors
//! [`ServerSession`](crate::audiohook::session::ServerSession): it builds the
//! frames a well-behaved client sends and validates what the server answers,
//! including the server's sequence numbers.

use crate::audiohook::codec::{AudioFrame, Frame, FrameCodec, RawFrame};
use crate::audiohook::message::{CloseReason, ControlBody, ControlMessage, MediaFormat};
use crate::audiohook::session::SessionState;
use crate::error::{ErrorCode, ProtocolError};
use bytes::Bytes;

/// What a server message meant for the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Opened {
        session_id: String,
        max_frame_size: usize,
        media: MediaFormat,
    },
    Pong {
        nonce: String,
    },
    /// The server started a close; answer with [`ClientSession::closed`]
    CloseRequested {
        reason: Option<CloseReason>,
    },
    Closed {
        reason: Option<CloseReason>,
    },
    /// The server reported an error and ended the session
    Failed {
        code: ErrorCode,
        message: String,
    },
    /// Valid but irrelevant in the current state
    Ignored,
}

#[derive(Debug)]
pub struct ClientSession {
    codec: FrameCodec,
    state: SessionState,
    next_seq: u64,
    expected_server_seq: u64,
    session_id: Option<String>,
    media: Option<MediaFormat>,
}

impl ClientSession {
    pub fn new(max_payload: usize) -> Self {
        Self {
            codec: FrameCodec::new(max_payload),
            state: SessionState::AwaitingOpen,
            next_seq: 0,
            expected_server_seq: 0,
            session_id: None,
            media: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn media(&self) -> Option<MediaFormat> {
        self.media
    }

    pub fn max_frame_size(&self) -> usize {
        self.codec.max_payload()
    }

    pub fn open(
        &mut self,
        session_id: Option<String>,
        media: Vec<MediaFormat>,
        max_frame_size: Option<usize>,
    ) -> Result<RawFrame, ProtocolError> {
        if self.state != SessionState::AwaitingOpen || self.next_seq != 0 {
            return Err(ProtocolError::ProtocolViolation("open already sent".to_string()));
        }
        self.counted(ControlBody::Open { session_id, media, max_frame_size })
    }

    pub fn audio(&mut self, payload: Bytes) -> Result<RawFrame, ProtocolError> {
        self.require(SessionState::Open, "audio")?;
        let frame = self.codec.encode_audio(&AudioFrame::new(self.next_seq, payload))?;
        self.next_seq += 1;
        Ok(frame)
    }

    pub fn pause(&mut self) -> Result<RawFrame, ProtocolError> {
        self.require(SessionState::Open, "pause")?;
        self.uncounted(ControlBody::Pause)
    }

    pub fn resume(&mut self) -> Result<RawFrame, ProtocolError> {
        self.require(SessionState::Open, "resume")?;
        self.uncounted(ControlBody::Resume)
    }

    pub fn ping(&mut self, nonce: impl Into<String>) -> Result<RawFrame, ProtocolError> {
        self.require(SessionState::Open, "ping")?;
        self.uncounted(ControlBody::Ping { nonce: nonce.into() })
    }

    /// Client-initiated close; the session waits for the server's `closed`.
    pub fn close(&mut self, reason: CloseReason) -> Result<RawFrame, ProtocolError> {
        self.require(SessionState::Open, "close")?;
        let frame = self.counted(ControlBody::Close { reason: Some(reason) })?;
        self.state = SessionState::Closing;
        Ok(frame)
    }

    /// Answer a server-initiated close.
    pub fn closed(&mut self) -> Result<RawFrame, ProtocolError> {
        self.require(SessionState::Closing, "closed")?;
        let frame = self.counted(ControlBody::Closed { reason: None })?;
        self.state = SessionState::Closed;
        Ok(frame)
    }

    /// Validate and apply one server frame.
    pub fn on_frame(&mut self, raw: &RawFrame) -> Result<ClientEvent, ProtocolError> {
        let result = self.apply(raw);
        if result.is_err() {
            self.state = SessionState::Errored;
        }
        result
    }

    fn apply(&mut self, raw: &RawFrame) -> Result<ClientEvent, ProtocolError> {
        if self.state.is_terminal() {
            return Ok(ClientEvent::Ignored);
        }

        let msg = match self.codec.decode(raw)? {
            Frame::Control(msg) => msg,
            Frame::Audio(_) => {
                return Err(ProtocolError::ProtocolViolation("server sent audio".to_string()))
            }
        };

        if msg.seq != self.expected_server_seq {
            return Err(ProtocolError::SequenceError {
                expected: self.expected_server_seq,
                actual: msg.seq,
            });
        }
        self.expected_server_seq += 1;

        if let ControlBody::Error { code, message } = msg.body {
            self.state = SessionState::Errored;
            return Ok(ClientEvent::Failed { code, message });
        }

        match (self.state, msg.body) {
            (SessionState::AwaitingOpen, ControlBody::Opened { session_id, max_frame_size, media }) => {
                if self.next_seq != 1 {
                    return Err(ProtocolError::ProtocolViolation("opened before open".to_string()));
                }
                self.codec.set_max_payload(max_frame_size.min(self.codec.max_payload()));
                self.session_id = Some(session_id.clone());
                self.media = Some(media);
                self.state = SessionState::Open;
                Ok(ClientEvent::Opened { session_id, max_frame_size, media })
            }
            (SessionState::Open | SessionState::Closing, ControlBody::Pong { nonce }) => {
                Ok(ClientEvent::Pong { nonce })
            }
            (SessionState::Open, ControlBody::Close { reason }) => {
                self.state = SessionState::Closing;
                Ok(ClientEvent::CloseRequested { reason })
            }
            // Crossing close: the server answers ours with `closed` next
            (SessionState::Closing, ControlBody::Close { .. }) => Ok(ClientEvent::Ignored),
            (SessionState::Closing, ControlBody::Closed { reason }) => {
                self.state = SessionState::Closed;
                Ok(ClientEvent::Closed { reason })
            }
            (state, body) => Err(ProtocolError::ProtocolViolation(format!(
                "unexpected {} in state {}",
                body.kind(),
                state.as_str()
            ))),
        }
    }

    fn require(&self, state: SessionState, what: &str) -> Result<(), ProtocolError> {
        if self.state != state {
            return Err(ProtocolError::ProtocolViolation(format!(
                "cannot send {} in state {}",
                what,
                self.state.as_str()
            )));
        }
        Ok(())
    }

    fn counted(&mut self, body: ControlBody) -> Result<RawFrame, ProtocolError> {
        let frame = self.codec.encode_control(&ControlMessage::new(self.next_seq, body))?;
        self.next_seq += 1;
        Ok(frame)
    }

    fn uncounted(&mut self, body: ControlBody) -> Result<RawFrame, ProtocolError> {
        self.codec.encode_control(&ControlMessage::new(self.next_seq, body))
    }
}
