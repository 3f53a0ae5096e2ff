//! # Frame Codec
//!
//! Translates between websocket payloads and the two in-memory message shapes:
//!
//! - **Text frames** carry a JSON [`ControlMessage`].
//! - **Binary frames** carry an [`AudioFrame`]:
//!
//! ```text
//! +----------------+---------------------------------+
//! | seq (8, BE u64)| payload (0..=max_payload bytes) |
//! +----------------+---------------------------------+
//! ```
//!
//! All size and shape validation happens here, so the session state machine
//! only ever sees well-formed frames. Decoding slices the shared buffer instead
//! of copying the audio payload.

use crate::audiohook::message::ControlMessage;
use crate::config::MAX_PAYLOAD_LIMIT;
use crate::error::ProtocolError;
use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the sequence header in front of every audio payload.
pub const AUDIO_HEADER_LEN: usize = 8;

/// Websocket opcode of a data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Text,
    Binary,
}

/// A data frame as the transport delivers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl RawFrame {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            opcode: Opcode::Text,
            payload: Bytes::from(text.into()),
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::Binary,
            payload: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }
}

/// A slice of streamed media, opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub seq: u64,
    pub payload: Bytes,
}

impl AudioFrame {
    pub fn new(seq: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            seq,
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ControlMessage),
    Audio(AudioFrame),
}

impl From<ControlMessage> for Frame {
    fn from(msg: ControlMessage) -> Self {
        Frame::Control(msg)
    }
}

impl From<AudioFrame> for Frame {
    fn from(audio: AudioFrame) -> Self {
        Frame::Audio(audio)
    }
}

/// Stateless apart from the audio payload limit, which shrinks to the
/// negotiated value once a session is open. Control messages are always
/// bounded by [`MAX_PAYLOAD_LIMIT`] so a small `maxFrameSize` never blocks
/// `close`, `closed` or `error`.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    /// Largest websocket message this codec will ever accept.
    pub fn max_wire_frame(&self) -> usize {
        self.max_payload + AUDIO_HEADER_LEN
    }

    pub fn decode(&self, raw: &RawFrame) -> Result<Frame, ProtocolError> {
        match raw.opcode {
            Opcode::Text => self.decode_control(&raw.payload).map(Frame::Control),
            Opcode::Binary => self.decode_audio(&raw.payload).map(Frame::Audio),
        }
    }

    fn decode_control(&self, data: &Bytes) -> Result<ControlMessage, ProtocolError> {
        if data.len() > MAX_PAYLOAD_LIMIT {
            return Err(ProtocolError::MalformedFrame(format!(
                "control message of {} bytes exceeds limit of {}",
                data.len(),
                MAX_PAYLOAD_LIMIT
            )));
        }
        Ok(serde_json::from_slice(data)?)
    }

    fn decode_audio(&self, data: &Bytes) -> Result<AudioFrame, ProtocolError> {
        if data.len() < AUDIO_HEADER_LEN {
            return Err(ProtocolError::MalformedFrame(format!(
                "binary frame of {} bytes is shorter than the {}-byte header",
                data.len(),
                AUDIO_HEADER_LEN
            )));
        }

        let payload_len = data.len() - AUDIO_HEADER_LEN;
        if payload_len > self.max_payload {
            return Err(ProtocolError::MalformedFrame(format!(
                "audio payload of {} bytes exceeds limit of {}",
                payload_len, self.max_payload
            )));
        }

        let seq = (&data[..AUDIO_HEADER_LEN])
            .read_u64::<BigEndian>()
            .map_err(|e| ProtocolError::MalformedFrame(format!("unreadable audio header: {}", e)))?;

        Ok(AudioFrame {
            seq,
            payload: data.slice(AUDIO_HEADER_LEN..),
        })
    }

    pub fn encode(&self, frame: &Frame) -> Result<RawFrame, ProtocolError> {
        match frame {
            Frame::Control(msg) => self.encode_control(msg),
            Frame::Audio(audio) => self.encode_audio(audio),
        }
    }

    pub fn encode_control(&self, msg: &ControlMessage) -> Result<RawFrame, ProtocolError> {
        let text = serde_json::to_string(msg)?;
        Ok(RawFrame::text(text))
    }

    pub fn encode_audio(&self, audio: &AudioFrame) -> Result<RawFrame, ProtocolError> {
        if audio.len() > self.max_payload {
            return Err(ProtocolError::MalformedFrame(format!(
                "audio payload of {} bytes exceeds limit of {}",
                audio.len(),
                self.max_payload
            )));
        }

        let mut buf = BytesMut::with_capacity(AUDIO_HEADER_LEN + audio.len());
        buf.put_u64(audio.seq);
        buf.put_slice(&audio.payload);
        Ok(RawFrame::binary(buf.freeze()))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audiohook::message::{AudioEncoding, CloseReason, ControlBody, MediaFormat};
    use crate::error::ErrorCode;

    fn roundtrip(frame: Frame) {
        let codec = FrameCodec::default();
        let raw = codec.encode(&frame).unwrap();
        assert_eq!(codec.decode(&raw).unwrap(), frame);
    }

    #[test]
    fn test_roundtrip_every_control_type() {
        let media = MediaFormat::new(AudioEncoding::Pcmu, 8000, 1);
        let bodies = vec![
            ControlBody::Open { session_id: Some("s".into()), media: vec![media], max_frame_size: Some(1024) },
            ControlBody::Open { session_id: None, media: vec![], max_frame_size: None },
            ControlBody::Opened { session_id: "s".into(), max_frame_size: 65536, media },
            ControlBody::Ping { nonce: "n".into() },
            ControlBody::Pong { nonce: "n".into() },
            ControlBody::Pause,
            ControlBody::Resume,
            ControlBody::Close { reason: Some(CloseReason::Timeout) },
            ControlBody::Closed { reason: None },
            ControlBody::Error { code: ErrorCode::SequenceError, message: "gap".into() },
        ];
        for (seq, body) in bodies.into_iter().enumerate() {
            roundtrip(Frame::Control(ControlMessage::new(seq as u64, body)));
        }
    }

    #[test]
    fn test_roundtrip_audio() {
        roundtrip(Frame::Audio(AudioFrame::new(3, vec![1u8, 2, 3, 4])));
        roundtrip(Frame::Audio(AudioFrame::new(u64::MAX, Vec::<u8>::new())));
        roundtrip(Frame::Audio(AudioFrame::new(1, vec![0u8; 65536])));
    }

    #[test]
    fn test_audio_header_is_big_endian() {
        let raw = FrameCodec::default()
            .encode_audio(&AudioFrame::new(0x0102, vec![9u8]))
            .unwrap();
        assert_eq!(&raw.payload[..], &[0, 0, 0, 0, 0, 0, 1, 2, 9]);
    }

    #[test]
    fn test_oversized_audio_rejected() {
        let codec = FrameCodec::default();
        let mut data = vec![0u8; AUDIO_HEADER_LEN];
        data.extend(vec![0u8; 65537]);
        let err = codec.decode(&RawFrame::binary(data)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedFrame);
    }

    #[test]
    fn test_negotiated_limit_applies() {
        let mut codec = FrameCodec::default();
        codec.set_max_payload(100);
        let ok = codec.encode_audio(&AudioFrame::new(1, vec![0u8; 100])).unwrap();
        assert!(codec.decode(&ok).is_ok());
        assert!(codec.encode_audio(&AudioFrame::new(1, vec![0u8; 101])).is_err());
    }

    #[test]
    fn test_control_messages_ignore_negotiated_limit() {
        let mut codec = FrameCodec::default();
        codec.set_max_payload(16);
        let close = codec
            .encode_control(&ControlMessage::new(1, ControlBody::Close { reason: Some(CloseReason::End) }))
            .unwrap();
        assert!(close.len() > 16);
        assert!(matches!(codec.decode(&close).unwrap(), Frame::Control(_)));

        let huge = format!(r#"{{"seq":1,"type":"ping","nonce":"{}"}}"#, "x".repeat(MAX_PAYLOAD_LIMIT));
        let err = codec.decode(&RawFrame::text(huge)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedFrame);
    }

    #[test]
    fn test_short_binary_rejected() {
        let err = FrameCodec::default()
            .decode(&RawFrame::binary(vec![1u8, 2, 3]))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedFrame);
    }

    #[test]
    fn test_malformed_control_messages() {
        let codec = FrameCodec::default();
        for text in [
            "not json",
            r#"{"seq":1}"#,
            r#"{"type":"ping"}"#,
            r#"{"type":"teleport","seq":1}"#,
            r#"{"type":"opened","seq":0}"#,
        ] {
            let err = codec.decode(&RawFrame::text(text)).unwrap_err();
            assert_eq!(err.code(), ErrorCode::MalformedFrame, "accepted {}", text);
        }
    }
}
