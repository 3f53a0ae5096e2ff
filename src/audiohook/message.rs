//! # AudioHook Control Messages
//!
//! JSON control messages exchanged on text frames. Every message carries a
//! `type` discriminator and the sender's `seq`:
//!
//! ```json
//! {"type":"open","seq":0,"media":[{"format":"PCMU","rate":8000,"channels":1}]}
//! {"type":"opened","seq":0,"sessionId":"5f0c…","maxFrameSize":65536,"media":{"format":"PCMU","rate":8000,"channels":1}}
//! {"type":"ping","seq":4,"nonce":"n-1"}
//! {"type":"close","seq":4,"reason":"end"}
//! {"type":"error","seq":2,"code":"sequence_error","message":"expected seq 2, got 3"}
//! ```

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};

/// Audio encodings the protocol can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioEncoding {
    /// G.711 µ-law, one byte per sample
    #[serde(rename = "PCMU")]
    Pcmu,
    /// 16-bit linear PCM
    #[serde(rename = "L16")]
    L16,
}

impl AudioEncoding {
    pub fn bytes_per_sample(&self) -> u64 {
        match self {
            AudioEncoding::Pcmu => 1,
            AudioEncoding::L16 => 2,
        }
    }
}

/// One media format offer or selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaFormat {
    pub format: AudioEncoding,
    pub rate: u32,
    pub channels: u8,
}

impl MediaFormat {
    pub fn new(format: AudioEncoding, rate: u32, channels: u8) -> Self {
        Self { format, rate, channels }
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.format.bytes_per_sample() * self.rate as u64 * self.channels as u64
    }

    /// Milliseconds of audio represented by `bytes` in this format.
    pub fn duration_ms(&self, bytes: u64) -> u64 {
        match self.bytes_per_second() {
            0 => 0,
            bps => bytes * 1000 / bps,
        }
    }
}

/// Why a session ended. Set once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Peer asked to close
    End,
    /// Inactivity window elapsed
    Timeout,
    /// Server is draining
    Shutdown,
    /// Protocol error on either side
    Error,
    /// Connection dropped without a handshake
    Disconnect,
}

/// A control message: the sender's sequence number plus a typed body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub seq: u64,
    #[serde(flatten)]
    pub body: ControlBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlBody {
    #[serde(rename_all = "camelCase")]
    Open {
        /// Client-proposed identifier; the server assigns one when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Offered media formats in client preference order
        #[serde(default)]
        media: Vec<MediaFormat>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_frame_size: Option<usize>,
    },

    #[serde(rename_all = "camelCase")]
    Opened {
        session_id: String,
        max_frame_size: usize,
        media: MediaFormat,
    },

    Ping {
        #[serde(default)]
        nonce: String,
    },

    Pong {
        #[serde(default)]
        nonce: String,
    },

    Pause,

    Resume,

    Close {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<CloseReason>,
    },

    Closed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<CloseReason>,
    },

    Error {
        code: ErrorCode,
        #[serde(default)]
        message: String,
    },
}

impl ControlMessage {
    pub fn new(seq: u64, body: ControlBody) -> Self {
        Self { seq, body }
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }
}

impl ControlBody {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlBody::Open { .. } => "open",
            ControlBody::Opened { .. } => "opened",
            ControlBody::Ping { .. } => "ping",
            ControlBody::Pong { .. } => "pong",
            ControlBody::Pause => "pause",
            ControlBody::Resume => "resume",
            ControlBody::Close { .. } => "close",
            ControlBody::Closed { .. } => "closed",
            ControlBody::Error { .. } => "error",
        }
    }
}
