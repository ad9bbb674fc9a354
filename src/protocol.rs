//! Wire protocol between daemon and clients
//!
//! Text frames are UTF-8 JSON of the form `{ "type": ..., "payload": ... }`.
//! Binary frames start with one octet identifying the payload type and one
//! octet of flags reserved for future use, followed by the raw payload.

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, ErrorCode};
use crate::types::{Role, SatelliteCapabilities};

/// Messages sent client → daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Plain text query from the WebUI
    Text { text: String },
    /// Abort the in-flight response for this session
    Cancel,
    /// Re-attach to a prior session by token
    Reconnect { token: String },
    /// Runtime settings pushed by the client
    Config {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        volume: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    /// First message from a satellite after connecting
    SatelliteRegister {
        uuid: String,
        name: String,
        location: String,
        tier: u8,
        capabilities: SatelliteCapabilities,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reconnect_secret: Option<String>,
    },
    /// Recognised command text from a satellite with local ASR
    SatelliteQuery { text: String },
    /// Application-level keep-alive
    SatellitePing,
}

/// Messages sent daemon → client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reconnect token carrier, sent on accept and on reconnect
    Session { token: String },
    /// Interaction state update
    State {
        state: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// One conversation turn, also used for history replay
    Transcript { role: Role, text: String },
    StreamStart {
        stream_id: u32,
    },
    StreamDelta {
        stream_id: u32,
        delta: String,
    },
    StreamEnd {
        stream_id: u32,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recoverable: Option<bool>,
    },
    SatelliteRegisterAck {
        success: bool,
        session_id: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reconnect_secret: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    SatellitePong,
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerMessage {
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One-octet binary frame discriminators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BinaryKind {
    /// Client → daemon compressed audio chunk
    AudioIn = 0x01,
    /// Client → daemon end-of-utterance marker
    EndOfUtterance = 0x02,
    /// Daemon → client audio chunk
    AudioOut = 0x11,
    /// Daemon → client end-of-response-audio marker
    EndOfAudio = 0x12,
}

impl BinaryKind {
    pub fn from_byte(byte: u8) -> Result<Self, CodecError> {
        match byte {
            0x01 => Ok(BinaryKind::AudioIn),
            0x02 => Ok(BinaryKind::EndOfUtterance),
            0x11 => Ok(BinaryKind::AudioOut),
            0x12 => Ok(BinaryKind::EndOfAudio),
            other => Err(CodecError::UnknownBinaryType(other)),
        }
    }
}

/// A decoded binary frame: discriminator, flags octet, payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFrame {
    pub kind: BinaryKind,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl BinaryFrame {
    pub fn new(kind: BinaryKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            flags: 0,
            payload,
        }
    }

    /// Parse a binary wire frame. Requires at least the two header octets.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < 2 {
            return Err(CodecError::Truncated(bytes.len()));
        }
        let kind = BinaryKind::from_byte(bytes[0])?;
        Ok(Self {
            kind,
            flags: bytes[1],
            payload: bytes[2..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.payload.len());
        out.push(self.kind as u8);
        out.push(self.flags);
        out.extend_from_slice(&self.payload);
        out
    }
}
