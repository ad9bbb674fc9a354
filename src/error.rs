//! Error taxonomy shared between the daemon and its clients
//!
//! Wire-level errors carry a short opaque code plus a human-readable message;
//! clients decide presentation. Internal component errors use `thiserror`
//! types at the API seams and `anyhow` at application boundaries.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Short opaque error codes carried in `error` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AsrFailed,
    LlmTimeout,
    LlmError,
    TtsFailed,
    SessionLimit,
    InvalidMessage,
    NotRegistered,
    RateLimited,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AsrFailed => "ASR_FAILED",
            ErrorCode::LlmTimeout => "LLM_TIMEOUT",
            ErrorCode::LlmError => "LLM_ERROR",
            ErrorCode::TtsFailed => "TTS_FAILED",
            ErrorCode::SessionLimit => "SESSION_LIMIT",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::NotRegistered => "NOT_REGISTERED",
            ErrorCode::RateLimited => "RATE_LIMITED",
        }
    }

    /// Whether the client should expect the session to remain usable
    pub fn recoverable(&self) -> bool {
        !matches!(self, ErrorCode::SessionLimit)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the decoder pump
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PumpError {
    /// The ring did not free enough space within the bounded wait.
    /// The caller should drop the frame and continue.
    #[error("ring buffer full after bounded wait")]
    RingFull,
    #[error("audio decode failed: {0}")]
    Decode(String),
    #[error("pump is shutting down")]
    Shutdown,
}

/// Errors surfaced by the protocol codec
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary frame too short ({0} bytes)")]
    Truncated(usize),
    #[error("unknown binary frame type 0x{0:02x}")]
    UnknownBinaryType(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_format() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::LlmTimeout).unwrap(),
            "\"LLM_TIMEOUT\""
        );
        let code: ErrorCode = serde_json::from_str("\"SESSION_LIMIT\"").unwrap();
        assert_eq!(code, ErrorCode::SessionLimit);
    }

    #[test]
    fn test_recoverable() {
        assert!(!ErrorCode::SessionLimit.recoverable());
        assert!(ErrorCode::LlmTimeout.recoverable());
        assert!(ErrorCode::AsrFailed.recoverable());
    }

    #[test]
    fn test_display_matches_serde() {
        for code in [
            ErrorCode::AsrFailed,
            ErrorCode::LlmTimeout,
            ErrorCode::LlmError,
            ErrorCode::TtsFailed,
            ErrorCode::SessionLimit,
            ErrorCode::InvalidMessage,
            ErrorCode::NotRegistered,
            ErrorCode::RateLimited,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{code}\""));
        }
    }
}
