//! Shared types used across the daemon and satellite runtimes

use serde::{Deserialize, Serialize};

/// Role of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn of conversation history, append-only within a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

impl HistoryEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// What kind of endpoint a session represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    /// The daemon host's own microphone path
    LocalMic,
    /// A browser WebUI client
    Websocket,
    /// A remote satellite device
    Satellite,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionKind::LocalMic => "local-mic",
            SessionKind::Websocket => "websocket",
            SessionKind::Satellite => "satellite",
        };
        f.write_str(s)
    }
}

/// Client-visible interaction state, reported in `state` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Idle,
    Listening,
    Processing,
    Responding,
    Speaking,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Idle => "idle",
            ClientState::Listening => "listening",
            ClientState::Processing => "processing",
            ClientState::Responding => "responding",
            ClientState::Speaking => "speaking",
        }
    }
}

/// Capabilities a satellite announces at registration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatelliteCapabilities {
    /// Satellite runs its own speech recognition
    #[serde(default)]
    pub local_asr: bool,
    /// Satellite runs its own speech synthesis
    #[serde(default)]
    pub local_tts: bool,
    /// Satellite performs wake-word detection
    #[serde(default)]
    pub wake_word: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(serde_json::to_string(&Role::Tool).unwrap(), "\"tool\"");
        let role: Role = serde_json::from_str("\"assistant\"").unwrap();
        assert_eq!(role, Role::Assistant);
    }

    #[test]
    fn test_session_kind_display() {
        assert_eq!(SessionKind::LocalMic.to_string(), "local-mic");
        assert_eq!(SessionKind::Satellite.to_string(), "satellite");
    }

    #[test]
    fn test_capabilities_default_deserialization() {
        let caps: SatelliteCapabilities = serde_json::from_str("{}").unwrap();
        assert!(!caps.local_asr);
        assert!(!caps.local_tts);
        assert!(!caps.wake_word);

        let caps: SatelliteCapabilities =
            serde_json::from_str(r#"{"local_asr": true, "wake_word": true}"#).unwrap();
        assert!(caps.local_asr);
        assert!(!caps.local_tts);
        assert!(caps.wake_word);
    }
}
