//! Satellite voice pipeline
//!
//! Microphone frames flow through VAD into the state machine, which drives
//! wake-word matching and speech recognition and emits queries; streaming
//! response text flows through the sentence pipeliner into synthesis.

pub mod asr;
pub mod sentence;
pub mod state;
pub mod tts;
pub mod vad;
pub mod wakeword;

pub use asr::{AsrEngine, HttpAsr, HttpAsrConfig};
pub use sentence::SentencePipeliner;
pub use state::{VoiceAction, VoiceMachine, VoiceState};
pub use tts::{HttpTts, HttpTtsConfig, TtsEngine};
pub use vad::{EnergyVad, EnergyVadConfig, VadEngine};
pub use wakeword::{WakeMatch, WakeWordMatcher};
