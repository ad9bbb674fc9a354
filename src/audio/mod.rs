//! Music-streaming audio pipeline
//!
//! Compressed frames arrive from the network, are decoded by the pump into
//! a lock-free SPSC ring, and drained to the audio sink by a dedicated
//! real-time consumer thread:
//!
//! ```text
//! network frame → DecoderPump → SpscRing → playback consumer → AudioSink
//! ```

pub mod decode;
#[cfg(feature = "hardware")]
pub mod hw;
pub mod player;
pub mod pump;
pub mod ring;

pub use decode::{DecodeError, Decoder, Pcm16Decoder};
pub use player::{AudioSink, NullSink, PlaybackState, Player, PlayerShared};
pub use pump::DecoderPump;
pub use ring::SpscRing;
