//! Compressed-audio decoder seam
//!
//! The decoder pump is generic over this trait; the daemon ships raw PCM16
//! frames today, so the default implementation is a pass-through, but the
//! pump's contract (state reset on corruption, frame-at-a-time decode) is
//! written against the trait.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed audio frame: {0}")]
    Malformed(String),
    /// Decoder internal state is corrupt; caller should reset and continue.
    #[error("decoder state corrupt: {0}")]
    Corrupt(String),
}

/// One-frame-at-a-time audio decoder
pub trait Decoder: Send {
    /// Decode one compressed frame, appending interleaved i16 samples to
    /// `out`. Returns the number of samples produced.
    fn decode(&mut self, frame: &[u8], out: &mut Vec<i16>) -> Result<usize, DecodeError>;

    /// Discard internal state after corruption or a stream flush
    fn reset(&mut self);

    /// Output channel count
    fn channels(&self) -> u16;

    /// Output sample rate in Hz
    fn sample_rate(&self) -> u32;
}

/// Pass-through decoder for frames that already carry little-endian PCM16
pub struct Pcm16Decoder {
    channels: u16,
    sample_rate: u32,
}

impl Pcm16Decoder {
    pub fn new(channels: u16, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }

    /// Stereo 48 kHz, the music path format
    pub fn music() -> Self {
        Self::new(2, 48_000)
    }
}

impl Decoder for Pcm16Decoder {
    fn decode(&mut self, frame: &[u8], out: &mut Vec<i16>) -> Result<usize, DecodeError> {
        if frame.len() % 2 != 0 {
            return Err(DecodeError::Malformed(format!(
                "odd byte count {}",
                frame.len()
            )));
        }
        let produced = frame.len() / 2;
        out.reserve(produced);
        for pair in frame.chunks_exact(2) {
            out.push(i16::from_le_bytes([pair[0], pair[1]]));
        }
        Ok(produced)
    }

    fn reset(&mut self) {}

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
