//! Decoder pump: compressed frames in, ring samples out
//!
//! Runs on the network reader side of an audio stream. Each inbound frame is
//! decoded and pushed into the SPSC ring. While playback is paused the frame
//! is discarded outright so the network reader never stalls behind a ring
//! that is not draining. When the ring is full the pump waits a bounded
//! 100 ms for space before reporting a transient error so the caller can
//! drop the frame.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::audio::decode::{DecodeError, Decoder};
use crate::audio::player::{PlaybackState, PlayerShared};
use crate::error::PumpError;

/// Bounded wait for ring space before a frame is dropped
pub const SPACE_WAIT: Duration = Duration::from_millis(100);

pub struct DecoderPump<D: Decoder> {
    decoder: D,
    shared: Arc<PlayerShared>,
    scratch: Vec<i16>,
}

impl<D: Decoder> DecoderPump<D> {
    pub fn new(decoder: D, shared: Arc<PlayerShared>) -> Self {
        Self {
            decoder,
            shared,
            scratch: Vec::new(),
        }
    }

    /// Decode one compressed frame and push the samples into the ring.
    ///
    /// Returns the number of samples written. Zero means the frame was
    /// consumed without producing audible output: playback is paused, the
    /// decoder produced nothing, or its state had to be reset.
    pub fn push_frame(&mut self, frame: &[u8]) -> Result<usize, PumpError> {
        if self.shared.is_shutdown() {
            return Err(PumpError::Shutdown);
        }
        if self.shared.take_decoder_reset() {
            self.decoder.reset();
        }

        self.scratch.clear();
        let produced = match self.decoder.decode(frame, &mut self.scratch) {
            Ok(n) => n,
            Err(DecodeError::Corrupt(msg)) => {
                warn!("decoder state corrupt, resetting: {msg}");
                self.decoder.reset();
                return Ok(0);
            }
            Err(DecodeError::Malformed(msg)) => {
                debug!("dropping malformed audio frame: {msg}");
                return Err(PumpError::Decode(msg));
            }
        };
        if produced == 0 {
            return Ok(0);
        }

        // Paused: the ring is not draining, so waiting for space would only
        // stall the reader. Discard silently.
        if self.shared.state() == PlaybackState::Paused {
            return Ok(0);
        }

        // Fast path
        if self.shared.ring.free() >= produced {
            self.shared.ring.write(&self.scratch);
            self.shared.note_data_arrival();
            return Ok(produced);
        }

        // Slow path: bounded wait for the consumer to drain
        if self.shared.wait_for_space(produced, SPACE_WAIT) {
            self.shared.ring.write(&self.scratch);
            self.shared.note_data_arrival();
            return Ok(produced);
        }

        if self.shared.is_shutdown() {
            return Err(PumpError::Shutdown);
        }
        Err(PumpError::RingFull)
    }

    /// Reset decoder state, e.g. after a stream flush
    pub fn reset(&mut self) {
        self.decoder.reset();
    }
}
