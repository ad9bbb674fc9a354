//! Voice Activity Detection
//!
//! Energy-based detector with an adaptive noise floor. Each fixed-size
//! frame yields a speech probability in 0.0-1.0; the voice state machine
//! applies its own thresholds and consecutive-frame counting on top.

use anyhow::{bail, Result};
use tracing::trace;

/// Default energy threshold (dB above the noise floor) at which the
/// reported probability crosses 0.5
pub const DEFAULT_THRESHOLD_DB: f32 = 12.0;

/// Noise floor adaptation rate per non-speech frame
pub const DEFAULT_ADAPTATION_RATE: f32 = 0.05;

/// Per-frame speech probability source
pub trait VadEngine: Send {
    /// Probability that `frame` contains speech
    fn speech_probability(&mut self, frame: &[i16]) -> Result<f32>;

    /// Forget adaptation state
    fn reset(&mut self);
}

/// VAD configuration
#[derive(Debug, Clone, Copy)]
pub struct EnergyVadConfig {
    /// Samples per frame
    pub frame_size: usize,
    /// dB above the noise floor mapped to probability 0.5
    pub threshold_db: f32,
    /// Enable adaptive noise floor
    pub adaptive_noise_floor: bool,
    /// Noise floor adaptation rate (0.0-1.0)
    pub adaptation_rate: f32,
}

impl Default for EnergyVadConfig {
    fn default() -> Self {
        Self {
            frame_size: 512,
            threshold_db: DEFAULT_THRESHOLD_DB,
            adaptive_noise_floor: true,
            adaptation_rate: DEFAULT_ADAPTATION_RATE,
        }
    }
}

/// Adaptive energy detector
pub struct EnergyVad {
    config: EnergyVadConfig,
    noise_floor: f32,
    frame_count: u64,
}

impl EnergyVad {
    pub fn new(config: EnergyVadConfig) -> Self {
        Self {
            config,
            noise_floor: 1e-6,
            frame_count: 0,
        }
    }

    /// Current noise floor in dB full scale
    pub fn noise_floor_db(&self) -> f32 {
        10.0 * self.noise_floor.log10().max(-100.0)
    }
}

impl VadEngine for EnergyVad {
    fn speech_probability(&mut self, frame: &[i16]) -> Result<f32> {
        if frame.len() != self.config.frame_size {
            bail!(
                "Expected {} samples, got {}",
                self.config.frame_size,
                frame.len()
            );
        }

        let energy = rms_energy(frame);
        let threshold =
            self.noise_floor * 10f32.powf(self.config.threshold_db / 10.0);

        if self.config.adaptive_noise_floor && energy < threshold {
            // Likely noise, pull the floor toward it
            self.noise_floor = self.noise_floor * (1.0 - self.config.adaptation_rate)
                + energy * self.config.adaptation_rate;
        }

        // Energy at the threshold maps to 0.5; far above saturates toward 1
        let ratio = energy / threshold.max(1e-9);
        let probability = ratio / (ratio + 1.0);

        self.frame_count += 1;
        trace!(
            frame = self.frame_count,
            energy,
            threshold,
            probability,
            "vad frame"
        );
        Ok(probability)
    }

    fn reset(&mut self) {
        self.noise_floor = 1e-6;
        self.frame_count = 0;
    }
}

/// RMS energy of a frame, normalised to 0.0-1.0 full scale
fn rms_energy(frame: &[i16]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = frame
        .iter()
        .map(|&s| {
            let f = s as f64 / 32768.0;
            f * f
        })
        .sum();
    ((sum_sq / frame.len() as f64) as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_energy() {
        assert_eq!(rms_energy(&[0; 512]), 0.0);
        let half = vec![16384i16; 512];
        let energy = rms_energy(&half);
        assert!((energy - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_frame_size_enforced() {
        let mut vad = EnergyVad::new(EnergyVadConfig::default());
        assert!(vad.speech_probability(&[0; 100]).is_err());
    }

    #[test]
    fn test_silence_scores_low_after_adaptation() {
        let mut vad = EnergyVad::new(EnergyVadConfig::default());
        let quiet = vec![30i16; 512];
        let mut last = 1.0;
        for _ in 0..50 {
            last = vad.speech_probability(&quiet).unwrap();
        }
        assert!(last < 0.5, "steady quiet input should adapt below 0.5, got {last}");
    }

    #[test]
    fn test_loud_signal_scores_high() {
        let mut vad = EnergyVad::new(EnergyVadConfig::default());
        let quiet = vec![10i16; 512];
        for _ in 0..30 {
            let _ = vad.speech_probability(&quiet).unwrap();
        }
        let loud = vec![16000i16; 512];
        let p = vad.speech_probability(&loud).unwrap();
        assert!(p > 0.9, "loud input over a quiet floor should be near 1, got {p}");
    }

    #[test]
    fn test_reset_restores_floor() {
        let mut vad = EnergyVad::new(EnergyVadConfig::default());
        let loudish = vec![3000i16; 512];
        for _ in 0..100 {
            let _ = vad.speech_probability(&loudish).unwrap();
        }
        let floor_adapted = vad.noise_floor_db();
        vad.reset();
        assert!(vad.noise_floor_db() < floor_adapted);
    }
}
