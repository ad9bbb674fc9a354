//! Hardware audio I/O via cpal
//!
//! Device-facing implementations of the sink/source seams. Everything here
//! is behind the `hardware` feature; the rest of the pipeline is exercised
//! in tests through `NullSink` and in-memory sources.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, info, warn};

use crate::audio::player::AudioSink;

/// Maximum samples queued ahead of the device before `write` blocks
const SINK_HIGH_WATER: usize = 48_000;

/// Output device sink with an internal staging queue drained by the cpal
/// callback. `write` blocks while the queue is above the high-water mark,
/// which is what serialises the playback consumer to real-time cadence.
pub struct CpalSink {
    channels: u16,
    sample_rate: u32,
    queue: Arc<(Mutex<VecDeque<i16>>, Condvar)>,
    stream: Option<cpal::Stream>,
}

impl CpalSink {
    pub fn new(channels: u16, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
            queue: Arc::new((Mutex::new(VecDeque::new()), Condvar::new())),
            stream: None,
        }
    }

    fn build_stream(&mut self) -> Result<()> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .context("No output device available")?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Using output device: {device_name}");

        let config = cpal::StreamConfig {
            channels: self.channels,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let supported = device
            .default_output_config()
            .context("Failed to get default output config")?;

        let queue = Arc::clone(&self.queue);
        let err_fn = |e| warn!("output stream error: {e}");

        let stream = match supported.sample_format() {
            cpal::SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _| {
                    let (lock, cond) = &*queue;
                    let mut buf = lock.lock().unwrap();
                    for slot in data.iter_mut() {
                        *slot = buf.pop_front().unwrap_or(0);
                    }
                    cond.notify_all();
                },
                err_fn,
                None,
            )?,
            cpal::SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _| {
                    let (lock, cond) = &*queue;
                    let mut buf = lock.lock().unwrap();
                    for slot in data.iter_mut() {
                        *slot = buf.pop_front().unwrap_or(0) as f32 / 32768.0;
                    }
                    cond.notify_all();
                },
                err_fn,
                None,
            )?,
            other => bail!("Unsupported output sample format: {other:?}"),
        };

        stream.play().context("Failed to start output stream")?;
        self.stream = Some(stream);
        Ok(())
    }
}

impl AudioSink for CpalSink {
    fn prepare(&mut self) -> Result<()> {
        if self.stream.is_none() {
            self.build_stream()?;
        } else if let Some(stream) = &self.stream {
            stream.play().context("Failed to resume output stream")?;
        }
        Ok(())
    }

    fn write(&mut self, samples: &[i16]) -> Result<()> {
        if self.stream.is_none() {
            self.build_stream()?;
        }
        let (lock, cond) = &*self.queue;
        let mut buf = lock.lock().unwrap();
        buf.extend(samples.iter().copied());
        while buf.len() > SINK_HIGH_WATER {
            let (guard, result) = cond
                .wait_timeout(buf, Duration::from_millis(250))
                .unwrap();
            buf = guard;
            if result.timed_out() {
                debug!("output queue drain stalled ({} samples)", buf.len());
                break;
            }
        }
        Ok(())
    }

    fn delay_frames(&self) -> usize {
        let (lock, _) = &*self.queue;
        lock.lock().unwrap().len() / self.channels as usize
    }
}

/// Microphone capture seam: blocking reads of mono i16 frames at the
/// requested model rate.
pub trait AudioSource {
    /// Fill `out` with captured samples, blocking until available.
    /// Returns false once the source has closed.
    fn read_frame(&mut self, out: &mut [i16]) -> Result<bool>;
}

/// Streaming linear-interpolation resampler used to bring the device rate
/// down to the model rate.
struct LinearResampler {
    ratio: f64,
    pos: f64,
    prev: f32,
}

impl LinearResampler {
    fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            ratio: from_rate as f64 / to_rate as f64,
            pos: 0.0,
            prev: 0.0,
        }
    }

    fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if input.is_empty() {
            return;
        }
        // Positions are tracked relative to a virtual stream where `prev`
        // sits at index -1 and `input` begins at 0.
        while self.pos < input.len() as f64 {
            let idx = self.pos.floor();
            let frac = (self.pos - idx) as f32;
            let i = idx as isize;
            let a = if i < 0 { self.prev } else { input[i as usize] };
            let b_idx = i + 1;
            let b = if b_idx < 0 {
                self.prev
            } else if (b_idx as usize) < input.len() {
                input[b_idx as usize]
            } else {
                break;
            };
            out.push(a * (1.0 - frac) + b * frac);
            self.pos += self.ratio;
        }
        self.pos -= input.len() as f64;
        self.prev = *input.last().unwrap();
    }
}

/// Default-input-device capture downmixed to mono and resampled to the
/// model rate.
pub struct CpalSource {
    target_rate: u32,
    device_rate: u32,
    device_channels: u16,
    captured: Arc<(Mutex<VecDeque<f32>>, Condvar)>,
    resampler: LinearResampler,
    resampled: VecDeque<f32>,
    _stream: cpal::Stream,
}

impl CpalSource {
    pub fn new(target_rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .context("No input device available (microphone not found)")?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Using input device: {device_name}");

        let supported = device
            .default_input_config()
            .context("Failed to get default input config")?;
        let device_rate = supported.sample_rate().0;
        let device_channels = supported.channels();
        let config: cpal::StreamConfig = supported.config();

        let captured: Arc<(Mutex<VecDeque<f32>>, Condvar)> =
            Arc::new((Mutex::new(VecDeque::new()), Condvar::new()));
        let cb_captured = Arc::clone(&captured);
        let channels = device_channels as usize;
        let err_fn = |e| warn!("input stream error: {e}");

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &_| {
                    let (lock, cond) = &*cb_captured;
                    let mut buf = lock.lock().unwrap();
                    // Downmix interleaved channels to mono
                    for frame in data.chunks(channels) {
                        let sum: f32 = frame.iter().sum();
                        buf.push_back(sum / channels as f32);
                    }
                    cond.notify_all();
                },
                err_fn,
                None,
            )?,
            cpal::SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &_| {
                    let (lock, cond) = &*cb_captured;
                    let mut buf = lock.lock().unwrap();
                    for frame in data.chunks(channels) {
                        let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                        buf.push_back(sum as f32 / (channels as f32 * 32768.0));
                    }
                    cond.notify_all();
                },
                err_fn,
                None,
            )?,
            other => bail!("Unsupported input sample format: {other:?}"),
        };

        stream.play().context("Failed to start input stream")?;
        info!("Capture running at {device_rate} Hz, resampling to {target_rate} Hz");

        Ok(Self {
            target_rate,
            device_rate,
            device_channels,
            captured,
            resampler: LinearResampler::new(device_rate, target_rate),
            resampled: VecDeque::new(),
            _stream: stream,
        })
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    pub fn device_channels(&self) -> u16 {
        self.device_channels
    }
}

impl AudioSource for CpalSource {
    fn read_frame(&mut self, out: &mut [i16]) -> Result<bool> {
        while self.resampled.len() < out.len() {
            // Pull whatever the callback has accumulated
            let chunk: Vec<f32> = {
                let (lock, cond) = &*self.captured;
                let mut buf = lock.lock().unwrap();
                while buf.is_empty() {
                    let (guard, _) = cond
                        .wait_timeout(buf, Duration::from_millis(250))
                        .unwrap();
                    buf = guard;
                }
                buf.drain(..).collect()
            };
            if self.device_rate == self.target_rate {
                self.resampled.extend(chunk.iter().copied());
            } else {
                let mut resampled = Vec::with_capacity(chunk.len());
                self.resampler.process(&chunk, &mut resampled);
                self.resampled.extend(resampled);
            }
        }
        for slot in out.iter_mut() {
            let s = self.resampled.pop_front().unwrap_or(0.0);
            *slot = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resampler_identity_ratio() {
        let mut rs = LinearResampler::new(1000, 1000);
        let mut out = Vec::new();
        rs.process(&[0.0, 0.25, 0.5, 0.75], &mut out);
        assert_eq!(out.len(), 4);
        assert!((out[1] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_resampler_downsample_halves() {
        let mut rs = LinearResampler::new(2000, 1000);
        let input: Vec<f32> = (0..100).map(|i| i as f32 / 100.0).collect();
        let mut out = Vec::new();
        rs.process(&input, &mut out);
        // 2:1 ratio keeps roughly half the samples
        assert!((out.len() as i64 - 50).abs() <= 1, "got {}", out.len());
    }

    #[test]
    fn test_resampler_streaming_continuity() {
        // Feeding one buffer or two halves should give near-identical output
        let input: Vec<f32> = (0..64).map(|i| (i as f32 * 0.3).sin()).collect();

        let mut whole = Vec::new();
        LinearResampler::new(48_000, 16_000).process(&input, &mut whole);

        let mut split = Vec::new();
        let mut rs = LinearResampler::new(48_000, 16_000);
        rs.process(&input[..32], &mut split);
        rs.process(&input[32..], &mut split);

        assert_eq!(whole.len(), split.len());
        for (a, b) in whole.iter().zip(split.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }
}
