//! Speech-recognition engine seam
//!
//! The voice state machine drives recognition through this trait. Batch
//! engines receive the whole utterance at finalisation; streaming engines
//! are fed frame-by-frame as audio is captured and ignore the batch buffer.
//! The bundled implementation talks to an HTTP transcription endpoint
//! (whisper-server style): WAV in, JSON `{"text": ...}` out.

use std::io::Cursor;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::config::AsrMode;

#[async_trait]
pub trait AsrEngine: Send {
    /// Batch or streaming invocation
    fn mode(&self) -> AsrMode;

    /// Streaming engines consume frames as captured; batch engines ignore
    /// this call.
    async fn feed_frame(&mut self, samples: &[i16]) -> Result<()>;

    /// Produce the transcript. Batch engines receive the complete utterance
    /// here; streaming engines have already seen it via `feed_frame`.
    async fn finalize(&mut self, utterance: &[i16]) -> Result<String>;

    /// Drop any partial recognition state
    fn reset(&mut self);
}

/// HTTP transcription engine configuration
#[derive(Debug, Clone)]
pub struct HttpAsrConfig {
    /// Endpoint accepting a WAV body and returning `{"text": ...}`
    pub url: String,
    /// Utterance sample rate
    pub sample_rate: u32,
    /// Request deadline
    pub timeout: Duration,
}

impl Default for HttpAsrConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080/inference".to_string(),
            sample_rate: 16_000,
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Batch engine posting mono WAV to an HTTP endpoint
pub struct HttpAsr {
    config: HttpAsrConfig,
    client: reqwest::Client,
}

impl HttpAsr {
    pub fn new(config: HttpAsrConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }
}

#[async_trait]
impl AsrEngine for HttpAsr {
    fn mode(&self) -> AsrMode {
        AsrMode::Batch
    }

    async fn feed_frame(&mut self, _samples: &[i16]) -> Result<()> {
        Ok(())
    }

    async fn finalize(&mut self, utterance: &[i16]) -> Result<String> {
        if utterance.is_empty() {
            return Ok(String::new());
        }
        let wav = encode_wav(utterance, self.config.sample_rate)
            .context("Failed to encode utterance as WAV")?;
        debug!(
            bytes = wav.len(),
            samples = utterance.len(),
            "posting utterance for transcription"
        );

        let response = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "audio/wav")
            .body(wav)
            .send()
            .await
            .context("Failed to reach transcription endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Transcription endpoint error ({status}): {body}");
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .context("Failed to parse transcription response")?;
        Ok(parsed.text.trim().to_string())
    }

    fn reset(&mut self) {}
}

/// Encode mono i16 PCM as an in-memory WAV file
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .context("Failed to create WAV writer")?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize().context("Failed to finalize WAV")?;
    }
    Ok(cursor.into_inner())
}

/// Decode a WAV byte stream into mono i16 PCM, averaging channels
pub fn decode_wav(bytes: &[u8]) -> Result<(Vec<i16>, u32)> {
    let mut reader =
        hound::WavReader::new(Cursor::new(bytes)).context("Failed to parse WAV")?;
    let spec = reader.spec();
    let channels = spec.channels as usize;

    let interleaved: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Int => reader
            .samples::<i16>()
            .collect::<std::result::Result<_, _>>()
            .context("Failed to read WAV samples")?,
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|f| (f.clamp(-1.0, 1.0) * 32767.0) as i16))
            .collect::<std::result::Result<_, _>>()
            .context("Failed to read WAV samples")?,
    };

    if channels <= 1 {
        return Ok((interleaved, spec.sample_rate));
    }
    let mono = interleaved
        .chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect();
    Ok((mono, spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_roundtrip() {
        let samples: Vec<i16> = (0..1000).map(|i| (i % 256) as i16).collect();
        let wav = encode_wav(&samples, 16_000).unwrap();
        let (decoded, rate) = decode_wav(&wav).unwrap();
        assert_eq!(rate, 16_000);
        assert_eq!(decoded, samples);
    }

    #[test]
    fn test_decode_stereo_downmix() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..10 {
                writer.write_sample(100i16).unwrap();
                writer.write_sample(300i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        let (mono, rate) = decode_wav(&cursor.into_inner()).unwrap();
        assert_eq!(rate, 48_000);
        assert_eq!(mono.len(), 10);
        assert!(mono.iter().all(|&s| s == 200));
    }

    #[tokio::test]
    async fn test_http_asr_empty_utterance_short_circuits() {
        let mut asr = HttpAsr::new(HttpAsrConfig::default());
        let text = asr.finalize(&[]).await.unwrap();
        assert!(text.is_empty());
    }
}
