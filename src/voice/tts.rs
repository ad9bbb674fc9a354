//! Speech-synthesis engine seam
//!
//! Sentence-sized text in, mono i16 PCM out. The bundled implementation
//! posts to an HTTP synthesis endpoint (piper-server style) that returns a
//! WAV body. Playback goes through the shared audio pipeline, not through
//! the engine.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::voice::asr::decode_wav;

#[async_trait]
pub trait TtsEngine: Send {
    /// Synthesize one sentence to mono PCM at `sample_rate()`
    async fn synthesize(&mut self, text: &str) -> Result<Vec<i16>>;

    /// Output rate of synthesized audio
    fn sample_rate(&self) -> u32;
}

/// HTTP synthesis engine configuration
#[derive(Debug, Clone)]
pub struct HttpTtsConfig {
    /// Endpoint accepting `{"text": ...}` and returning a WAV body
    pub url: String,
    /// Expected output sample rate
    pub sample_rate: u32,
    /// Request deadline
    pub timeout: Duration,
    /// Voice identifier passed through to the engine
    pub voice: Option<String>,
}

impl Default for HttpTtsConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:5000/synthesize".to_string(),
            sample_rate: 22_050,
            timeout: Duration::from_secs(20),
            voice: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonAudioResponse {
    /// Base64-encoded WAV
    audio: String,
}

pub struct HttpTts {
    config: HttpTtsConfig,
    client: reqwest::Client,
}

impl HttpTts {
    pub fn new(config: HttpTtsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }
}

#[async_trait]
impl TtsEngine for HttpTts {
    async fn synthesize(&mut self, text: &str) -> Result<Vec<i16>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut body = json!({ "text": text });
        if let Some(voice) = &self.config.voice {
            body["voice"] = json!(voice);
        }

        let response = self
            .client
            .post(&self.config.url)
            .json(&body)
            .send()
            .await
            .context("Failed to reach synthesis endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            bail!("Synthesis endpoint error ({status}): {detail}");
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response
            .bytes()
            .await
            .context("Failed to read synthesis response")?;
        // Engines answer either with a raw WAV body or with JSON carrying
        // the WAV base64-encoded.
        let wav = if content_type.starts_with("application/json") {
            let parsed: JsonAudioResponse =
                serde_json::from_slice(&body).context("Failed to parse synthesis JSON")?;
            BASE64
                .decode(parsed.audio)
                .context("Failed to decode base64 audio")?
        } else {
            body.to_vec()
        };
        let (samples, rate) = decode_wav(&wav).context("Failed to decode synthesized WAV")?;
        debug!(
            chars = text.len(),
            samples = samples.len(),
            rate,
            "sentence synthesized"
        );
        Ok(samples)
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }
}
