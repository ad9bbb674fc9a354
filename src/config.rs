//! Configuration management
//!
//! Loads the daemon/satellite configuration from a TOML file in the platform
//! config directory, with serde-level defaults for every field so a missing
//! or partial file always produces a usable configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Daemon-side settings
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// LLM provider settings
    #[serde(default)]
    pub llm: LlmConfig,
    /// Satellite-side settings
    #[serde(default)]
    pub satellite: SatelliteConfig,
    /// Music/audio pipeline settings
    #[serde(default)]
    pub audio: AudioConfig,
    /// Voice capture and wake-word settings
    #[serde(default)]
    pub voice: VoiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind host for the WebSocket endpoint
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Idle seconds before a disconnected session is reaped
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    /// Number of pipeline worker tasks
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Response queue capacity (oldest entry dropped when full)
    #[serde(default = "default_queue_capacity")]
    pub response_queue_capacity: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3737
}

fn default_max_sessions() -> usize {
    8
}

fn default_session_timeout() -> u64 {
    1800
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_sessions: default_max_sessions(),
            session_timeout_secs: default_session_timeout(),
            worker_pool_size: default_worker_pool_size(),
            response_queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions endpoint
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Model identifier sent with every request
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Per-call hard ceiling in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Maximum tokens per completion
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_llm_base_url() -> String {
    "http://127.0.0.1:11434/v1".to_string()
}

fn default_api_key_env() -> String {
    "DAWN_LLM_API_KEY".to_string()
}

fn default_llm_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_llm_timeout() -> u64 {
    30
}

fn default_max_tokens() -> u32 {
    1024
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key_env: default_api_key_env(),
            model: default_llm_model(),
            timeout_secs: default_llm_timeout(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl LlmConfig {
    /// Resolve the API key from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SatelliteConfig {
    /// Daemon WebSocket URL
    #[serde(default = "default_daemon_url")]
    pub daemon_url: String,
    /// Human-readable device name
    #[serde(default = "default_satellite_name")]
    pub name: String,
    /// Physical location label
    #[serde(default)]
    pub location: String,
    /// Satellite tier (1 = runs its own ASR/TTS)
    #[serde(default = "default_tier")]
    pub tier: u8,
    /// Keep-alive ping interval in seconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Abort a response after this many seconds with no data
    #[serde(default = "default_no_data_stall")]
    pub no_data_stall_secs: u64,
    /// Abort a response after this many seconds total
    #[serde(default = "default_total_stall")]
    pub total_stall_secs: u64,
    /// Connect-and-register deadline in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_daemon_url() -> String {
    "ws://127.0.0.1:3737/ws".to_string()
}

fn default_satellite_name() -> String {
    "satellite".to_string()
}

fn default_tier() -> u8 {
    1
}

fn default_ping_interval() -> u64 {
    10
}

fn default_no_data_stall() -> u64 {
    30
}

fn default_total_stall() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    5
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            daemon_url: default_daemon_url(),
            name: default_satellite_name(),
            location: String::new(),
            tier: default_tier(),
            ping_interval_secs: default_ping_interval(),
            no_data_stall_secs: default_no_data_stall(),
            total_stall_secs: default_total_stall(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Ring buffer capacity in samples; must be a power of two
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    /// Buffered milliseconds required before playback starts
    #[serde(default = "default_prebuffer_ms")]
    pub prebuffer_ms: u64,
    /// Playback volume, 0-100
    #[serde(default = "default_volume")]
    pub volume: u8,
    /// Music path sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Samples delivered to the sink per period
    #[serde(default = "default_period_frames")]
    pub period_frames: usize,
}

fn default_ring_capacity() -> usize {
    262_144
}

fn default_prebuffer_ms() -> u64 {
    500
}

fn default_volume() -> u8 {
    100
}

fn default_sample_rate() -> u32 {
    48_000
}

fn default_period_frames() -> usize {
    1024
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            ring_capacity: default_ring_capacity(),
            prebuffer_ms: default_prebuffer_ms(),
            volume: default_volume(),
            sample_rate: default_sample_rate(),
            period_frames: default_period_frames(),
        }
    }
}

/// ASR invocation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsrMode {
    /// Feed the whole utterance at end of speech
    Batch,
    /// Feed frames as they are captured
    Streaming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Assistant name used to compose wake phrases
    #[serde(default = "default_ai_name")]
    pub ai_name: String,
    /// Per-frame speech probability threshold
    #[serde(default = "default_speech_threshold")]
    pub speech_threshold: f32,
    /// Consecutive speech frames required to enter listening
    #[serde(default = "default_speech_start_frames")]
    pub speech_start_frames: u32,
    /// Trailing silence that ends an utterance, in milliseconds
    #[serde(default = "default_silence_end_ms")]
    pub silence_end_ms: u64,
    /// VAD frame duration in milliseconds
    #[serde(default = "default_vad_frame_ms")]
    pub vad_frame_ms: u64,
    /// Hard cap on a single recording, in seconds
    #[serde(default = "default_max_audio_seconds")]
    pub max_audio_seconds: u64,
    /// Pre-roll kept ahead of speech onset, in milliseconds
    #[serde(default = "default_pre_roll_ms")]
    pub pre_roll_ms: u64,
    /// Voice path sample rate (model rate)
    #[serde(default = "default_voice_sample_rate")]
    pub sample_rate: u32,
    /// Batch or streaming recognition
    #[serde(default = "default_asr_mode")]
    pub asr_mode: AsrMode,
    /// Dump each captured utterance to a WAV file for debugging
    #[serde(default)]
    pub save_audio: bool,
}

fn default_ai_name() -> String {
    "friday".to_string()
}

fn default_speech_threshold() -> f32 {
    0.5
}

fn default_speech_start_frames() -> u32 {
    3
}

fn default_silence_end_ms() -> u64 {
    800
}

fn default_vad_frame_ms() -> u64 {
    32
}

fn default_max_audio_seconds() -> u64 {
    30
}

fn default_pre_roll_ms() -> u64 {
    500
}

fn default_voice_sample_rate() -> u32 {
    16_000
}

fn default_asr_mode() -> AsrMode {
    AsrMode::Batch
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            ai_name: default_ai_name(),
            speech_threshold: default_speech_threshold(),
            speech_start_frames: default_speech_start_frames(),
            silence_end_ms: default_silence_end_ms(),
            vad_frame_ms: default_vad_frame_ms(),
            max_audio_seconds: default_max_audio_seconds(),
            pre_roll_ms: default_pre_roll_ms(),
            sample_rate: default_voice_sample_rate(),
            asr_mode: default_asr_mode(),
            save_audio: false,
        }
    }
}

impl VoiceConfig {
    /// Silence cutoff expressed in whole VAD frames
    pub fn silence_end_frames(&self) -> u32 {
        (self.silence_end_ms / self.vad_frame_ms.max(1)).max(1) as u32
    }

    /// Samples per VAD frame at the voice sample rate
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as u64 * self.vad_frame_ms / 1000) as usize
    }
}

impl Config {
    /// Load configuration from file, creating a default file if absent
    pub fn load() -> Result<Self> {
        let config_path = config_path()?;

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .context("Failed to read config file")?;
            let config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&contents)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = config_path()?;
        let parent = config_path.parent().context("Config path has no parent")?;

        std::fs::create_dir_all(parent).context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents).context("Failed to write config file")?;

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !self.audio.ring_capacity.is_power_of_two() {
            anyhow::bail!(
                "audio.ring_capacity must be a power of two, got {}",
                self.audio.ring_capacity
            );
        }
        if self.audio.volume > 100 {
            anyhow::bail!("audio.volume must be 0-100, got {}", self.audio.volume);
        }
        if !(0.0..=1.0).contains(&self.voice.speech_threshold) {
            anyhow::bail!(
                "voice.speech_threshold must be in 0.0-1.0, got {}",
                self.voice.speech_threshold
            );
        }
        Ok(())
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("io", "dawn", "dawn")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Get the data directory path (reconnect secret, debug captures)
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("io", "dawn", "dawn")
        .context("Failed to get project directories")?;
    Ok(base.data_dir().to_path_buf())
}

/// Print the resolved configuration as TOML
pub fn show_config() -> Result<()> {
    let config = Config::load()?;
    let contents = toml::to_string_pretty(&config).context("Failed to serialize config")?;
    println!("# {}", config_path()?.display());
    println!("{contents}");
    Ok(())
}
