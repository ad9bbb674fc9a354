//! Satellite runtime
//!
//! A satellite connects out to the daemon, registers itself with its
//! capabilities, and then runs two pipelines concurrently: the voice loop
//! (microphone → VAD → wake word → ASR → `satellite_query`) and the music
//! path (binary frames → decoder pump → ring → playback). Streamed response
//! text is split into sentences and synthesized locally while the daemon is
//! still generating.

pub mod client;

use std::path::PathBuf;

use anyhow::{Context, Result};

pub use client::SatelliteService;

/// Where the daemon-issued reconnect secret is persisted. The secret is the
/// satellite's only durable credential; tokens are session-scoped and never
/// hit disk.
pub fn secret_path() -> Result<PathBuf> {
    Ok(crate::config::data_dir()?.join("satellite_secret"))
}

pub fn load_secret() -> Option<String> {
    let path = secret_path().ok()?;
    let contents = std::fs::read_to_string(path).ok()?;
    let secret = contents.trim().to_string();
    if secret.len() == 64 && secret.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(secret)
    } else {
        None
    }
}

pub fn store_secret(secret: &str) -> Result<()> {
    let path = secret_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create data directory")?;
    }
    std::fs::write(&path, secret).context("Failed to persist reconnect secret")?;
    Ok(())
}
