//! Satellite voice state machine
//!
//! Drives the full-duplex interaction lifecycle from microphone frames:
//!
//! ```text
//! silence → wakeword-listen → processing ┬→ waiting (wake + command)
//!                                        ├→ command-recording (wake only)
//!                                        └→ silence (no wake)
//! command-recording → processing ┬→ waiting (command text)
//!                                └→ silence (empty)
//! waiting → silence (response complete)
//! ```
//!
//! A rolling pre-roll buffer continually overwrites during `silence` and is
//! prepended to the recording on speech onset so the wake-phrase head is
//! never clipped. The pre-roll is cleared after every hand-off; a second
//! speech event always starts from fresh pre-roll.

use std::collections::VecDeque;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::{AsrMode, VoiceConfig};
use crate::voice::asr::AsrEngine;
use crate::voice::vad::VadEngine;
use crate::voice::wakeword::{WakeMatch, WakeWordMatcher};

/// Interaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Silence,
    WakewordListen,
    CommandRecording,
    Processing,
    Waiting,
    Speaking,
}

/// Side effects the caller must perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceAction {
    /// Send a `satellite_query` with this text
    SendQuery(String),
}

/// Fixed-duration rolling audio buffer
struct PreRoll {
    buf: VecDeque<i16>,
    capacity: usize,
}

impl PreRoll {
    fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, samples: &[i16]) {
        for &s in samples {
            if self.buf.len() == self.capacity {
                self.buf.pop_front();
            }
            self.buf.push_back(s);
        }
    }

    /// Take the whole pre-roll, leaving it empty
    fn take(&mut self) -> Vec<i16> {
        self.buf.drain(..).collect()
    }
}

pub struct VoiceMachine<V: VadEngine, A: AsrEngine> {
    config: VoiceConfig,
    vad: V,
    asr: A,
    matcher: WakeWordMatcher,
    state: VoiceState,
    preroll: PreRoll,
    recording: Vec<i16>,
    /// Consecutive speech frames observed in silence
    speech_run: u32,
    /// Consecutive silent frames observed while recording
    silence_run: u32,
    max_recording_samples: usize,
}

impl<V: VadEngine, A: AsrEngine> VoiceMachine<V, A> {
    pub fn new(config: VoiceConfig, vad: V, asr: A) -> Self {
        let preroll_samples =
            (config.sample_rate as u64 * config.pre_roll_ms / 1000) as usize;
        let max_recording_samples =
            (config.sample_rate as u64 * config.max_audio_seconds) as usize;
        let matcher = WakeWordMatcher::new(&config.ai_name);
        Self {
            config,
            vad,
            asr,
            matcher,
            state: VoiceState::Silence,
            preroll: PreRoll::new(preroll_samples.max(1)),
            recording: Vec::new(),
            speech_run: 0,
            silence_run: 0,
            max_recording_samples,
        }
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    /// Feed one VAD-sized frame of mono model-rate audio
    pub async fn process_frame(&mut self, frame: &[i16]) -> Result<Vec<VoiceAction>> {
        let probability = match self.vad.speech_probability(frame) {
            Ok(p) => p,
            Err(e) => {
                warn!("VAD failure, treating frame as silence: {e}");
                0.0
            }
        };
        let is_speech = probability >= self.config.speech_threshold;

        match self.state {
            VoiceState::Silence => {
                self.preroll.push(frame);
                if is_speech {
                    self.speech_run += 1;
                    if self.speech_run >= self.config.speech_start_frames {
                        self.begin_recording(VoiceState::WakewordListen).await?;
                    }
                } else {
                    self.speech_run = 0;
                }
                Ok(Vec::new())
            }
            VoiceState::WakewordListen => {
                self.append_recording(frame).await?;
                if self.utterance_finished(is_speech) {
                    return self.process_wake_utterance().await;
                }
                Ok(Vec::new())
            }
            VoiceState::CommandRecording => {
                self.append_recording(frame).await?;
                if self.utterance_finished(is_speech) {
                    return self.process_command_utterance().await;
                }
                Ok(Vec::new())
            }
            // Frames during a pending or spoken response keep the pre-roll
            // warm but trigger nothing (barge-in reserved).
            VoiceState::Processing | VoiceState::Waiting | VoiceState::Speaking => {
                self.preroll.push(frame);
                Ok(Vec::new())
            }
        }
    }

    /// The streaming response finished; return to silence
    pub fn response_complete(&mut self) {
        if matches!(self.state, VoiceState::Waiting | VoiceState::Speaking) {
            self.enter_silence("response complete");
        }
    }

    /// Local TTS playback of the response started
    pub fn begin_speaking(&mut self) {
        if self.state == VoiceState::Waiting {
            self.state = VoiceState::Speaking;
        }
    }

    /// Network loss while waiting; caller surfaces the offline greeting
    pub fn connection_lost(&mut self) {
        if self.state != VoiceState::Silence {
            self.enter_silence("connection lost");
        }
    }

    async fn begin_recording(&mut self, next: VoiceState) -> Result<()> {
        // Pre-roll first so the phrase onset is never clipped
        self.recording = self.preroll.take();
        self.silence_run = 0;
        self.speech_run = 0;
        self.state = next;
        info!(state = ?next, preroll = self.recording.len(), "speech onset");

        if self.config.asr_mode == AsrMode::Streaming && !self.recording.is_empty() {
            let preroll = std::mem::take(&mut self.recording);
            self.asr.feed_frame(&preroll).await?;
            self.recording = preroll;
        }
        Ok(())
    }

    async fn append_recording(&mut self, frame: &[i16]) -> Result<()> {
        self.recording.extend_from_slice(frame);
        if self.config.asr_mode == AsrMode::Streaming {
            self.asr.feed_frame(frame).await?;
        }
        Ok(())
    }

    /// Silence-run and length-cap bookkeeping shared by both recording
    /// states. Trailing silence alone ends an utterance, so a wake-only
    /// user who never speaks a command still reaches finalisation.
    fn utterance_finished(&mut self, is_speech: bool) -> bool {
        if is_speech {
            self.silence_run = 0;
        } else {
            self.silence_run += 1;
        }
        if self.recording.len() >= self.max_recording_samples {
            debug!("recording hit {}s cap", self.config.max_audio_seconds);
            return true;
        }
        self.silence_run >= self.config.silence_end_frames()
    }

    async fn process_wake_utterance(&mut self) -> Result<Vec<VoiceAction>> {
        self.state = VoiceState::Processing;
        let utterance = std::mem::take(&mut self.recording);
        self.maybe_dump(&utterance);

        let transcript = match self.asr.finalize(&utterance).await {
            Ok(text) => text,
            Err(e) => {
                warn!("ASR failed, returning to silence: {e}");
                self.enter_silence("asr failure");
                return Ok(Vec::new());
            }
        };
        debug!(transcript, "wake utterance transcribed");

        match self.matcher.match_transcript(&transcript) {
            WakeMatch::WakeWithCommand(command) => {
                info!(command, "wake phrase with command");
                self.state = VoiceState::Waiting;
                self.reset_capture();
                Ok(vec![VoiceAction::SendQuery(command)])
            }
            WakeMatch::WakeOnly => {
                info!("wake phrase only, recording command");
                self.state = VoiceState::CommandRecording;
                self.reset_capture();
                Ok(Vec::new())
            }
            WakeMatch::None => {
                debug!("no wake phrase in transcript");
                self.enter_silence("no wake phrase");
                Ok(Vec::new())
            }
        }
    }

    async fn process_command_utterance(&mut self) -> Result<Vec<VoiceAction>> {
        self.state = VoiceState::Processing;
        let utterance = std::mem::take(&mut self.recording);
        self.maybe_dump(&utterance);

        let transcript = match self.asr.finalize(&utterance).await {
            Ok(text) => text,
            Err(e) => {
                warn!("ASR failed, returning to silence: {e}");
                self.enter_silence("asr failure");
                return Ok(Vec::new());
            }
        };
        debug!(transcript, "command utterance transcribed");

        if transcript.trim().is_empty() {
            self.enter_silence("empty command");
            return Ok(Vec::new());
        }
        self.state = VoiceState::Waiting;
        self.reset_capture();
        Ok(vec![VoiceAction::SendQuery(transcript.trim().to_string())])
    }

    fn enter_silence(&mut self, reason: &str) {
        debug!(reason, "voice machine returning to silence");
        self.state = VoiceState::Silence;
        self.reset_capture();
    }

    fn reset_capture(&mut self) {
        self.recording.clear();
        self.speech_run = 0;
        self.silence_run = 0;
        self.asr.reset();
    }

    fn maybe_dump(&self, utterance: &[i16]) {
        if !self.config.save_audio || utterance.is_empty() {
            return;
        }
        if let Err(e) = dump_wav(utterance, self.config.sample_rate) {
            warn!("failed to save utterance capture: {e}");
        }
    }
}

/// Write a debug capture of the utterance to the data directory
fn dump_wav(samples: &[i16], sample_rate: u32) -> Result<()> {
    let dir = crate::config::data_dir()?.join("captures");
    std::fs::create_dir_all(&dir)?;
    let name = format!("utterance-{}.wav", chrono::Utc::now().format("%Y%m%d-%H%M%S%.3f"));
    let path = dir.join(name);
    let bytes = crate::voice::asr::encode_wav(samples, sample_rate)?;
    std::fs::write(&path, bytes)?;
    debug!(path = %path.display(), "utterance capture saved");
    Ok(())
}
