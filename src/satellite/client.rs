//! Satellite client service
//!
//! Owns the WebSocket link to the daemon. Every outbound frame goes through
//! one writer task, which also gives the keep-alive its skip rule: a ping
//! tick is dropped whenever a payload is already pending so there is at
//! most one in-flight outbound payload at a time. Disconnects trigger an
//! exponential back-off with jitter, capped at 30 seconds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::audio::{DecoderPump, Pcm16Decoder, Player, PlayerShared};
use crate::config::Config;
use crate::error::PumpError;
use crate::protocol::{BinaryFrame, BinaryKind, ClientMessage, ServerMessage};
use crate::types::SatelliteCapabilities;
use crate::voice::asr::{HttpAsr, HttpAsrConfig};
use crate::voice::sentence::SentencePipeliner;
use crate::voice::state::{VoiceAction, VoiceMachine, VoiceState};
use crate::voice::tts::{HttpTts, HttpTtsConfig, TtsEngine};
use crate::voice::vad::{EnergyVad, EnergyVadConfig};

/// Reconnect back-off ceiling
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Ring behind the local TTS voice path (mono samples)
const VOICE_RING_CAPACITY: usize = 65_536;

/// Spoken when the daemon cannot be reached mid-interaction
const OFFLINE_GREETING: &str = "I can't reach the assistant service right now.";

/// Sentences handed to the synthesis task
enum TtsJob {
    Sentence(String),
    EndOfResponse,
}

/// Stall bookkeeping for one in-flight response
struct ResponseWatch {
    started: Instant,
    last_data: Instant,
}

impl ResponseWatch {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_data: now,
        }
    }

    fn stalled(&self, no_data: Duration, total: Duration) -> bool {
        self.last_data.elapsed() > no_data || self.started.elapsed() > total
    }
}

pub struct SatelliteService {
    config: Config,
    uuid: String,
}

impl SatelliteService {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            uuid: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Run forever, reconnecting with back-off on failure
    pub async fn run(self) -> Result<()> {
        // Music pipeline persists across reconnects so a network blip does
        // not cut playback of already-buffered audio.
        let music_shared = PlayerShared::new(
            self.config.audio.ring_capacity,
            2,
            self.config.audio.sample_rate,
            self.config.audio.period_frames,
            self.config.audio.prebuffer_ms,
            self.config.audio.volume,
        );
        let _music_player = start_player(Arc::clone(&music_shared), 2, self.config.audio.sample_rate);
        let mut music_pump = DecoderPump::new(
            Pcm16Decoder::new(2, self.config.audio.sample_rate),
            Arc::clone(&music_shared),
        );

        // Local synthesis path: its own player, paused music while speaking
        let tts_config = HttpTtsConfig::default();
        let voice_shared = PlayerShared::new(
            VOICE_RING_CAPACITY,
            1,
            tts_config.sample_rate,
            1024,
            200,
            self.config.audio.volume,
        );
        let _voice_player = start_player(Arc::clone(&voice_shared), 1, tts_config.sample_rate);
        let (tts_tx, tts_rx) = mpsc::channel::<TtsJob>(32);
        tokio::spawn(tts_task(
            tts_rx,
            Box::new(HttpTts::new(tts_config)),
            Arc::clone(&voice_shared),
            Arc::clone(&music_shared),
        ));

        // Microphone frames arrive over this channel; without audio
        // hardware the sender is parked and the voice loop stays idle.
        let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<i16>>(64);
        let _mic_guard = spawn_capture(&self.config, frame_tx);

        let mut backoff = Duration::from_secs(1);
        loop {
            let mut registered = false;
            let result = self
                .run_connection(&mut music_pump, &mut frame_rx, &tts_tx, &mut registered)
                .await;
            match result {
                Ok(()) => info!("daemon connection closed"),
                Err(e) => warn!("daemon connection failed: {e:#}"),
            }
            if registered {
                backoff = Duration::from_secs(1);
            }

            let jitter = Duration::from_millis(rand::rng().random_range(0..1000));
            let delay = backoff + jitter;
            info!("reconnecting in {delay:?}");
            tokio::time::sleep(delay).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn run_connection(
        &self,
        music_pump: &mut DecoderPump<Pcm16Decoder>,
        frame_rx: &mut mpsc::Receiver<Vec<i16>>,
        tts_tx: &mpsc::Sender<TtsJob>,
        registered: &mut bool,
    ) -> Result<()> {
        let satellite = &self.config.satellite;
        let connect_deadline = Duration::from_secs(satellite.connect_timeout_secs);

        let url = url::Url::parse(&satellite.daemon_url).context("invalid daemon URL")?;
        if !matches!(url.scheme(), "ws" | "wss") {
            bail!("daemon URL must use ws:// or wss://, got {}", url.scheme());
        }

        let (socket, _response) =
            tokio::time::timeout(connect_deadline, connect_async(satellite.daemon_url.as_str()))
                .await
                .context("connect timed out")?
                .context("WebSocket connect failed")?;
        info!(url = %satellite.daemon_url, "connected to daemon");

        let (mut ws_tx, mut ws_rx) = socket.split();

        // Single writer task; `pending` counts payloads not yet on the wire
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
        let pending = Arc::new(AtomicUsize::new(0));
        let writer_pending = Arc::clone(&pending);
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let result = ws_tx.send(message).await;
                writer_pending.fetch_sub(1, Ordering::AcqRel);
                if result.is_err() {
                    break;
                }
            }
        });

        let send = |message: ClientMessage| {
            let out_tx = out_tx.clone();
            let pending = Arc::clone(&pending);
            async move {
                let encoded = message.encode().context("encode outbound frame")?;
                pending.fetch_add(1, Ordering::AcqRel);
                if out_tx.send(Message::Text(encoded.into())).await.is_err() {
                    pending.fetch_sub(1, Ordering::AcqRel);
                    bail!("writer task gone");
                }
                Ok::<(), anyhow::Error>(())
            }
        };

        // Register, presenting the persisted secret if we have one
        send(ClientMessage::SatelliteRegister {
            uuid: self.uuid.clone(),
            name: satellite.name.clone(),
            location: satellite.location.clone(),
            tier: satellite.tier,
            capabilities: SatelliteCapabilities {
                local_asr: true,
                local_tts: true,
                wake_word: true,
            },
            reconnect_secret: super::load_secret(),
        })
        .await?;

        // Registration must complete within the connect deadline
        let ack_deadline = Instant::now() + connect_deadline;
        loop {
            let remaining = ack_deadline.saturating_duration_since(Instant::now());
            let message = tokio::time::timeout(remaining, ws_rx.next())
                .await
                .context("registration timed out")?
                .context("connection closed during registration")?
                .context("transport error during registration")?;
            let Message::Text(text) = message else {
                continue;
            };
            match ServerMessage::decode(text.as_str()) {
                Ok(ServerMessage::SatelliteRegisterAck {
                    success,
                    session_id,
                    reconnect_secret,
                    message,
                }) => {
                    if !success {
                        bail!("registration refused: {}", message.unwrap_or_default());
                    }
                    info!(session_id, "registered with daemon");
                    if let Some(secret) = reconnect_secret {
                        if let Err(e) = super::store_secret(&secret) {
                            warn!("could not persist reconnect secret: {e}");
                        }
                    }
                    break;
                }
                Ok(other) => debug!("pre-registration frame: {other:?}"),
                Err(e) => debug!("undecodable frame during registration: {e}"),
            }
        }
        *registered = true;

        // Voice machine is rebuilt per connection; silence is the safe state
        let mut machine = VoiceMachine::new(
            self.config.voice.clone(),
            EnergyVad::new(EnergyVadConfig {
                frame_size: self.config.voice.frame_samples(),
                ..Default::default()
            }),
            HttpAsr::new(HttpAsrConfig {
                sample_rate: self.config.voice.sample_rate,
                ..Default::default()
            }),
        );

        let mut pipeliner: Option<SentencePipeliner<Box<dyn FnMut(String) + Send>>> = None;
        let mut watch: Option<ResponseWatch> = None;

        let mut ping = tokio::time::interval(Duration::from_secs(satellite.ping_interval_secs));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut stall_tick = tokio::time::interval(Duration::from_secs(1));
        let no_data = Duration::from_secs(satellite.no_data_stall_secs);
        let total = Duration::from_secs(satellite.total_stall_secs);

        loop {
            tokio::select! {
                inbound = ws_rx.next() => {
                    let Some(Ok(message)) = inbound else {
                        // Transport gone; surface the offline greeting if we
                        // were mid-interaction, then let the caller retry.
                        if machine.state() == VoiceState::Waiting {
                            let _ = tts_tx.send(TtsJob::Sentence(OFFLINE_GREETING.to_string())).await;
                            let _ = tts_tx.send(TtsJob::EndOfResponse).await;
                        }
                        machine.connection_lost();
                        break;
                    };
                    match message {
                        Message::Text(text) => {
                            match ServerMessage::decode(text.as_str()) {
                                Ok(decoded) => handle_server_message(
                                    decoded,
                                    &mut machine,
                                    &mut pipeliner,
                                    &mut watch,
                                    tts_tx,
                                ).await,
                                Err(e) => debug!("undecodable control frame: {e}"),
                            }
                        }
                        Message::Binary(bytes) => {
                            match BinaryFrame::decode(&bytes) {
                                // The pump may wait up to 100 ms for ring
                                // space; keep that off the reactor.
                                Ok(frame) => tokio::task::block_in_place(|| {
                                    route_audio_frame(frame, music_pump)
                                }),
                                Err(e) => debug!("undecodable binary frame: {e}"),
                            }
                        }
                        Message::Close(_) => {
                            machine.connection_lost();
                            break;
                        }
                        _ => {}
                    }
                }
                Some(frame) = frame_rx.recv() => {
                    match machine.process_frame(&frame).await {
                        Ok(actions) => {
                            for action in actions {
                                let VoiceAction::SendQuery(text) = action;
                                info!(query = %text, "sending satellite query");
                                send(ClientMessage::SatelliteQuery { text }).await?;
                                watch = Some(ResponseWatch::new());
                            }
                        }
                        Err(e) => warn!("voice frame processing failed: {e}"),
                    }
                }
                _ = ping.tick() => {
                    // Skip the keep-alive while a payload is still pending
                    // so there is never more than one frame in flight.
                    if pending.load(Ordering::Acquire) == 0 {
                        send(ClientMessage::SatellitePing).await?;
                    } else {
                        debug!("ping skipped, tx pending");
                    }
                }
                _ = stall_tick.tick() => {
                    if let Some(w) = &watch {
                        if w.stalled(no_data, total) {
                            warn!("response stalled, returning to idle");
                            let _ = send(ClientMessage::Cancel).await;
                            if let Some(mut p) = pipeliner.take() {
                                p.flush();
                            }
                            let _ = tts_tx.send(TtsJob::EndOfResponse).await;
                            machine.response_complete();
                            watch = None;
                        }
                    }
                }
            }
        }

        drop(send);
        drop(out_tx);
        let _ = writer.await;
        Ok(())
    }
}

/// Dispatch one decoded daemon frame
async fn handle_server_message(
    message: ServerMessage,
    machine: &mut VoiceMachine<EnergyVad, HttpAsr>,
    pipeliner: &mut Option<SentencePipeliner<Box<dyn FnMut(String) + Send>>>,
    watch: &mut Option<ResponseWatch>,
    tts_tx: &mpsc::Sender<TtsJob>,
) {
    match message {
        ServerMessage::Session { .. } => {
            // Browser clients persist this; satellites re-attach by secret
            debug!("session token received");
        }
        ServerMessage::State { state, .. } => debug!(%state, "daemon state"),
        ServerMessage::Transcript { role, text } => {
            info!(%role, %text, "transcript");
        }
        ServerMessage::StreamStart { stream_id } => {
            debug!(stream_id, "response stream started");
            let tx = tts_tx.clone();
            *pipeliner = Some(SentencePipeliner::new(Box::new(move |sentence: String| {
                if tx.try_send(TtsJob::Sentence(sentence)).is_err() {
                    warn!("synthesis backlog full, dropping sentence");
                }
            })));
            if let Some(w) = watch {
                w.last_data = Instant::now();
            }
        }
        ServerMessage::StreamDelta { delta, .. } => {
            if let Some(p) = pipeliner {
                p.push(&delta);
            }
            if let Some(w) = watch {
                w.last_data = Instant::now();
            }
            machine.begin_speaking();
        }
        ServerMessage::StreamEnd { stream_id } => {
            debug!(stream_id, "response stream complete");
            if let Some(mut p) = pipeliner.take() {
                p.flush();
            }
            let _ = tts_tx.send(TtsJob::EndOfResponse).await;
            machine.response_complete();
            *watch = None;
        }
        ServerMessage::Error {
            code,
            message,
            recoverable,
        } => {
            warn!(%code, %message, "daemon error");
            if recoverable == Some(false) {
                machine.connection_lost();
            } else {
                machine.response_complete();
            }
            *watch = None;
        }
        ServerMessage::SatelliteRegisterAck { .. } => {
            debug!("duplicate registration ack ignored");
        }
        ServerMessage::SatellitePong => debug!("pong"),
    }
}

/// Binary frames feed the music pipeline
fn route_audio_frame(frame: BinaryFrame, music_pump: &mut DecoderPump<Pcm16Decoder>) {
    match frame.kind {
        BinaryKind::AudioOut => match music_pump.push_frame(&frame.payload) {
            Ok(_) => {}
            Err(PumpError::RingFull) => {
                // A dropped frame glitches; unbounded latency is worse
                debug!("music ring full, frame dropped");
            }
            Err(e) => warn!("music frame rejected: {e}"),
        },
        BinaryKind::EndOfAudio => {
            debug!("end of response audio");
        }
        BinaryKind::AudioIn | BinaryKind::EndOfUtterance => {
            debug!("ignoring client-direction binary frame from daemon");
        }
    }
}

/// Synthesis worker: sentence in, PCM into the voice ring. Pauses music
/// playback (with the quiescence handshake) for the duration of a spoken
/// response since both paths share the output device.
async fn tts_task(
    mut rx: mpsc::Receiver<TtsJob>,
    mut engine: Box<dyn TtsEngine>,
    voice: Arc<PlayerShared>,
    music: Arc<PlayerShared>,
) {
    let mut speaking = false;
    while let Some(job) = rx.recv().await {
        match job {
            TtsJob::Sentence(text) => {
                if !speaking {
                    let acked = tokio::task::block_in_place(|| music.pause());
                    if !acked {
                        warn!("music consumer did not acknowledge pause");
                    }
                    speaking = true;
                }
                match engine.synthesize(&text).await {
                    Ok(samples) if !samples.is_empty() => {
                        tokio::task::block_in_place(|| push_pcm(&voice, &samples));
                    }
                    Ok(_) => {}
                    Err(e) => warn!("sentence synthesis failed: {e}"),
                }
            }
            TtsJob::EndOfResponse => {
                if speaking {
                    // Let the tail of the spoken audio drain before music
                    // retakes the device.
                    let drained = Instant::now() + Duration::from_secs(10);
                    while voice.ring.count() > 0 && Instant::now() < drained {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    music.resume();
                    speaking = false;
                }
            }
        }
    }
}

/// Blocking ring write with bounded waits for the consumer to drain
fn push_pcm(shared: &PlayerShared, samples: &[i16]) {
    for chunk in samples.chunks(2048) {
        loop {
            if shared.is_shutdown() {
                return;
            }
            if shared.ring.free() >= chunk.len() {
                shared.ring.write(chunk);
                shared.note_data_arrival();
                break;
            }
            shared.wait_for_space(chunk.len(), Duration::from_millis(100));
        }
    }
}

#[cfg(feature = "hardware")]
fn start_player(shared: Arc<PlayerShared>, channels: u16, sample_rate: u32) -> Player {
    Player::start(shared, move || {
        Box::new(crate::audio::hw::CpalSink::new(channels, sample_rate))
    })
}

#[cfg(not(feature = "hardware"))]
fn start_player(shared: Arc<PlayerShared>, _channels: u16, _sample_rate: u32) -> Player {
    Player::start(shared, || Box::new(crate::audio::NullSink::new()))
}

/// Spawn the microphone reader thread. Returns a guard the caller holds so
/// the capture sender stays alive for the life of the service.
#[cfg(feature = "hardware")]
fn spawn_capture(config: &Config, frame_tx: mpsc::Sender<Vec<i16>>) -> Option<std::thread::JoinHandle<()>> {
    use crate::audio::hw::{AudioSource, CpalSource};

    let frame_samples = config.voice.frame_samples();
    let sample_rate = config.voice.sample_rate;
    let handle = std::thread::Builder::new()
        .name("dawn-capture".to_string())
        .spawn(move || {
            let mut source = match CpalSource::new(sample_rate) {
                Ok(source) => source,
                Err(e) => {
                    warn!("microphone unavailable, voice loop disabled: {e}");
                    // Keep the sender alive so the select arm stays pending
                    loop {
                        std::thread::sleep(Duration::from_secs(3600));
                    }
                }
            };
            let mut frame = vec![0i16; frame_samples];
            loop {
                match source.read_frame(&mut frame) {
                    Ok(true) => {
                        if frame_tx.blocking_send(frame.clone()).is_err() {
                            break;
                        }
                    }
                    Ok(false) => break,
                    Err(e) => {
                        warn!("capture read failed: {e}");
                        break;
                    }
                }
            }
        })
        .ok();
    handle
}

#[cfg(not(feature = "hardware"))]
fn spawn_capture(
    _config: &Config,
    frame_tx: mpsc::Sender<Vec<i16>>,
) -> Option<mpsc::Sender<Vec<i16>>> {
    // No capture hardware: park the sender so the voice select arm never
    // resolves, leaving the music and text paths fully functional.
    Some(frame_tx)
}
