//! Real-time playback consumer
//!
//! A dedicated thread drains the SPSC ring to the audio sink at period
//! granularity, applying integer volume scaling. Playback starts only once
//! the pre-buffer threshold is reached so network jitter does not cause
//! immediate underrun. Pausing uses an acknowledge handshake: `pause()`
//! returns once the consumer has parked on its wait path, guaranteeing it
//! will not touch the sink until resume or stop.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::audio::ring::SpscRing;

/// How long `pause()` waits for the consumer to acknowledge quiescence
pub const PAUSE_ACK_TIMEOUT: Duration = Duration::from_millis(200);

/// Consumer wait granularity while hunting for data or state changes
const CONSUMER_WAIT: Duration = Duration::from_millis(100);

/// Playback pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// No stream active; ring empty
    Idle,
    /// Data arriving but pre-buffer threshold not yet reached
    Buffering,
    Playing,
    Paused,
}

/// Abstraction over the OS audio output device.
///
/// Sinks are created on the playback thread itself (some platform audio
/// handles are not `Send`), so the trait carries no thread bound.
pub trait AudioSink {
    /// (Re)open or resume the device before writes
    fn prepare(&mut self) -> Result<()>;

    /// Blocking write of interleaved i16 PCM
    fn write(&mut self, samples: &[i16]) -> Result<()>;

    /// Frames currently queued inside the driver
    fn delay_frames(&self) -> usize;
}

/// Sink that swallows audio; used in tests and headless builds
#[derive(Default)]
pub struct NullSink {
    written: Arc<Mutex<Vec<i16>>>,
    prepare_calls: Arc<AtomicUsize>,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of everything written, for assertions
    pub fn recorder(&self) -> Arc<Mutex<Vec<i16>>> {
        Arc::clone(&self.written)
    }

    pub fn prepare_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.prepare_calls)
    }
}

impl AudioSink for NullSink {
    fn prepare(&mut self) -> Result<()> {
        self.prepare_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write(&mut self, samples: &[i16]) -> Result<()> {
        self.written.lock().unwrap().extend_from_slice(samples);
        Ok(())
    }

    fn delay_frames(&self) -> usize {
        0
    }
}

/// State shared between the decoder pump, the consumer thread, and the
/// controlling code. The mutex only guards condition-variable predicates;
/// the ring itself is lock-free.
pub struct PlayerShared {
    pub ring: SpscRing,
    state: Mutex<PlaybackState>,
    /// Consumer waits here for data or a state change
    data_cond: Condvar,
    /// Producer waits here for free space
    space_cond: Condvar,
    /// Caller waits here for pause acknowledgement
    pause_ack_cond: Condvar,
    pause_ack: AtomicBool,
    shutdown: AtomicBool,
    /// Consumer must re-prepare the sink before the next write
    reprepare: AtomicBool,
    /// Pump must reset its decoder before the next frame
    decoder_reset: AtomicBool,
    volume: AtomicU32,
    sink_delay_frames: AtomicUsize,
    channels: u16,
    sample_rate: u32,
    period_samples: usize,
    prebuffer_samples: usize,
}

impl PlayerShared {
    pub fn new(
        ring_capacity: usize,
        channels: u16,
        sample_rate: u32,
        period_frames: usize,
        prebuffer_ms: u64,
        volume: u8,
    ) -> Arc<Self> {
        let prebuffer_samples =
            (sample_rate as u64 * prebuffer_ms / 1000) as usize * channels as usize;
        Arc::new(Self {
            ring: SpscRing::new(ring_capacity),
            state: Mutex::new(PlaybackState::Idle),
            data_cond: Condvar::new(),
            space_cond: Condvar::new(),
            pause_ack_cond: Condvar::new(),
            pause_ack: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            reprepare: AtomicBool::new(false),
            decoder_reset: AtomicBool::new(false),
            volume: AtomicU32::new(volume.min(100) as u32),
            sink_delay_frames: AtomicUsize::new(0),
            channels,
            sample_rate,
            period_samples: period_frames * channels as usize,
            prebuffer_samples,
        })
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.lock().unwrap()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed) as u8
    }

    pub fn set_volume(&self, volume: u8) {
        self.volume.store(volume.min(100) as u32, Ordering::Relaxed);
    }

    /// Producer-side: wake the consumer after a write, entering buffering
    /// if this is the first data of a stream
    pub fn note_data_arrival(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == PlaybackState::Idle {
            *state = PlaybackState::Buffering;
            debug!("playback entering buffering");
        }
        self.data_cond.notify_all();
    }

    /// Producer-side: wait up to `timeout` for at least `needed` free
    /// samples. Returns false on timeout or shutdown.
    pub fn wait_for_space(&self, needed: usize, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if self.is_shutdown() {
                return false;
            }
            if self.ring.free() >= needed {
                return true;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _timeout) = self
                .space_cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
    }

    /// Whether the pump should reset its decoder, clearing the flag
    pub fn take_decoder_reset(&self) -> bool {
        self.decoder_reset.swap(false, Ordering::AcqRel)
    }

    /// Pause playback and wait for the consumer to acknowledge quiescence.
    /// Returns true if the consumer acknowledged within the window.
    pub fn pause(&self) -> bool {
        let state = self.state.lock().unwrap();
        if *state == PlaybackState::Paused {
            return true;
        }
        let mut state = state;
        *state = PlaybackState::Paused;
        self.pause_ack.store(false, Ordering::Release);
        self.data_cond.notify_all();

        let (_guard, result) = self
            .pause_ack_cond
            .wait_timeout_while(state, PAUSE_ACK_TIMEOUT, |_| {
                !self.pause_ack.load(Ordering::Acquire)
            })
            .unwrap();
        let acked = !result.timed_out();
        if !acked {
            warn!("pause not acknowledged within {PAUSE_ACK_TIMEOUT:?}");
        }
        acked
    }

    /// Resume from pause; the consumer re-prepares the sink first.
    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == PlaybackState::Paused {
            *state = PlaybackState::Playing;
            self.reprepare.store(true, Ordering::Release);
            self.data_cond.notify_all();
        }
    }

    /// Stop playback: drop buffered audio, reset the pipeline to idle and
    /// ask the pump to reset its decoder.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        *state = PlaybackState::Idle;
        self.ring.clear();
        self.decoder_reset.store(true, Ordering::Release);
        self.data_cond.notify_all();
        self.space_cond.notify_all();
    }

    /// Buffered latency in milliseconds: ring content plus driver queue
    pub fn latency_ms(&self) -> u64 {
        let ring_frames = self.ring.count() / self.channels as usize;
        let total = ring_frames + self.sink_delay_frames.load(Ordering::Relaxed);
        (total as u64) * 1000 / self.sample_rate as u64
    }

    fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.data_cond.notify_all();
        self.space_cond.notify_all();
        self.pause_ack_cond.notify_all();
    }
}

/// Scale one sample by an integer volume in 0-100
#[inline]
fn scale_sample(sample: i16, volume: u32) -> i16 {
    ((sample as i32 * volume as i32) / 100).clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// Playback controller owning the consumer thread
pub struct Player {
    shared: Arc<PlayerShared>,
    handle: Option<JoinHandle<()>>,
}

impl Player {
    /// Spawn the consumer thread. `make_sink` runs on the playback thread
    /// so the sink may hold non-`Send` device handles.
    pub fn start<F>(shared: Arc<PlayerShared>, make_sink: F) -> Self
    where
        F: FnOnce() -> Box<dyn AudioSink> + Send + 'static,
    {
        let consumer_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("dawn-playback".to_string())
            .spawn(move || consumer_loop(consumer_shared, make_sink()))
            .expect("failed to spawn playback thread");
        Self {
            shared,
            handle: Some(handle),
        }
    }

    pub fn shared(&self) -> Arc<PlayerShared> {
        Arc::clone(&self.shared)
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.shared.begin_shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn consumer_loop(shared: Arc<PlayerShared>, mut sink: Box<dyn AudioSink>) {
    let mut period = vec![0i16; shared.period_samples];
    let mut logged_start = false;

    loop {
        if shared.is_shutdown() {
            break;
        }

        let mut state = shared.state.lock().unwrap();
        match *state {
            PlaybackState::Idle => {
                logged_start = false;
                let (guard, _) = shared.data_cond.wait_timeout(state, CONSUMER_WAIT).unwrap();
                drop(guard);
                continue;
            }
            PlaybackState::Buffering => {
                if shared.ring.count() >= shared.prebuffer_samples {
                    *state = PlaybackState::Playing;
                    if !logged_start {
                        info!(
                            buffered = shared.ring.count(),
                            "pre-buffer threshold reached, starting playback"
                        );
                        logged_start = true;
                    }
                    if let Err(e) = sink.prepare() {
                        warn!("audio sink prepare failed: {e}");
                    }
                    continue;
                }
                let (guard, _) = shared.data_cond.wait_timeout(state, CONSUMER_WAIT).unwrap();
                drop(guard);
                continue;
            }
            PlaybackState::Paused => {
                // Quiescent: signal the pause initiator, then park.
                if !shared.pause_ack.swap(true, Ordering::AcqRel) {
                    shared.pause_ack_cond.notify_all();
                }
                let (guard, _) = shared.data_cond.wait_timeout(state, CONSUMER_WAIT).unwrap();
                drop(guard);
                continue;
            }
            PlaybackState::Playing => {
                if shared.reprepare.swap(false, Ordering::AcqRel) {
                    if let Err(e) = sink.prepare() {
                        warn!("audio sink re-prepare failed: {e}");
                    }
                }
                if shared.ring.count() < shared.period_samples {
                    // Underrun tolerance: stay in playing, wait for data
                    let (guard, _) =
                        shared.data_cond.wait_timeout(state, CONSUMER_WAIT).unwrap();
                    drop(guard);
                    continue;
                }
                drop(state);
            }
        }

        // Playing with a full period available; locks released during the
        // blocking sink write.
        shared.ring.read(&mut period);
        let volume = shared.volume.load(Ordering::Relaxed);
        if volume < 100 {
            for sample in period.iter_mut() {
                *sample = scale_sample(*sample, volume);
            }
        }
        if let Err(e) = sink.write(&period) {
            warn!("audio sink write failed: {e}");
        }
        shared
            .sink_delay_frames
            .store(sink.delay_frames(), Ordering::Relaxed);
        shared.space_cond.notify_all();
    }
}
