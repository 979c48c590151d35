use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::capture::AudioSource;
use crate::config::{AudioConfig, DetectorConfig};
use crate::tempo::{TempoEstimator, TempoHistory};

/// How long `stop` waits for the capture thread before detaching it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Where the detector currently is in the silence/music cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DetectorState {
    /// No music heard yet.
    Waiting,
    /// Music playing, tempo not yet established.
    Listening,
    /// Tempo locked; dancing is allowed.
    Ready,
    /// Music stopped after a tempo had been locked.
    Silent,
}

/// Atomic copy of the detector's externally visible state. The BPM is only
/// meaningful while the state is [`DetectorState::Ready`]; use
/// [`dance_bpm`](Self::dance_bpm) instead of reading the field directly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DetectorSnapshot {
    pub state: DetectorState,
    pub bpm: Option<f32>,
}

impl Default for DetectorSnapshot {
    fn default() -> Self {
        Self {
            state: DetectorState::Waiting,
            bpm: None,
        }
    }
}

impl DetectorSnapshot {
    /// The BPM to dance to, present only when the detector is `Ready`.
    pub fn dance_bpm(&self) -> Option<f32> {
        match self.state {
            DetectorState::Ready => self.bpm,
            _ => None,
        }
    }

    pub fn can_dance(&self) -> bool {
        self.dance_bpm().is_some()
    }
}

/// The silence/music state machine and tempo tracker, free of any threading.
///
/// Time is passed into [`process_chunk`](Self::process_chunk) rather than
/// read from the wall clock, so the exact transition behavior can be driven
/// deterministically by tests.
#[derive(Debug)]
pub struct DetectorEngine {
    config: DetectorConfig,
    sample_rate: u32,
    window_samples: usize,
    buffer: Vec<f32>,
    history: TempoHistory,
    estimator: TempoEstimator,
    music_started: Option<Instant>,
    silence_started: Option<Instant>,
    snapshot: DetectorSnapshot,
}

impl DetectorEngine {
    pub fn new(audio: &AudioConfig, config: DetectorConfig) -> Self {
        let window_samples = config.window_samples(audio.sample_rate);
        let estimator = TempoEstimator::new(config.min_bpm, config.max_bpm);
        let history = TempoHistory::new(config.history_size);
        Self {
            config,
            sample_rate: audio.sample_rate,
            window_samples,
            buffer: Vec::with_capacity(window_samples * 2),
            history,
            estimator,
            music_started: None,
            silence_started: None,
            snapshot: DetectorSnapshot::default(),
        }
    }

    pub fn snapshot(&self) -> DetectorSnapshot {
        self.snapshot
    }

    /// Accepted estimates backing the published BPM.
    pub fn tempo_history(&self) -> &TempoHistory {
        &self.history
    }

    /// Classifies one captured chunk and advances the state machine.
    pub fn process_chunk(&mut self, chunk: &[f32], now: Instant) {
        let is_sound = rms(chunk) >= self.config.silence_threshold;
        match self.snapshot.state {
            DetectorState::Waiting => {
                if is_sound {
                    self.enter_listening(chunk, now);
                }
            }
            DetectorState::Listening => {
                if is_sound {
                    self.silence_started = None;
                    self.buffer.extend_from_slice(chunk);
                    self.bound_buffer();
                    self.try_estimate(now);
                } else if self.silence_elapsed(now) >= self.config.silence_duration() {
                    debug!("music faded before a tempo was found, waiting again");
                    self.buffer.clear();
                    self.music_started = None;
                    self.silence_started = None;
                    self.snapshot.state = DetectorState::Waiting;
                }
            }
            DetectorState::Ready => {
                if is_sound {
                    self.silence_started = None;
                    self.buffer.extend_from_slice(chunk);
                    self.bound_buffer();
                } else if self.silence_elapsed(now) >= self.config.silence_duration() {
                    info!("silence detected, dance paused");
                    self.silence_started = None;
                    self.snapshot.state = DetectorState::Silent;
                }
            }
            DetectorState::Silent => {
                if is_sound {
                    self.enter_listening(chunk, now);
                }
            }
        }
        // Invariant: the published BPM is always the median of the history.
        self.snapshot.bpm = self.history.median();
    }

    fn enter_listening(&mut self, chunk: &[f32], now: Instant) {
        debug!("music detected, estimating tempo");
        self.history.clear();
        self.buffer.clear();
        self.buffer.extend_from_slice(chunk);
        self.music_started = Some(now);
        self.silence_started = None;
        self.snapshot.state = DetectorState::Listening;
    }

    /// Runs the tempo estimator over the freshest analysis window once both
    /// the listening time and the sample count qualify. Re-attempted on every
    /// subsequent chunk until an in-range estimate lands.
    fn try_estimate(&mut self, now: Instant) {
        let listened = self
            .music_started
            .map(|started| now.duration_since(started))
            .unwrap_or_default();
        if listened < self.config.listen_duration() || self.buffer.len() < self.window_samples {
            return;
        }
        let window = &self.buffer[self.buffer.len() - self.window_samples..];
        let Some(bpm) = self.estimator.estimate(window, self.sample_rate) else {
            return;
        };
        if !self.config.bpm_in_range(bpm) {
            debug!(bpm, "tempo estimate out of range, still listening");
            return;
        }
        self.history.push(bpm);
        self.snapshot.state = DetectorState::Ready;
        info!(bpm, "tempo locked, ready to dance");
    }

    fn silence_elapsed(&mut self, now: Instant) -> Duration {
        let started = *self.silence_started.get_or_insert(now);
        now.duration_since(started)
    }

    fn bound_buffer(&mut self) {
        if self.buffer.len() > self.window_samples * 2 {
            let excess = self.buffer.len() - self.window_samples;
            self.buffer.drain(..excess);
        }
    }
}

/// Owns the capture thread and publishes [`DetectorSnapshot`]s for the rest
/// of the system. All audio work happens off the caller's thread; `snapshot`
/// and `can_dance` only copy a few words under a lock.
pub struct BeatDetector {
    audio: AudioConfig,
    config: DetectorConfig,
    snapshot: Arc<Mutex<DetectorSnapshot>>,
    running: Arc<AtomicBool>,
    worker: Option<Worker>,
}

struct Worker {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

impl BeatDetector {
    pub fn new(audio: AudioConfig, config: DetectorConfig) -> Self {
        Self {
            audio,
            config,
            snapshot: Arc::new(Mutex::new(DetectorSnapshot::default())),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Starts the capture thread reading from `source`. No-op when already
    /// running. A source that fails to open is logged and the detector stays
    /// stopped; the rest of the system continues without beat sync.
    pub fn start(&mut self, source: Box<dyn AudioSource + Send>) {
        if self.running.load(Ordering::SeqCst) {
            debug!("beat detector already running");
            return;
        }
        self.running.store(true, Ordering::SeqCst);

        let (done_tx, done) = bounded::<()>(1);
        let audio = self.audio;
        let config = self.config.clone();
        let snapshot = self.snapshot.clone();
        let running = self.running.clone();
        let handle = thread::spawn(move || {
            // Dropped on every exit path, including panics, so `stop` never
            // waits longer than the thread actually lives.
            let _done = done_tx;
            capture_loop(source, audio, config, snapshot, running);
        });
        self.worker = Some(Worker { handle, done });
    }

    /// Signals the capture thread and joins it within [`JOIN_TIMEOUT`]. A
    /// thread that fails to stop in time is detached and logged, never a
    /// reason to hang the caller's shutdown.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let Some(worker) = self.worker.take() else {
            return;
        };
        match worker.done.recv_timeout(JOIN_TIMEOUT) {
            Err(RecvTimeoutError::Timeout) => {
                warn!("beat detector did not stop in time, detaching its thread");
            }
            _ => {
                if worker.handle.join().is_err() {
                    warn!("beat detector thread panicked");
                }
            }
        }
    }

    /// Latest committed state/BPM pair, copied out atomically.
    pub fn snapshot(&self) -> DetectorSnapshot {
        self.snapshot
            .lock()
            .map(|guard| *guard)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    pub fn can_dance(&self) -> bool {
        self.snapshot().can_dance()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn capture_loop(
    mut source: Box<dyn AudioSource + Send>,
    audio: AudioConfig,
    config: DetectorConfig,
    snapshot: Arc<Mutex<DetectorSnapshot>>,
    running: Arc<AtomicBool>,
) {
    if let Err(err) = source.open(&audio) {
        warn!(%err, "audio input unavailable, beat detection disabled");
        running.store(false, Ordering::SeqCst);
        return;
    }
    info!(
        sample_rate = audio.sample_rate,
        chunk_size = audio.chunk_size,
        "listening for music"
    );

    let mut engine = DetectorEngine::new(&audio, config);
    let mut chunk = vec![0.0f32; audio.chunk_size];
    while running.load(Ordering::SeqCst) {
        match source.read_chunk(&mut chunk) {
            Ok(0) => {
                debug!("audio input ended");
                break;
            }
            Ok(count) => {
                engine.process_chunk(&chunk[..count], Instant::now());
                if let Ok(mut shared) = snapshot.lock() {
                    *shared = engine.snapshot();
                }
            }
            Err(err) => {
                debug!(%err, "audio read failed, retrying");
            }
        }
    }
    source.close();
    running.store(false, Ordering::SeqCst);
    info!("beat detection stopped");
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::click_track;
    use crate::Result;

    const BPM: f32 = 120.0;

    fn test_audio() -> AudioConfig {
        AudioConfig::default()
    }

    /// Drives the engine with `count` chunks of either click track or
    /// silence, advancing a synthetic clock by one chunk duration per step.
    struct Clock {
        audio: AudioConfig,
        base: Instant,
        step: usize,
    }

    impl Clock {
        fn new(audio: AudioConfig) -> Self {
            Self {
                audio,
                base: Instant::now(),
                step: 0,
            }
        }

        fn feed(&mut self, engine: &mut DetectorEngine, sound: bool, count: usize) {
            let mut chunk = vec![0.0; self.audio.chunk_size];
            for _ in 0..count {
                if sound {
                    let offset = (self.step * self.audio.chunk_size) as u64;
                    click_track(BPM, self.audio.sample_rate, offset, &mut chunk);
                } else {
                    chunk.iter_mut().for_each(|s| *s = 0.0);
                }
                let now = self.base + self.audio.chunk_duration() * self.step as u32;
                engine.process_chunk(&chunk, now);
                self.step += 1;
            }
        }
    }

    fn chunks_for(audio: &AudioConfig, seconds: f32) -> usize {
        (seconds / audio.chunk_duration().as_secs_f32()).ceil() as usize + 1
    }

    #[test]
    fn locks_tempo_after_the_listen_window() {
        let audio = test_audio();
        let mut engine = DetectorEngine::new(&audio, DetectorConfig::default());
        let mut clock = Clock::new(audio);

        clock.feed(&mut engine, true, 1);
        assert_eq!(engine.snapshot().state, DetectorState::Listening);

        clock.feed(&mut engine, true, chunks_for(&audio, 5.5));
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, DetectorState::Ready);
        let bpm = snapshot.dance_bpm().expect("ready implies a bpm");
        assert!((bpm - BPM).abs() < 3.0, "estimated {bpm}");
        assert_eq!(snapshot.bpm, engine.tempo_history().median());
    }

    #[test]
    fn brief_noise_falls_back_to_waiting() {
        let audio = test_audio();
        let mut engine = DetectorEngine::new(&audio, DetectorConfig::default());
        let mut clock = Clock::new(audio);

        clock.feed(&mut engine, true, 10);
        assert_eq!(engine.snapshot().state, DetectorState::Listening);

        clock.feed(&mut engine, false, chunks_for(&audio, 2.0));
        assert_eq!(engine.snapshot().state, DetectorState::Waiting);
        assert!(engine.buffer.is_empty());
    }

    #[test]
    fn silence_pauses_and_a_new_song_restarts_with_empty_history() {
        let audio = test_audio();
        let mut engine = DetectorEngine::new(&audio, DetectorConfig::default());
        let mut clock = Clock::new(audio);

        clock.feed(&mut engine, true, chunks_for(&audio, 5.5));
        assert_eq!(engine.snapshot().state, DetectorState::Ready);
        assert!(!engine.tempo_history().is_empty());

        clock.feed(&mut engine, false, chunks_for(&audio, 2.0));
        assert_eq!(engine.snapshot().state, DetectorState::Silent);

        clock.feed(&mut engine, true, 1);
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, DetectorState::Listening);
        assert_eq!(engine.tempo_history().len(), 0);
        assert_eq!(snapshot.bpm, None);
    }

    #[test]
    fn accumulation_buffer_stays_bounded() {
        let audio = test_audio();
        let mut engine = DetectorEngine::new(&audio, DetectorConfig::default());
        let mut clock = Clock::new(audio);

        clock.feed(&mut engine, true, chunks_for(&audio, 14.0));
        assert!(engine.buffer.len() <= engine.window_samples * 2);
    }

    #[test]
    fn transitions_stay_on_the_defined_edges() {
        use DetectorState::*;
        let allowed = [
            (Waiting, Waiting),
            (Waiting, Listening),
            (Listening, Listening),
            (Listening, Ready),
            (Listening, Waiting),
            (Ready, Ready),
            (Ready, Silent),
            (Silent, Silent),
            (Silent, Listening),
        ];

        let audio = test_audio();
        let mut engine = DetectorEngine::new(&audio, DetectorConfig::default());
        let mut clock = Clock::new(audio);

        // Deterministic pseudo-random mix of sound bursts and silences.
        let mut seed = 0x2545_f491u32;
        let mut previous = engine.snapshot().state;
        for _ in 0..60 {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let sound = seed & 1 == 0;
            let length = 1 + (seed >> 8) as usize % 50;
            for _ in 0..length {
                clock.feed(&mut engine, sound, 1);
                let next = engine.snapshot().state;
                assert!(
                    allowed.contains(&(previous, next)),
                    "illegal transition {previous:?} -> {next:?}"
                );
                previous = next;
            }
        }
    }

    /// Source that produces silence slowly; used for thread-level tests.
    struct ZeroSource;

    impl AudioSource for ZeroSource {
        fn open(&mut self, _config: &AudioConfig) -> Result<()> {
            Ok(())
        }

        fn read_chunk(&mut self, chunk: &mut [f32]) -> Result<usize> {
            chunk.iter_mut().for_each(|s| *s = 0.0);
            thread::sleep(Duration::from_millis(5));
            Ok(chunk.len())
        }
    }

    struct BrokenSource;

    impl AudioSource for BrokenSource {
        fn open(&mut self, _config: &AudioConfig) -> Result<()> {
            Err(crate::HeadbangError::AudioSource("no such device".into()))
        }

        fn read_chunk(&mut self, _chunk: &mut [f32]) -> Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn start_is_idempotent_and_stop_joins_quickly() {
        let mut detector = BeatDetector::new(test_audio(), DetectorConfig::default());
        detector.start(Box::new(ZeroSource));
        detector.start(Box::new(ZeroSource));
        thread::sleep(Duration::from_millis(50));

        assert!(detector.is_running());
        assert_eq!(detector.snapshot().state, DetectorState::Waiting);
        assert!(!detector.can_dance());

        let before = Instant::now();
        detector.stop();
        assert!(before.elapsed() < JOIN_TIMEOUT);
        assert!(!detector.is_running());
    }

    #[test]
    fn open_failure_leaves_the_system_running() {
        let mut detector = BeatDetector::new(test_audio(), DetectorConfig::default());
        detector.start(Box::new(BrokenSource));
        thread::sleep(Duration::from_millis(50));

        assert!(!detector.is_running());
        assert_eq!(detector.snapshot(), DetectorSnapshot::default());
        detector.stop();
    }
}
