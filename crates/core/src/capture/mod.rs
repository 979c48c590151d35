use std::thread;
use std::time::Duration;

use crate::config::AudioConfig;
use crate::{HeadbangError, Result};

/// Blocking source of mono `f32` audio chunks.
///
/// `open` runs on the detector thread, so a failing device never takes the
/// caller down with it. Implementations must release their device handles in
/// `Drop` as well as `close`, because the detector thread can unwind while a
/// chunk is being processed.
pub trait AudioSource: Send {
    /// Acquires the underlying device or generator.
    fn open(&mut self, config: &AudioConfig) -> Result<()>;

    /// Fills `chunk` with the next block of samples, blocking until enough
    /// are available. Returns the number of samples written; `Ok(0)` means
    /// the stream has ended.
    fn read_chunk(&mut self, chunk: &mut [f32]) -> Result<usize>;

    /// Releases the device. The default implementation relies on `Drop`.
    fn close(&mut self) {}
}

const CARRIER_HZ: f64 = 220.0;
const CARRIER_AMP: f32 = 0.05;
const CLICK_HZ: f64 = 1760.0;
const CLICK_AMP: f32 = 0.85;
const CLICK_DECAY_SECS: f32 = 0.03;

/// Renders a synthetic click track into `out`, starting at absolute sample
/// `offset`. A decaying high click marks every beat, riding on a quiet
/// carrier tone so that every chunk stays above the silence threshold; the
/// carrier itself contributes no onsets.
pub fn click_track(bpm: f32, sample_rate: u32, offset: u64, out: &mut [f32]) {
    let rate = f64::from(sample_rate.max(1));
    let period = 60.0 / f64::from(bpm);
    let tau = std::f64::consts::TAU;
    for (i, slot) in out.iter_mut().enumerate() {
        let t = (offset + i as u64) as f64 / rate;
        let mut sample = CARRIER_AMP * (tau * CARRIER_HZ * t).sin() as f32;
        let beat_phase = (t % period) as f32;
        if beat_phase < CLICK_DECAY_SECS {
            let envelope = 1.0 - beat_phase / CLICK_DECAY_SECS;
            sample += CLICK_AMP * envelope * (tau * CLICK_HZ * t).sin() as f32;
        }
        *slot = sample;
    }
}

/// Synthetic [`AudioSource`] producing a click track at a fixed tempo, paced
/// at the nominal chunk rate like a real capture device. Useful for demo
/// runs on machines without audio hardware.
#[derive(Debug)]
pub struct ClickTrackSource {
    bpm: f32,
    sample_rate: u32,
    chunk_duration: Duration,
    position: u64,
}

impl ClickTrackSource {
    pub fn new(bpm: f32) -> Self {
        Self {
            bpm,
            sample_rate: 0,
            chunk_duration: Duration::ZERO,
            position: 0,
        }
    }
}

impl AudioSource for ClickTrackSource {
    fn open(&mut self, config: &AudioConfig) -> Result<()> {
        self.sample_rate = config.sample_rate;
        self.chunk_duration = config.chunk_duration();
        self.position = 0;
        Ok(())
    }

    fn read_chunk(&mut self, chunk: &mut [f32]) -> Result<usize> {
        if self.sample_rate == 0 {
            return Err(HeadbangError::AudioSource("source not opened".into()));
        }
        click_track(self.bpm, self.sample_rate, self.position, chunk);
        self.position += chunk.len() as u64;
        thread::sleep(self.chunk_duration);
        Ok(chunk.len())
    }
}

#[cfg(feature = "live-input")]
pub use self::cpal_source::CpalSource;

#[cfg(feature = "live-input")]
mod cpal_source {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::JoinHandle;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, StreamConfig};
    use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
    use tracing::warn;

    use super::*;

    const FRAME_QUEUE_DEPTH: usize = 16;
    const READ_TIMEOUT: Duration = Duration::from_millis(500);
    const STOP_POLL: Duration = Duration::from_millis(50);

    /// Microphone input via cpal. The stream lives on a dedicated thread
    /// because cpal stream handles are not `Send`; the source handle only
    /// carries the sample channel and a stop flag, so it can move onto the
    /// detector thread freely.
    pub struct CpalSource {
        frames: Option<Receiver<Vec<f32>>>,
        stop: Arc<AtomicBool>,
        worker: Option<JoinHandle<()>>,
        pending: Vec<f32>,
    }

    impl CpalSource {
        pub fn new() -> Self {
            Self {
                frames: None,
                stop: Arc::new(AtomicBool::new(false)),
                worker: None,
                pending: Vec::new(),
            }
        }
    }

    impl Default for CpalSource {
        fn default() -> Self {
            Self::new()
        }
    }

    impl AudioSource for CpalSource {
        fn open(&mut self, config: &AudioConfig) -> Result<()> {
            self.close();
            self.stop = Arc::new(AtomicBool::new(false));

            let (init_tx, init_rx) = bounded::<Result<()>>(1);
            let (frames_tx, frames_rx) = bounded::<Vec<f32>>(FRAME_QUEUE_DEPTH);
            let stop = self.stop.clone();
            let sample_rate = config.sample_rate;
            let worker =
                std::thread::spawn(move || capture_thread(sample_rate, frames_tx, init_tx, stop));

            init_rx.recv().map_err(|_| {
                HeadbangError::AudioSource("capture thread exited during setup".into())
            })??;
            self.frames = Some(frames_rx);
            self.worker = Some(worker);
            Ok(())
        }

        fn read_chunk(&mut self, chunk: &mut [f32]) -> Result<usize> {
            let frames = self
                .frames
                .as_ref()
                .ok_or_else(|| HeadbangError::AudioSource("source not opened".into()))?;
            while self.pending.len() < chunk.len() {
                match frames.recv_timeout(READ_TIMEOUT) {
                    Ok(block) => self.pending.extend_from_slice(&block),
                    Err(RecvTimeoutError::Timeout) => {
                        return Err(HeadbangError::AudioSource(
                            "no samples from capture stream".into(),
                        ))
                    }
                    Err(RecvTimeoutError::Disconnected) => return Ok(0),
                }
            }
            chunk.copy_from_slice(&self.pending[..chunk.len()]);
            self.pending.drain(..chunk.len());
            Ok(chunk.len())
        }

        fn close(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            self.frames = None;
            self.pending.clear();
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
    }

    impl Drop for CpalSource {
        fn drop(&mut self) {
            self.close();
        }
    }

    /// Owns the cpal stream for its whole lifetime; parks until `stop` flips
    /// so the stream handle never has to cross a thread boundary.
    fn capture_thread(
        sample_rate: u32,
        frames: Sender<Vec<f32>>,
        init: Sender<Result<()>>,
        stop: Arc<AtomicBool>,
    ) {
        let stream = match build_stream(sample_rate, frames) {
            Ok(stream) => stream,
            Err(err) => {
                let _ = init.send(Err(err));
                return;
            }
        };
        if let Err(err) = stream.play() {
            let _ = init.send(Err(audio_err(err)));
            return;
        }
        let _ = init.send(Ok(()));
        while !stop.load(Ordering::SeqCst) {
            std::thread::sleep(STOP_POLL);
        }
        drop(stream);
    }

    fn build_stream(sample_rate: u32, frames: Sender<Vec<f32>>) -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| HeadbangError::AudioSource("no default input device".into()))?;
        let supported = device.default_input_config().map_err(audio_err)?;
        let channels = supported.channels() as usize;
        let config = StreamConfig {
            channels: supported.channels(),
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let err_fn = |err: cpal::StreamError| warn!(%err, "capture stream error");

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let mono: Vec<f32> = data
                            .chunks_exact(channels)
                            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                            .collect();
                        let _ = frames.try_send(mono);
                    },
                    err_fn,
                    None,
                )
                .map_err(audio_err)?,
            SampleFormat::I16 => device
                .build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let mono: Vec<f32> = data
                            .chunks_exact(channels)
                            .map(|frame| {
                                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                                (sum as f32 / channels as f32) / i16::MAX as f32
                            })
                            .collect();
                        let _ = frames.try_send(mono);
                    },
                    err_fn,
                    None,
                )
                .map_err(audio_err)?,
            SampleFormat::U16 => device
                .build_input_stream(
                    &config,
                    move |data: &[u16], _: &cpal::InputCallbackInfo| {
                        let half = u16::MAX as f32 / 2.0;
                        let mono: Vec<f32> = data
                            .chunks_exact(channels)
                            .map(|frame| {
                                let sum: u32 = frame.iter().map(|&s| s as u32).sum();
                                ((sum / channels as u32) as f32 - half) / half
                            })
                            .collect();
                        let _ = frames.try_send(mono);
                    },
                    err_fn,
                    None,
                )
                .map_err(audio_err)?,
            format => {
                return Err(HeadbangError::AudioSource(format!(
                    "unsupported sample format: {format}"
                )))
            }
        };
        Ok(stream)
    }

    fn audio_err(err: impl std::fmt::Display) -> HeadbangError {
        HeadbangError::AudioSource(err.to_string())
    }
}
