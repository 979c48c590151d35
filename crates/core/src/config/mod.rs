use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Top-level configuration structure for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub detector: DetectorConfig,
    pub lamp: LampConfig,
    pub motion: MotionConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            detector: DetectorConfig::default(),
            lamp: LampConfig::default(),
            motion: MotionConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads a configuration from a JSON file, e.g. a rig-specific tuning.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Configuration for the capture front end.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Samples per blocking read; one chunk is the unit of classification.
    pub chunk_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            chunk_size: 2048,
        }
    }
}

impl AudioConfig {
    /// Wall-clock duration of one captured chunk.
    pub fn chunk_duration(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_size as f64 / self.sample_rate.max(1) as f64)
    }
}

/// Tuning for the silence/music state machine and tempo acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Minimum time spent listening before a tempo estimate is attempted.
    pub listen_duration_secs: f32,
    /// RMS level below which a chunk counts as silence.
    pub silence_threshold: f32,
    /// Continuous silence needed before the detector gives up on the music.
    pub silence_duration_secs: f32,
    /// Estimates at or below this tempo are rejected (open interval).
    pub min_bpm: f32,
    /// Estimates at or above this tempo are rejected (open interval).
    pub max_bpm: f32,
    /// Capacity of the tempo history the published BPM is the median of.
    pub history_size: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            listen_duration_secs: 5.0,
            silence_threshold: 0.01,
            silence_duration_secs: 2.0,
            min_bpm: 40.0,
            max_bpm: 250.0,
            history_size: 5,
        }
    }
}

impl DetectorConfig {
    pub fn listen_duration(&self) -> Duration {
        Duration::from_secs_f32(self.listen_duration_secs)
    }

    pub fn silence_duration(&self) -> Duration {
        Duration::from_secs_f32(self.silence_duration_secs)
    }

    /// True when the estimate lies strictly inside the accepted tempo range.
    pub fn bpm_in_range(&self, bpm: f32) -> bool {
        bpm > self.min_bpm && bpm < self.max_bpm
    }

    /// Number of samples in one tempo analysis window.
    pub fn window_samples(&self, sample_rate: u32) -> usize {
        (sample_rate as f32 * self.listen_duration_secs) as usize
    }
}

/// Identity and timing of the BLE light peripheral.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LampConfig {
    /// Advertised name the lamp is discovered by.
    pub device_name: String,
    /// GATT characteristic the command strings are written to.
    pub characteristic_uuid: String,
    pub discovery_timeout_secs: f32,
    /// Send-loop wake-up interval while the command slot is empty.
    pub poll_timeout_ms: u64,
}

impl Default for LampConfig {
    fn default() -> Self {
        Self {
            device_name: "LED".to_string(),
            characteristic_uuid: "ceb5483e-36e1-2688-b7f5-ea07361d26a8".to_string(),
            discovery_timeout_secs: 10.0,
            poll_timeout_ms: 200,
        }
    }
}

impl LampConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs_f32(self.discovery_timeout_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Pose amplitudes and pacing of the dance loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Head pitch on the accented half of the beat, in degrees.
    pub head_down_pitch_deg: f32,
    /// Head pitch on the recovery half of the beat, in degrees.
    pub head_up_pitch_deg: f32,
    /// Antenna swing amplitude, in degrees (converted to radians on the wire).
    pub antenna_deflection_deg: f32,
    /// Body yaw swing amplitude, in degrees (converted to radians on the wire).
    pub body_yaw_deg: f32,
    /// Poll interval while waiting for the detector to allow dancing.
    pub idle_poll_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            head_down_pitch_deg: 12.0,
            head_up_pitch_deg: -8.0,
            antenna_deflection_deg: 30.0,
            body_yaw_deg: 15.0,
            idle_poll_ms: 100,
        }
    }
}

impl MotionConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}
