//! Core library for the Headbang audio-to-motion synchronization engine.
//!
//! Three components cooperate around one shared tempo snapshot: the
//! [`detector::BeatDetector`] listens to a live audio stream and publishes a
//! `(state, bpm)` pair, the [`lamp::LampChannel`] relays at most one pending
//! command to a BLE light on its own thread, and [`motion::run`] drives the
//! actuator and the lamp in half-beat lock-step with the published tempo.
//! Each component owns its own thread and fails soft: a missing microphone,
//! an absent lamp, or a bad tempo estimate degrade the system instead of
//! stopping it.

pub mod capture;
pub mod config;
pub mod detector;
pub mod error;
pub mod lamp;
pub mod motion;
pub mod tempo;

pub use capture::{click_track, AudioSource, ClickTrackSource};
#[cfg(feature = "live-input")]
pub use capture::CpalSource;
pub use config::{AppConfig, AudioConfig, DetectorConfig, LampConfig, MotionConfig};
pub use detector::{BeatDetector, DetectorEngine, DetectorSnapshot, DetectorState};
pub use error::{HeadbangError, Result};
#[cfg(feature = "ble-lamp")]
pub use lamp::BleLampTransport;
pub use lamp::{LampChannel, LampTransport, CMD_OFF, CMD_RAINBOW};
pub use motion::{plan_cycle, Actuator, ActuatorCommand, MotionCycle};
pub use tempo::{TempoEstimator, TempoHistory};
