use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use headbang_core::{
    motion, Actuator, ActuatorCommand, AppConfig, AudioSource, BeatDetector, ClickTrackSource,
    HeadbangError, LampChannel,
};
use tracing_subscriber::EnvFilter;

fn main() -> headbang_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Live { config, duration } => {
            let config = load_config(config.as_deref())?;
            tracing::info!("starting live mode");
            run_dance(config, duration, live_source()?)
        }
        Commands::Simulate {
            bpm,
            config,
            duration,
        } => {
            let config = load_config(config.as_deref())?;
            tracing::info!(bpm, "starting simulated mode");
            run_dance(config, duration, Box::new(ClickTrackSource::new(bpm)))
        }
    }
}

fn run_dance(
    config: AppConfig,
    duration_secs: u64,
    source: Box<dyn AudioSource + Send>,
) -> headbang_core::Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .map_err(|err| HeadbangError::msg(err.to_string()))?;
    }

    let mut detector = BeatDetector::new(config.audio, config.detector.clone());
    detector.start(source);

    let mut lamp = LampChannel::new(config.lamp.clone());
    match lamp_transport() {
        Some(transport) => lamp.start(transport),
        None => tracing::info!("lamp support not compiled in, continuing without light sync"),
    }

    let mut actuator = TracingActuator;
    motion::run(
        &detector,
        &lamp,
        &mut actuator,
        &config.motion,
        Duration::from_secs(duration_secs),
        &stop,
    );

    lamp.stop();
    detector.stop();
    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> headbang_core::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path),
        None => Ok(AppConfig::default()),
    }
}

#[cfg(feature = "live-input")]
fn live_source() -> headbang_core::Result<Box<dyn AudioSource + Send>> {
    Ok(Box::new(headbang_core::CpalSource::new()))
}

#[cfg(not(feature = "live-input"))]
fn live_source() -> headbang_core::Result<Box<dyn AudioSource + Send>> {
    Err(HeadbangError::msg(
        "this build has no microphone capture; rebuild with --features live-input \
         or use the simulate subcommand",
    ))
}

#[cfg(feature = "ble-lamp")]
fn lamp_transport() -> Option<Box<dyn headbang_core::LampTransport>> {
    match headbang_core::BleLampTransport::new() {
        Ok(transport) => Some(Box::new(transport)),
        Err(err) => {
            tracing::warn!(%err, "bluetooth unavailable, continuing without light sync");
            None
        }
    }
}

#[cfg(not(feature = "ble-lamp"))]
fn lamp_transport() -> Option<Box<dyn headbang_core::LampTransport>> {
    None
}

/// Stand-in for the robot rig: the actuator interface is consumed by this
/// engine, not implemented, so the demo binary just narrates the poses.
struct TracingActuator;

impl Actuator for TracingActuator {
    fn set_target(&mut self, command: &ActuatorCommand) {
        tracing::debug!(
            head_pitch_deg = command.head_pitch_deg,
            antenna = command.antennas[0],
            body_yaw = command.body_yaw,
            "pose"
        );
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Beat-synchronized robot dance engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Listen to the microphone and dance to whatever is playing.
    Live {
        /// Optional JSON configuration overriding the built-in tuning.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// How long to keep dancing, in seconds.
        #[arg(short, long, default_value_t = 3000)]
        duration: u64,
    },
    /// Dance to a synthetic click track; needs no audio hardware.
    Simulate {
        /// Tempo of the synthetic click track.
        #[arg(short, long, default_value_t = 120.0)]
        bpm: f32,
        /// Optional JSON configuration overriding the built-in tuning.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// How long to keep dancing, in seconds.
        #[arg(short, long, default_value_t = 60)]
        duration: u64,
    },
}
