use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::MotionConfig;
use crate::detector::BeatDetector;
use crate::lamp::LampChannel;

/// Target pose for one actuator update: head pitch in degrees, antenna pair
/// and body yaw in radians. Fire-and-forget; the rig acknowledges nothing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActuatorCommand {
    pub head_pitch_deg: f32,
    pub antennas: [f32; 2],
    pub body_yaw: f32,
}

impl ActuatorCommand {
    /// The rest pose the rig returns to when the dance ends.
    pub fn neutral() -> Self {
        Self {
            head_pitch_deg: 0.0,
            antennas: [0.0, 0.0],
            body_yaw: 0.0,
        }
    }
}

/// The rig the motion loop drives. Implementations must not block; slow
/// transports belong behind their own channel, like the lamp's.
pub trait Actuator {
    fn set_target(&mut self, command: &ActuatorCommand);
}

/// Both phases of one beat, derived fresh from the current BPM every
/// iteration so mid-dance tempo changes land on the next half-beat boundary.
#[derive(Debug, Clone, Copy)]
pub struct MotionCycle {
    pub half_beat: Duration,
    pub down: ActuatorCommand,
    pub up: ActuatorCommand,
}

/// Computes the accent and recovery poses for `beat_index`. Even beats swing
/// left, odd beats right; the recovery phase mirrors the accent phase.
pub fn plan_cycle(config: &MotionConfig, bpm: f32, beat_index: u64) -> MotionCycle {
    let beat_duration = 60.0 / bpm;
    let half_beat = Duration::from_secs_f32(beat_duration / 2.0);

    let side = if beat_index % 2 == 0 { 1.0 } else { -1.0 };
    let antenna = config.antenna_deflection_deg.to_radians() * side;
    let yaw = config.body_yaw_deg.to_radians() * side;

    let down = ActuatorCommand {
        head_pitch_deg: config.head_down_pitch_deg,
        antennas: [antenna, antenna],
        body_yaw: yaw,
    };
    let up = ActuatorCommand {
        head_pitch_deg: config.head_up_pitch_deg,
        antennas: [-antenna, -antenna],
        body_yaw: -yaw,
    };
    MotionCycle {
        half_beat,
        down,
        up,
    }
}

/// Runs the beat-synchronized dance until `budget` elapses or `stop` flips.
///
/// While the detector does not allow dancing the loop idle-polls; once a
/// tempo is published it alternates accent and recovery poses every
/// half-beat, flashing the lamp on the accents. Whatever ends the loop, the
/// rig is returned to neutral and the lamp turned off exactly once.
pub fn run(
    detector: &BeatDetector,
    lamp: &LampChannel,
    actuator: &mut dyn Actuator,
    config: &MotionConfig,
    budget: Duration,
    stop: &AtomicBool,
) {
    info!("dance loop started, waiting for music");
    let started = Instant::now();
    let idle = config.idle_poll();
    let mut beat_index: u64 = 0;

    while started.elapsed() < budget && !stop.load(Ordering::SeqCst) {
        let Some(bpm) = detector.snapshot().dance_bpm() else {
            thread::sleep(idle);
            continue;
        };
        let cycle = plan_cycle(config, bpm, beat_index);
        debug!(bpm, beat_index, "beat");

        actuator.set_target(&cycle.down);
        lamp.rainbow();
        thread::sleep(cycle.half_beat);

        actuator.set_target(&cycle.up);
        lamp.off();
        thread::sleep(cycle.half_beat);

        beat_index += 1;
    }

    info!("dance loop finished, returning to neutral");
    actuator.set_target(&ActuatorCommand::neutral());
    lamp.off();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ClickTrackSource;
    use crate::config::{AudioConfig, DetectorConfig, LampConfig};
    use crate::detector::BeatDetector;
    use crate::lamp::{LampChannel, LampTransport, CMD_OFF, CMD_RAINBOW};
    use crate::Result;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingActuator {
        commands: Vec<ActuatorCommand>,
    }

    impl Actuator for RecordingActuator {
        fn set_target(&mut self, command: &ActuatorCommand) {
            self.commands.push(*command);
        }
    }

    struct RecordingTransport {
        writes: Arc<Mutex<Vec<String>>>,
    }

    impl LampTransport for RecordingTransport {
        fn connect(&mut self, _config: &LampConfig) -> Result<bool> {
            Ok(true)
        }

        fn write(&mut self, command: &str) -> Result<()> {
            self.writes.lock().unwrap().push(command.to_string());
            Ok(())
        }

        fn disconnect(&mut self) {}
    }

    #[test]
    fn half_beat_is_thirty_over_bpm() {
        let config = MotionConfig::default();
        for bpm in [41.0, 60.0, 120.0, 249.0] {
            let cycle = plan_cycle(&config, bpm, 0);
            let expected = 30.0 / bpm;
            assert!((cycle.half_beat.as_secs_f32() - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn parity_alternates_every_beat() {
        let config = MotionConfig::default();
        let mut last_sign = 0.0;
        for beat_index in 0..6 {
            let cycle = plan_cycle(&config, 120.0, beat_index);
            let sign = cycle.down.body_yaw.signum();
            if beat_index > 0 {
                assert_eq!(sign, -last_sign, "beat {beat_index} did not flip");
            }
            last_sign = sign;
            // The recovery phase always mirrors the accent phase.
            assert_eq!(cycle.up.body_yaw, -cycle.down.body_yaw);
            assert_eq!(cycle.up.antennas[0], -cycle.down.antennas[0]);
        }
    }

    #[test]
    fn an_idle_run_still_cleans_up_exactly_once() {
        let detector = BeatDetector::new(AudioConfig::default(), DetectorConfig::default());
        let lamp = LampChannel::new(LampConfig::default());
        let mut actuator = RecordingActuator::default();
        let stop = AtomicBool::new(false);

        run(
            &detector,
            &lamp,
            &mut actuator,
            &MotionConfig::default(),
            Duration::from_millis(30),
            &stop,
        );

        assert_eq!(actuator.commands, vec![ActuatorCommand::neutral()]);
        assert_eq!(lamp.pending_command(), Some(CMD_OFF.to_string()));
    }

    #[test]
    fn a_pre_set_stop_flag_skips_straight_to_cleanup() {
        let detector = BeatDetector::new(AudioConfig::default(), DetectorConfig::default());
        let lamp = LampChannel::new(LampConfig::default());
        let mut actuator = RecordingActuator::default();
        let stop = AtomicBool::new(true);

        run(
            &detector,
            &lamp,
            &mut actuator,
            &MotionConfig::default(),
            Duration::from_secs(5),
            &stop,
        );

        assert_eq!(actuator.commands, vec![ActuatorCommand::neutral()]);
    }

    /// End-to-end: click track in, poses and lamp flashes out, one neutral
    /// command after the stop signal.
    #[test]
    fn dances_to_a_click_track_and_stops_cleanly() {
        let audio = AudioConfig::default();
        let detector_config = DetectorConfig {
            listen_duration_secs: 2.0,
            ..DetectorConfig::default()
        };

        let mut detector = BeatDetector::new(audio, detector_config);
        detector.start(Box::new(ClickTrackSource::new(120.0)));

        let writes = Arc::new(Mutex::new(Vec::new()));
        let mut lamp = LampChannel::new(LampConfig::default());
        lamp.start(Box::new(RecordingTransport {
            writes: writes.clone(),
        }));

        let stop = Arc::new(AtomicBool::new(false));
        let trigger = stop.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_secs(3));
            trigger.store(true, Ordering::SeqCst);
        });

        let mut actuator = RecordingActuator::default();
        run(
            &detector,
            &lamp,
            &mut actuator,
            &MotionConfig::default(),
            Duration::from_secs(15),
            &stop,
        );

        stopper.join().unwrap();
        lamp.stop();
        detector.stop();

        let neutral = ActuatorCommand::neutral();
        let neutral_count = actuator
            .commands
            .iter()
            .filter(|&&c| c == neutral)
            .count();
        assert!(actuator.commands.len() > 2, "never danced");
        assert_eq!(neutral_count, 1);
        assert_eq!(actuator.commands.last(), Some(&neutral));

        let writes = writes.lock().unwrap();
        assert!(writes.contains(&CMD_RAINBOW.to_string()));
        assert_eq!(writes.last(), Some(&CMD_OFF.to_string()));
    }
}
