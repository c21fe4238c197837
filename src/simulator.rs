//! An in-process fleet for the `echofleet` binary and for tests.
//!
//! Each simulated robot knows its true pose in a rectangular room with a few
//! box-shaped obstacles, keeps its own skewed clock, and answers commands the
//! way the firmware does: listen and speak produce capture reports, motions
//! produce movement reports, and range readings come from casting a ray at
//! the walls. Reports are posted from short-lived threads after a small
//! delay, as if they had come back over the network.
//!
//! Captures are recorded at one sample per millisecond, so a listen window's
//! sample count equals its length in milliseconds. Tones are placed on whole
//! samples.

use crate::{
    config::AcousticConfig,
    fleet::{Registration, Robot},
    link::{LinkError, ListenCommand, Motion, RobotLink, SpeakCommand},
    now_ms,
    reports::{CaptureReport, MovementKind, MovementReport, ReportSender},
    signal, Point, Pose, RobotId,
};
use log::{debug, trace};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    f64::consts::PI,
    sync::{Mutex, MutexGuard},
    thread,
    time::Duration,
};

/// Closest a robot will drive up to an obstacle.
const STANDOFF_CM: f64 = 5.0;

/// 12-bit microphone midpoint.
const ADC_MID: i64 = 2048;
const ADC_MAX: i64 = 4095;

/// The simulated world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Lower-left corner of the room.
    pub room_min: Point,
    /// Upper-right corner of the room.
    pub room_max: Point,
    /// Boxes inside the room, each as (lower-left, upper-right).
    pub obstacles: Vec<(Point, Point)>,
    /// Readings beyond this come back as zero, meaning no echo.
    pub max_range_cm: f64,
    /// Range readings are off by up to this much either way.
    pub range_noise_cm: f64,
    /// Peak amplitude of the tone as heard, in ADC counts.
    pub amplitude: f64,
    /// Microphone noise, up to this many ADC counts either way.
    pub sample_noise: f64,
    /// How long a report takes to come back.
    pub report_delay_ms: u64,
    /// How long a listener takes to arm its microphones.
    pub listener_setup_ms: i64,
    /// Seed for all simulated noise.
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            room_min: Point {
                x: -250.0,
                y: -150.0,
            },
            room_max: Point { x: 250.0, y: 450.0 },
            obstacles: vec![(Point { x: 100.0, y: 150.0 }, Point { x: 160.0, y: 210.0 })],
            max_range_cm: 500.0,
            range_noise_cm: 1.0,
            amplitude: 800.0,
            sample_noise: 20.0,
            report_delay_ms: 5,
            listener_setup_ms: 3,
            seed: None,
        }
    }
}

/// One simulated robot.
#[derive(Debug, Clone, PartialEq)]
struct Body {
    address: String,
    truth: Pose,
    /// Host time minus this robot's clock.
    skew_ms: i64,
}

/// A listener waiting for someone to speak.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Armed {
    listener: RobotId,
    address_index: usize,
    /// Host time the recording starts.
    start_ms: i64,
    window_ms: u32,
}

/// A fleet of simulated robots behind a [`RobotLink`].
pub struct SimulatedFleet {
    config: SimulatorConfig,
    acoustics: AcousticConfig,
    reports: ReportSender,
    bodies: Mutex<Vec<Body>>,
    armed: Mutex<Option<Armed>>,
    rng: Mutex<StdRng>,
}

impl SimulatedFleet {
    /// An empty world posting its reports to `reports`.
    pub fn new(config: SimulatorConfig, acoustics: AcousticConfig, reports: ReportSender) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            acoustics,
            reports,
            bodies: Mutex::new(Vec::new()),
            armed: Mutex::new(None),
            rng: Mutex::new(rng),
        }
    }

    /// Places a robot. `skew_ms` is how far its clock lags the host's.
    pub fn add_robot(&self, address: impl Into<String>, truth: Pose, skew_ms: i64) {
        self.bodies().push(Body {
            address: address.into(),
            truth,
            skew_ms,
        });
    }

    /// What every robot would send on startup, paired with the host time it
    /// arrives. Registering them in order gives robot ids in placement
    /// order.
    pub fn registrations(&self) -> Vec<(Registration, i64)> {
        let host = now_ms();
        self.bodies()
            .iter()
            .map(|body| {
                (
                    Registration {
                        clock: host - body.skew_ms,
                        address: body.address.clone(),
                    },
                    host,
                )
            })
            .collect()
    }

    /// Where a robot really is.
    pub fn truth(&self, address: &str) -> Option<Pose> {
        self.bodies()
            .iter()
            .find(|b| b.address == address)
            .map(|b| b.truth)
    }

    fn bodies(&self) -> MutexGuard<'_, Vec<Body>> {
        self.bodies.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn index_of(bodies: &[Body], robot: &Robot) -> Result<usize, LinkError> {
        bodies
            .iter()
            .position(|b| b.address == robot.address)
            .ok_or_else(|| LinkError::Unreachable(format!("no robot at {}", robot.address)))
    }

    fn later(&self, post: impl FnOnce(&ReportSender) + Send + 'static) {
        let reports = self.reports.clone();
        let delay = Duration::from_millis(self.config.report_delay_ms);
        thread::spawn(move || {
            thread::sleep(delay);
            post(&reports);
        });
    }

    /// Distance from `from` along `heading` to the first wall or obstacle.
    fn cast(&self, from: Point, heading: f64) -> f64 {
        let (sin, cos) = heading.to_radians().sin_cos();
        let (min, max) = (self.config.room_min, self.config.room_max);
        let exit = |p: f64, d: f64, lo: f64, hi: f64| {
            if d > 1e-12 {
                (hi - p) / d
            } else if d < -1e-12 {
                (lo - p) / d
            } else {
                f64::INFINITY
            }
        };
        let wall = exit(from.x, sin, min.x, max.x).min(exit(from.y, cos, min.y, max.y));

        self.config
            .obstacles
            .iter()
            .filter_map(|(lo, hi)| slab_entry(from, sin, cos, *lo, *hi))
            .fold(wall.max(0.0), f64::min)
    }

    /// Samples the listener would have recorded, as the hex payload.
    fn record(
        &self,
        armed: &Armed,
        listener: &Pose,
        speaker: &Pose,
        speak_start_ms: i64,
        speak_ms: u32,
    ) -> String {
        let n = armed.window_ms as usize;
        let cm_per_sample = self.acoustics.speed_of_sound * 100.0 / 1000.0;
        let half = self.acoustics.mic_spacing_cm / 2.0;
        let (sin, cos) = listener.rotation.to_radians().sin_cos();
        let mic = |side: f64| Point {
            x: listener.x + side * half * cos,
            y: listener.y - side * half * sin,
        };
        let lead = speak_start_ms - armed.start_ms;
        let tone_len = speak_ms as i64 + 1;

        let mut rng = self.rng();
        let mut channel = |side: f64| -> Vec<i64> {
            let flight = mic(side).abs_dist(&speaker.position()) / cm_per_sample;
            let arrival = lead + flight.round() as i64;
            trace!("tone reaches mic {:+} at sample {}", side, arrival);
            (0..n as i64)
                .map(|i| {
                    let k = i - arrival;
                    let tone = if (0..tone_len).contains(&k) {
                        (2.0 * PI * self.acoustics.tone_hz * k as f64 / 1000.0).sin()
                    } else {
                        0.0
                    };
                    let noise = if self.config.sample_noise > 0.0 {
                        rng.gen_range(-self.config.sample_noise..=self.config.sample_noise)
                    } else {
                        0.0
                    };
                    (ADC_MID + (self.config.amplitude * tone + noise).round() as i64)
                        .clamp(0, ADC_MAX)
                })
                .collect()
        };
        let left = channel(-1.0);
        let right = channel(1.0);
        signal::encode(&left, &right)
    }
}

/// Distance along the ray to where it enters the box, if it does.
fn slab_entry(from: Point, dx: f64, dy: f64, lo: Point, hi: Point) -> Option<f64> {
    let axis = |p: f64, d: f64, lo: f64, hi: f64| -> Option<(f64, f64)> {
        if d.abs() < 1e-12 {
            (lo..=hi).contains(&p).then_some((f64::NEG_INFINITY, f64::INFINITY))
        } else {
            let (a, b) = ((lo - p) / d, (hi - p) / d);
            Some((a.min(b), a.max(b)))
        }
    };
    let (x0, x1) = axis(from.x, dx, lo.x, hi.x)?;
    let (y0, y1) = axis(from.y, dy, lo.y, hi.y)?;
    let (enter, leave) = (x0.max(y0), x1.min(y1));
    (enter <= leave && enter >= 0.0).then_some(enter)
}

impl RobotLink for SimulatedFleet {
    fn listen(&self, robot: &Robot, command: ListenCommand) -> Result<String, LinkError> {
        let bodies = self.bodies();
        let index = Self::index_of(&bodies, robot)?;
        let host = now_ms();
        *self.armed.lock().unwrap_or_else(|e| e.into_inner()) = Some(Armed {
            listener: robot.id,
            address_index: index,
            start_ms: host + command.delay_ms,
            window_ms: command.window_ms,
        });
        let local = host - bodies[index].skew_ms;
        Ok(format!("{},{}", local, local + self.config.listener_setup_ms))
    }

    fn speak(&self, robot: &Robot, command: SpeakCommand) -> Result<(), LinkError> {
        let armed = self
            .armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| LinkError::Rejected("nobody is listening".to_string()))?;
        let (listener, speaker, listener_skew, speaker_skew) = {
            let bodies = self.bodies();
            let index = Self::index_of(&bodies, robot)?;
            let listener = &bodies[armed.address_index];
            (
                listener.truth,
                bodies[index].truth,
                listener.skew_ms,
                bodies[index].skew_ms,
            )
        };
        let speak_start = now_ms() + command.delay_ms;
        let payload = self.record(&armed, &listener, &speaker, speak_start, command.duration_ms);
        debug!(
            "robot {} spoke {} ms into robot {}'s window",
            robot.id,
            speak_start - armed.start_ms,
            armed.listener
        );

        let spoke = CaptureReport {
            id: robot.id,
            start: speak_start - speaker_skew,
            total: 0,
            payload: String::new(),
        };
        let heard = CaptureReport {
            id: armed.listener,
            start: armed.start_ms - listener_skew,
            total: armed.window_ms as i64,
            payload,
        };
        self.later(move |reports| {
            reports.submit_capture(spoke);
            reports.submit_capture(heard);
        });
        Ok(())
    }

    fn motion(&self, robot: &Robot, motion: Motion) -> Result<(), LinkError> {
        let report = {
            let mut bodies = self.bodies();
            let index = Self::index_of(&bodies, robot)?;
            let truth = bodies[index].truth;
            let (rotation, travel, kind) = match motion {
                Motion::Rotate(degrees) => (degrees as f64, 0.0, MovementKind::Advance),
                Motion::Forward(cm) => {
                    let room = self.cast(truth.position(), truth.rotation) - STANDOFF_CM;
                    (0.0, (cm as f64).min(room).max(0.0), MovementKind::Measure)
                }
                Motion::Backward(cm) => {
                    let room = self.cast(truth.position(), truth.rotation + 180.0) - STANDOFF_CM;
                    (0.0, -(cm as f64).min(room).max(0.0), MovementKind::Measure)
                }
            };
            bodies[index].truth.advance(rotation, travel);
            trace!("robot {} truly at {}", robot.id, bodies[index].truth);
            MovementReport {
                id: robot.id,
                start: 0.0,
                end: travel.abs(),
                rotation,
                kind,
            }
        };
        self.later(move |reports| reports.submit_movement(report));
        Ok(())
    }

    fn range(&self, robot: &Robot) -> Result<f64, LinkError> {
        let truth = {
            let bodies = self.bodies();
            bodies[Self::index_of(&bodies, robot)?].truth
        };
        let distance = self.cast(truth.position(), truth.rotation);
        if distance > self.config.max_range_cm {
            return Ok(0.0);
        }
        let noise = self.config.range_noise_cm;
        let jitter = if noise > 0.0 {
            self.rng().gen_range(-noise..=noise)
        } else {
            0.0
        };
        Ok((distance + jitter).max(0.0))
    }
}
