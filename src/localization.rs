//! The acoustic handshake that places every follower relative to the leader.
//!
//! For each follower the leader listens twice while the follower plays the
//! ranging tone: once where it stands, and once after driving forward by a
//! fixed step. Each capture gives a distance per microphone, and the two
//! vantages together pin down where the follower is. Afterwards the leader
//! backs up to roughly where it started.
//!
//! Commands go out through a [`RobotLink`]; the robots' answers arrive on the
//! report queues and are picked up with a targeted [`Rendezvous`] wait.

use crate::{
    capture_writer::CaptureWriter,
    config::FleetConfig,
    fleet::{Fleet, Robot},
    link::{ListenAck, ListenCommand, Motion, RobotLink, SpeakCommand},
    multilateration::{Resolver, Vantage},
    now_ms,
    ranging::RangingKernel,
    reports::{CaptureReport, MovementReport, Rendezvous},
    signal, Point, Pose, RobotId, LEADER,
};
use log::{debug, info, warn};
use std::{fmt, sync::mpsc::RecvError, thread, time::Duration};

/// Why a localization run stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalizationError {
    /// A robot the run needs has not registered.
    UnknownRobot(RobotId),
    /// Every report producer has gone away, so no report can ever arrive.
    QueueClosed,
}

impl fmt::Display for LocalizationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalizationError::UnknownRobot(id) => write!(f, "robot {} is not registered", id),
            LocalizationError::QueueClosed => write!(f, "report queue closed"),
        }
    }
}

impl std::error::Error for LocalizationError {}

impl From<RecvError> for LocalizationError {
    fn from(_: RecvError) -> Self {
        LocalizationError::QueueClosed
    }
}

/// The two capture reports of one acoustic trial, by role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trial {
    /// The report carrying audio.
    pub listener: CaptureReport,
    /// The report from the robot that played the tone.
    pub speaker: CaptureReport,
}

impl Trial {
    /// Assigns roles by content rather than by who was asked to do what:
    /// if the supposed listener sent no audio but the supposed speaker did,
    /// the two are swapped.
    pub fn classify(listener: CaptureReport, speaker: CaptureReport) -> Self {
        if listener.is_speaker() && !speaker.is_speaker() {
            warn!(
                "robot {} sent audio while robot {} did not; swapping roles",
                speaker.id, listener.id
            );
            Trial {
                listener: speaker,
                speaker: listener,
            }
        } else {
            Trial { listener, speaker }
        }
    }

    /// Stand-in for a trial whose commands never reached the robots.
    fn silent(listener: RobotId, speaker: RobotId) -> Self {
        let empty = |id| CaptureReport {
            id,
            start: 0,
            total: 0,
            payload: String::new(),
        };
        Trial {
            listener: empty(listener),
            speaker: empty(speaker),
        }
    }
}

/// Index into the listener's capture at which the speaker started, from
/// the two reports' start times on the aligned clock.
///
/// `samples` is how many samples per channel actually decoded. The listener
/// reports how many it meant to record in `total`; if that is zero there is
/// no time base and the offset is taken as zero.
pub fn speaker_offset(
    listener: &Robot,
    speaker: &Robot,
    trial: &Trial,
    samples: usize,
) -> i64 {
    if trial.listener.total <= 0 {
        warn!(
            "robot {} reported no sample total; assuming the tone started at once",
            listener.id
        );
        return 0;
    }
    let lead_ms = speaker.align(trial.speaker.start) - listener.align(trial.listener.start);
    (lead_ms as f64 * samples as f64 / trial.listener.total as f64).round() as i64
}

/// One localization run, borrowing everything it needs from the mission.
pub struct Localizer<'a, L: RobotLink + ?Sized> {
    config: &'a FleetConfig,
    fleet: &'a Fleet,
    link: &'a L,
    captures: &'a mut Rendezvous<CaptureReport>,
    movements: &'a mut Rendezvous<MovementReport>,
    kernel: RangingKernel,
    resolver: Resolver,
    recorder: Option<CaptureWriter>,
}

impl<'a, L: RobotLink + ?Sized> Localizer<'a, L> {
    #[allow(missing_docs)]
    pub fn new(
        config: &'a FleetConfig,
        fleet: &'a Fleet,
        link: &'a L,
        captures: &'a mut Rendezvous<CaptureReport>,
        movements: &'a mut Rendezvous<MovementReport>,
    ) -> Self {
        Self {
            config,
            fleet,
            link,
            captures,
            movements,
            kernel: RangingKernel::new(&config.acoustics),
            resolver: Resolver::new(config.acoustics.mic_spacing_cm),
            recorder: config
                .capture_dir
                .as_ref()
                .map(|dir| CaptureWriter::new(dir, config.acoustics.listen_ms)),
        }
    }

    /// Localizes robots `1..count` against the leader, one at a time, and
    /// marks the fleet localized. Returns where each follower was placed.
    pub fn run(&mut self, count: usize) -> Result<Vec<(RobotId, Point)>, LocalizationError> {
        info!("localizing {} robots", count);
        let mut placed = Vec::with_capacity(count.saturating_sub(1));
        for follower in 1..count {
            let position = self.localize_follower(follower)?;
            info!("robot {} is at {}", follower, position);
            placed.push((follower, position));
        }
        self.fleet.mark_localized();
        Ok(placed)
    }

    /// Runs both trials for one follower, commits its pose and dead-reckons
    /// the leader back.
    pub fn localize_follower(&mut self, follower: RobotId) -> Result<Point, LocalizationError> {
        let leader = self
            .fleet
            .robot(LEADER)
            .ok_or(LocalizationError::UnknownRobot(LEADER))?;
        let speaker = self
            .fleet
            .robot(follower)
            .ok_or(LocalizationError::UnknownRobot(follower))?;
        let step = self.config.localization.leader_step_cm;
        let start = self.fleet.pose(LEADER).unwrap_or_default();

        let first = self.listen_and_speak(&leader, &speaker)?;
        let forward = self.move_leader(&leader, Motion::Forward(step))?;
        thread::sleep(Duration::from_millis(self.config.localization.settle_ms));
        let second = self.listen_and_speak(&leader, &speaker)?;
        let back = self.move_leader(&leader, Motion::Backward(step))?;

        let mut moved = start;
        moved.advance(0.0, forward.travel());
        let (l0, r0) = self.ranges(&first, follower, 0);
        let (l1, r1) = self.ranges(&second, follower, 1);
        debug!(
            "robot {}: first vantage L={:.1} R={:.1}, second L={:.1} R={:.1}",
            follower, l0, r0, l1, r1
        );

        let position = self.resolver.resolve(
            &Vantage {
                pose: start,
                left_cm: l0,
                right_cm: r0,
            },
            &Vantage {
                pose: moved,
                left_cm: l1,
                right_cm: r1,
            },
        );
        self.fleet
            .set_pose(follower, Pose::new(position.x, position.y, 0.0));

        let mut returned = start;
        returned.advance(0.0, forward.travel() - back.travel());
        self.fleet.set_pose(LEADER, returned);
        Ok(position)
    }

    /// One acoustic trial: arm the listener, cue the speaker, then wait for
    /// both of them to report.
    ///
    /// If either command cannot be delivered the trial is abandoned and a
    /// silent one is returned, which later ranges to zero.
    pub fn listen_and_speak(
        &mut self,
        listener: &Robot,
        speaker: &Robot,
    ) -> Result<Trial, LocalizationError> {
        let stale = self.captures.drain();
        if stale > 0 {
            warn!("discarded {} stale capture reports", stale);
        }
        let acoustics = &self.config.acoustics;
        let listen = ListenCommand {
            window_ms: acoustics.listen_ms,
            delay_ms: acoustics.start_delay_ms,
        };
        let speak = SpeakCommand {
            duration_ms: acoustics.speak_ms,
            delay_ms: acoustics.start_delay_ms + acoustics.speaker_lag_ms,
        };

        // the listener goes first since it takes longer to get ready
        let sent = now_ms();
        let ack = match self.link.listen(listener, listen) {
            Ok(ack) => ack,
            Err(error) => {
                warn!("listen command to robot {} failed: {}", listener.id, error);
                return Ok(Trial::silent(listener.id, speaker.id));
            }
        };
        let answered = now_ms();
        match ack.parse::<ListenAck>() {
            Ok(ack) => debug!(
                "robot {} armed in {} ms, link flight ~{} ms",
                listener.id,
                ack.setup_ms(),
                ack.flight_ms(sent, answered)
            ),
            Err(error) => warn!(
                "ignoring unreadable listen ack {:?} from robot {}: {:?}",
                ack, listener.id, error.code
            ),
        }
        if let Err(error) = self.link.speak(speaker, speak) {
            warn!("speak command to robot {} failed: {}", speaker.id, error);
            return Ok(Trial::silent(listener.id, speaker.id));
        }

        let heard = self.captures.await_from(listener.id)?;
        let spoke = self.captures.await_from(speaker.id)?;
        Ok(Trial::classify(heard, spoke))
    }

    fn move_leader(
        &mut self,
        leader: &Robot,
        motion: Motion,
    ) -> Result<MovementReport, LocalizationError> {
        if let Err(error) = self.link.motion(leader, motion) {
            warn!("leader did not take {:?}: {}", motion, error);
            return Ok(MovementReport::kickoff(leader.id));
        }
        Ok(self.movements.await_from(leader.id)?)
    }

    /// Left and right distances from one trial. Anything that cannot be
    /// ranged counts as zero.
    fn ranges(&self, trial: &Trial, follower: RobotId, vantage: usize) -> (f64, f64) {
        let Some(capture) = signal::condition(&trial.listener.payload) else {
            warn!("no audio at vantage {} for robot {}", vantage, follower);
            return (0.0, 0.0);
        };
        if let Some(recorder) = &self.recorder {
            match recorder.write(follower, vantage, &capture) {
                Ok(path) => debug!("wrote capture to {}", path.display()),
                Err(error) => warn!("could not write capture: {}", error),
            }
        }

        let offset = match (
            self.fleet.robot(trial.listener.id),
            self.fleet.robot(trial.speaker.id),
        ) {
            (Some(listener), Some(speaker)) => {
                speaker_offset(&listener, &speaker, trial, capture.len())
            }
            _ => {
                warn!("trial names an unregistered robot; assuming no offset");
                0
            }
        };
        let range = |channel: &[f64], side: &str| match self.kernel.range(channel, offset) {
            Ok(estimate) => {
                if estimate.distance_cm < 0.0 {
                    warn!(
                        "{} channel heard robot {} before it spoke (lag {}, offset {})",
                        side, follower, estimate.lag, offset
                    );
                }
                estimate.distance_cm
            }
            Err(error) => {
                warn!("{} channel of robot {}: {}", side, follower, error);
                0.0
            }
        };
        (range(&capture.left, "left"), range(&capture.right, "right"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fleet::Registration,
        link::LinkError,
        reports::{report_queues, MovementKind, ReportSender},
    };
    use std::sync::Mutex;

    fn report(id: RobotId, start: i64, total: i64, payload: &str) -> CaptureReport {
        CaptureReport {
            id,
            start,
            total,
            payload: payload.to_string(),
        }
    }

    /// Two robots with clock offsets 0 and 50 ms.
    fn fleet() -> Fleet {
        let fleet = Fleet::new(2);
        let leader = Registration {
            clock: 7000,
            address: "10.0.0.1".to_string(),
        };
        let follower = Registration {
            clock: 7000,
            address: "10.0.0.2".to_string(),
        };
        fleet.register(&leader, 7000).unwrap();
        fleet.register(&follower, 7050).unwrap();
        fleet
    }

    #[test]
    fn listener_is_the_report_with_audio() {
        let fleet = fleet();
        let audio = vec!["800"; 1000].join(",");
        let listen = report(0, 1000, 500, &audio);
        let speak = report(1, 1020, 0, "");

        // arrival order must not matter
        for (first, second) in [(listen.clone(), speak.clone()), (speak, listen)] {
            let trial = Trial::classify(first, second);
            assert_eq!(trial.listener.id, 0);
            assert_eq!(trial.speaker.id, 1);

            let listener = fleet.robot(trial.listener.id).unwrap();
            let speaker = fleet.robot(trial.speaker.id).unwrap();
            let offset = speaker_offset(&listener, &speaker, &trial, 500);
            assert!(offset >= 0);
            assert_eq!(offset, 70);
        }
    }

    #[test]
    fn offset_scales_with_decoded_length() {
        let fleet = fleet();
        let trial = Trial {
            listener: report(0, 1000, 500, "1,1"),
            speaker: report(1, 1020, 0, ""),
        };
        let (l, s) = (fleet.robot(0).unwrap(), fleet.robot(1).unwrap());
        // half the samples decoded, so half the index
        assert_eq!(speaker_offset(&l, &s, &trial, 250), 35);

        let no_total = Trial {
            listener: report(0, 1000, 0, "1,1"),
            ..trial
        };
        assert_eq!(speaker_offset(&l, &s, &no_total, 250), 0);
    }

    /// Answers every command at once, posting reports straight onto the
    /// queues. Every listener capture is the same recording.
    struct Scripted {
        reports: ReportSender,
        commands: Mutex<Vec<String>>,
        capture: String,
    }

    impl RobotLink for Scripted {
        fn listen(&self, robot: &Robot, command: ListenCommand) -> Result<String, LinkError> {
            self.commands.lock().unwrap().push(command.to_string());
            self.reports
                .submit_capture(report(robot.id, 1000, 500, &self.capture));
            Ok("100,120".to_string())
        }

        fn speak(&self, robot: &Robot, command: SpeakCommand) -> Result<(), LinkError> {
            self.commands.lock().unwrap().push(command.to_string());
            // clocks differ by 50 ms, so this lands 10 samples in
            self.reports.submit_capture(report(robot.id, 960, 0, ""));
            Ok(())
        }

        fn motion(&self, robot: &Robot, motion: Motion) -> Result<(), LinkError> {
            self.commands.lock().unwrap().push(motion.to_string());
            self.reports.submit_movement(MovementReport {
                id: robot.id,
                start: 0.0,
                end: 100.0,
                rotation: 0.0,
                kind: MovementKind::Measure,
            });
            Ok(())
        }

        fn range(&self, _: &Robot) -> Result<f64, LinkError> {
            Err(LinkError::Unreachable("no sonar".to_string()))
        }
    }

    #[test]
    fn full_handshake_commits_poses() {
        let config = FleetConfig {
            localization: crate::config::LocalizationConfig {
                leader_step_cm: 100,
                settle_ms: 0,
            },
            ..FleetConfig::default()
        };
        let fleet = fleet();
        let (tx, mut rx) = report_queues(4);

        let kernel = RangingKernel::new(&config.acoustics);
        let tone = kernel.reference_tone(500);
        let mut samples = vec![2048i64; 500];
        for (i, v) in tone.iter().enumerate() {
            samples[20 + i] = 2048 + (1000.0 * v).round() as i64;
        }
        let link = Scripted {
            reports: tx,
            commands: Mutex::new(Vec::new()),
            capture: signal::encode(&samples, &samples),
        };

        let mut localizer = Localizer::new(
            &config,
            &fleet,
            &link,
            &mut rx.captures,
            &mut rx.movements,
        );
        let placed = localizer.run(2).unwrap();
        assert_eq!(placed.len(), 1);
        assert!(fleet.is_localized());

        assert_eq!(
            *link.commands.lock().unwrap(),
            vec!["l,500,500", "s,125,510", "f,100", "l,500,500", "s,125,510", "b,100"]
        );

        // both microphones hear the tone 10 samples after it was played, so
        // the follower sits 343 cm away on the leader's centre line
        let (id, at) = placed[0];
        assert_eq!(id, 1);
        assert!(at.x.abs() < 1.0, "{}", at);
        assert_eq!(fleet.pose(1).unwrap().rotation, 0.0);

        // forward and back cancel out
        let leader = fleet.pose(LEADER).unwrap();
        assert!(leader.x.abs() < 1e-9 && leader.y.abs() < 1e-9);
    }

    #[test]
    fn missing_leader_is_reported() {
        let config = FleetConfig::default();
        let fleet = Fleet::new(2);
        let (tx, mut rx) = report_queues(2);
        let link = Scripted {
            reports: tx,
            commands: Mutex::new(Vec::new()),
            capture: String::new(),
        };
        let mut localizer = Localizer::new(
            &config,
            &fleet,
            &link,
            &mut rx.captures,
            &mut rx.movements,
        );
        assert_eq!(
            localizer.localize_follower(1),
            Err(LocalizationError::UnknownRobot(LEADER))
        );
        assert!(!fleet.is_localized());
    }
}
