//! Reports the robots post back to us, and the queues that carry them from
//! the request handlers to whichever task is waiting on them.
//!
//! There are two bounded queues, one for acoustic captures and one for
//! movement reports. Producers push and return; consumers block on the
//! receiving end. Because a consumer usually waits for a *particular* robot,
//! the receiving end is wrapped in a [`Rendezvous`] that parks reports from
//! other robots until someone asks for them.

use crate::RobotId;
use log::warn;
use serde::Deserialize;
use std::{
    collections::{HashMap, VecDeque},
    sync::mpsc::{self, Receiver, RecvError, RecvTimeoutError, SyncSender, TrySendError},
    time::{Duration, Instant},
};

/// One microphone capture event, or the speaker's note that it played.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CaptureReport {
    /// The robot that sent this report.
    pub id: RobotId,
    /// When the capture (or playback) started, on the robot's clock.
    pub start: i64,
    /// How many samples per channel the listener meant to record.
    #[serde(default)]
    pub total: i64,
    /// Interleaved left/right samples as hex tokens. Empty for the speaker.
    #[serde(default)]
    pub payload: String,
}

impl CaptureReport {
    /// A report without audio comes from the robot that was speaking.
    pub fn is_speaker(&self) -> bool {
        self.payload.trim().is_empty()
    }
}

/// What a movement report asks of us next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum MovementKind {
    /// The robot finished a rotation and is ready to drive to its next cell.
    #[serde(rename = "r", alias = "advance")]
    Advance,
    /// The robot finished driving and is ready to take a range reading.
    #[serde(rename = "m", alias = "measure")]
    Measure,
}

/// One motion event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MovementReport {
    /// The robot that sent this report.
    pub id: RobotId,
    /// Odometry reading before the move.
    #[serde(default)]
    pub start: f64,
    /// Odometry reading after the move.
    #[serde(default)]
    pub end: f64,
    /// Degrees turned, clockwise positive.
    #[serde(default)]
    pub rotation: f64,
    #[allow(missing_docs)]
    pub kind: MovementKind,
}

impl MovementReport {
    /// A report that moves nothing and asks for a reading. Used to kick a
    /// robot into the exploration loop.
    pub fn kickoff(id: RobotId) -> Self {
        Self {
            id,
            start: 0.0,
            end: 0.0,
            rotation: 0.0,
            kind: MovementKind::Measure,
        }
    }

    /// Distance covered, in centimeters.
    pub fn travel(&self) -> f64 {
        (self.start - self.end).abs()
    }
}

/// Anything that names the robot it came from.
pub trait Reported {
    #[allow(missing_docs)]
    fn robot(&self) -> RobotId;
}

impl Reported for CaptureReport {
    fn robot(&self) -> RobotId {
        self.id
    }
}

impl Reported for MovementReport {
    fn robot(&self) -> RobotId {
        self.id
    }
}

/// The producing end of both queues. Cheap to clone, one per handler.
#[derive(Debug, Clone)]
pub struct ReportSender {
    captures: SyncSender<CaptureReport>,
    movements: SyncSender<MovementReport>,
}

impl ReportSender {
    /// Hands a capture report to whoever is localizing. Never blocks: if
    /// the queue is full or nobody is listening the report is dropped.
    pub fn submit_capture(&self, report: CaptureReport) {
        if let Err(error) = self.captures.try_send(report) {
            warn!("capture from robot {} dropped: {}", dropped(&error).id, error);
        }
    }

    /// Hands a movement report to whoever is driving the robots. Never
    /// blocks, like [`ReportSender::submit_capture`].
    pub fn submit_movement(&self, report: MovementReport) {
        if let Err(error) = self.movements.try_send(report) {
            warn!("movement from robot {} dropped: {}", dropped(&error).id, error);
        }
    }
}

fn dropped<T>(error: &TrySendError<T>) -> &T {
    match error {
        TrySendError::Full(report) | TrySendError::Disconnected(report) => report,
    }
}

/// The consuming ends of both queues.
#[derive(Debug)]
pub struct ReportReceivers {
    #[allow(missing_docs)]
    pub captures: Rendezvous<CaptureReport>,
    #[allow(missing_docs)]
    pub movements: Rendezvous<MovementReport>,
}

/// Creates both report queues, each holding at most `depth` reports.
pub fn report_queues(depth: usize) -> (ReportSender, ReportReceivers) {
    let (captures_tx, captures_rx) = mpsc::sync_channel(depth);
    let (movements_tx, movements_rx) = mpsc::sync_channel(depth);
    (
        ReportSender {
            captures: captures_tx,
            movements: movements_tx,
        },
        ReportReceivers {
            captures: Rendezvous::new(captures_rx),
            movements: Rendezvous::new(movements_rx),
        },
    )
}

/// A queue receiver that can wait for a specific robot's next report.
///
/// Reports from robots nobody is waiting for are parked, in arrival order,
/// and handed out first on the next matching request.
#[derive(Debug)]
pub struct Rendezvous<T: Reported> {
    rx: Receiver<T>,
    parked: HashMap<RobotId, VecDeque<T>>,
}

impl<T: Reported> Rendezvous<T> {
    #[allow(missing_docs)]
    pub fn new(rx: Receiver<T>) -> Self {
        Self {
            rx,
            parked: HashMap::new(),
        }
    }

    fn take_parked(&mut self, robot: RobotId) -> Option<T> {
        let queue = self.parked.get_mut(&robot)?;
        let report = queue.pop_front();
        if queue.is_empty() {
            self.parked.remove(&robot);
        }
        report
    }

    fn take_any_parked(&mut self) -> Option<T> {
        let robot = *self.parked.keys().min()?;
        self.take_parked(robot)
    }

    fn park(&mut self, report: T) {
        self.parked
            .entry(report.robot())
            .or_default()
            .push_back(report);
    }

    /// Blocks until `robot` reports. Errors only when every sender is gone.
    pub fn await_from(&mut self, robot: RobotId) -> Result<T, RecvError> {
        if let Some(report) = self.take_parked(robot) {
            return Ok(report);
        }
        loop {
            let report = self.rx.recv()?;
            if report.robot() == robot {
                return Ok(report);
            }
            self.park(report);
        }
    }

    /// Like [`Rendezvous::await_from`] but gives up after `timeout`.
    pub fn await_from_timeout(
        &mut self,
        robot: RobotId,
        timeout: Duration,
    ) -> Result<T, RecvTimeoutError> {
        if let Some(report) = self.take_parked(robot) {
            return Ok(report);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let report = self.rx.recv_timeout(remaining)?;
            if report.robot() == robot {
                return Ok(report);
            }
            self.park(report);
        }
    }

    /// The next report from anyone, parked reports first.
    pub fn next_timeout(&mut self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        if let Some(report) = self.take_any_parked() {
            return Ok(report);
        }
        self.rx.recv_timeout(timeout)
    }

    /// Throws away everything queued or parked. Used before a new handshake
    /// so that stale reports from an abandoned run cannot be mistaken for
    /// fresh ones.
    pub fn drain(&mut self) -> usize {
        let mut dropped: usize = self.parked.values().map(VecDeque::len).sum();
        self.parked.clear();
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn capture(id: RobotId, payload: &str) -> CaptureReport {
        CaptureReport {
            id,
            start: 0,
            total: 0,
            payload: payload.to_owned(),
        }
    }

    #[test]
    fn targeted_await_parks_other_robots() {
        let (tx, mut rx) = report_queues(4);
        tx.submit_capture(capture(1, ""));
        tx.submit_capture(capture(2, ""));
        tx.submit_capture(capture(0, "1,2"));

        let report = rx.captures.await_from(0).unwrap();
        assert_eq!(report.payload, "1,2");
        assert_eq!(rx.captures.await_from(2).unwrap().id, 2);
        assert_eq!(rx.captures.await_from(1).unwrap().id, 1);
    }

    #[test]
    fn await_blocks_until_the_robot_reports() {
        let (tx, mut rx) = report_queues(2);
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tx.submit_movement(MovementReport::kickoff(3));
            tx.submit_movement(MovementReport::kickoff(1));
        });
        let report = rx.movements.await_from(1).unwrap();
        assert_eq!(report.id, 1);
        producer.join().unwrap();
        assert_eq!(
            rx.movements.next_timeout(Duration::from_millis(10)).unwrap().id,
            3
        );
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (tx, mut rx) = report_queues(1);
        tx.submit_movement(MovementReport::kickoff(0));
        tx.submit_movement(MovementReport::kickoff(1));
        tx.submit_capture(capture(0, ""));
        tx.submit_capture(capture(1, ""));

        assert_eq!(rx.movements.await_from(0).unwrap().id, 0);
        assert!(rx.movements.next_timeout(Duration::from_millis(5)).is_err());
        assert_eq!(rx.captures.drain(), 1);

        // with the consumer gone, submitting is still harmless
        drop(rx);
        tx.submit_movement(MovementReport::kickoff(2));
    }

    #[test]
    fn timeout_when_nobody_reports() {
        let (_tx, mut rx) = report_queues(1);
        assert_eq!(
            rx.movements
                .await_from_timeout(0, Duration::from_millis(5))
                .unwrap_err(),
            RecvTimeoutError::Timeout
        );
    }

    #[test]
    fn drain_forgets_everything() {
        let (tx, mut rx) = report_queues(4);
        tx.submit_capture(capture(1, ""));
        tx.submit_capture(capture(0, ""));
        rx.captures.await_from(0).unwrap();
        tx.submit_capture(capture(2, ""));
        assert_eq!(rx.captures.drain(), 2);
        assert!(rx.captures.next_timeout(Duration::from_millis(1)).is_err());
    }

    #[test]
    fn empty_payload_marks_the_speaker() {
        assert!(capture(1, "").is_speaker());
        assert!(capture(1, "  ").is_speaker());
        assert!(!capture(0, "0a,0b").is_speaker());
    }

    #[test]
    fn travel_ignores_direction() {
        let report = MovementReport {
            id: 0,
            start: 40.0,
            end: 10.0,
            rotation: 0.0,
            kind: MovementKind::Measure,
        };
        assert_eq!(report.travel(), 30.0);
    }
}
