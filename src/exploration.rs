//! The exploration policy loop.
//!
//! Robots alternate between two moves. After driving they report a
//! [`MovementKind::Measure`], and we take a range reading, fold it into the
//! map, make sure they have somewhere to go and turn them towards it. After
//! turning they report a [`MovementKind::Advance`], and we send them one cell
//! along their path. Each report is handled on its own thread; handlers for
//! different robots only meet at the grid.
//!
//! Locks are always taken in the order robot state, grid, random number
//! generator.

use crate::{
    config::{ExplorationConfig, FleetConfig},
    fleet::{Fleet, Member, RobotState},
    grid::{GridSnapshot, OccupancyGrid},
    link::{Motion, RobotLink},
    planner,
    reports::{MovementKind, MovementReport, Rendezvous},
    Cell,
};
use log::{debug, info, trace, warn};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    sync::{
        mpsc::{Receiver, RecvTimeoutError},
        Mutex, MutexGuard,
    },
    thread,
    time::{Duration, Instant},
};

/// One exploration run: the map being built and everything needed to drive
/// the fleet while building it.
pub struct ExplorationSession<'a, L: RobotLink + ?Sized> {
    fleet: &'a Fleet,
    link: &'a L,
    config: ExplorationConfig,
    cell_cm: f64,
    grid: Mutex<OccupancyGrid>,
    rng: Mutex<StdRng>,
}

impl<'a, L: RobotLink + ?Sized> ExplorationSession<'a, L> {
    /// A session with an empty map. Frontier sampling is seeded from the
    /// config, or from the OS if no seed is configured.
    pub fn new(config: &FleetConfig, fleet: &'a Fleet, link: &'a L) -> Self {
        let rng = match config.exploration.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(config, fleet, link, rng)
    }

    /// A session drawing its frontiers from `rng`.
    pub fn with_rng(config: &FleetConfig, fleet: &'a Fleet, link: &'a L, rng: StdRng) -> Self {
        Self {
            fleet,
            link,
            config: config.exploration.clone(),
            cell_cm: config.mapping.cell_cm,
            grid: Mutex::new(OccupancyGrid::new(&config.mapping)),
            rng: Mutex::new(rng),
        }
    }

    /// Locks the map.
    pub fn grid(&self) -> MutexGuard<'_, OccupancyGrid> {
        self.grid.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A copy of the map as it stands.
    pub fn snapshot(&self) -> GridSnapshot {
        self.grid().snapshot()
    }

    /// Drives the fleet until `duration` has passed, a message arrives on
    /// `stop`, or every report producer has gone away. Handlers still
    /// running at that point are waited for, then the final map is
    /// returned.
    pub fn run(
        &self,
        movements: &mut Rendezvous<MovementReport>,
        duration: Duration,
        stop: &Receiver<()>,
    ) -> GridSnapshot {
        let start = Instant::now();
        let deadline = start + duration;
        let tick = Duration::from_millis(self.config.tick_ms.max(1));
        info!(
            "exploring with {} robots for {:.1} s",
            self.fleet.len(),
            duration.as_secs_f64()
        );

        thread::scope(|scope| {
            let mut in_flight = Vec::new();
            for member in self.fleet.members() {
                let kickoff = MovementReport::kickoff(member.robot.id);
                in_flight.push(scope.spawn(move || self.handle(&kickoff)));
            }

            let mut next_tick = start + tick;
            let mut handled = 0usize;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    info!("exploration time is up");
                    break;
                }
                if stop.try_recv().is_ok() {
                    info!("exploration stopped");
                    break;
                }
                if now >= next_tick {
                    in_flight.retain(|h: &thread::ScopedJoinHandle<'_, ()>| !h.is_finished());
                    debug!(
                        "{:.0} s in: {} reports handled, {} in flight, {} cells mapped",
                        (now - start).as_secs_f64(),
                        handled,
                        in_flight.len(),
                        self.grid().len()
                    );
                    next_tick += tick;
                }

                let wait = deadline.min(next_tick).saturating_duration_since(now);
                match movements.next_timeout(wait) {
                    Ok(report) => {
                        handled += 1;
                        in_flight.push(scope.spawn(move || self.handle(&report)));
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        warn!("movement queue closed, ending exploration early");
                        break;
                    }
                }
            }
            if !in_flight.is_empty() {
                debug!("waiting on handlers still in flight");
            }
        });

        let snapshot = self.snapshot();
        info!("final map has {} cells", snapshot.cells.len());
        snapshot
    }

    /// Handles one movement report from start to finish, including sending
    /// the robot its next command.
    pub fn handle(&self, report: &MovementReport) {
        let Some(member) = self.fleet.member(report.id) else {
            warn!("movement report from unknown robot {}", report.id);
            return;
        };

        let motion = {
            let mut state = member.state();
            if report.rotation.is_finite() && report.travel().is_finite() {
                state.pose.advance(report.rotation, report.travel());
            } else {
                warn!(
                    "ignoring malformed movement from robot {} (rotation {}, travel {})",
                    report.id,
                    report.rotation,
                    report.travel()
                );
            }
            trace!("robot {} now at {}", report.id, state.pose);
            match report.kind {
                MovementKind::Measure => self.measure(&member, &mut state),
                MovementKind::Advance => self.advance(&mut state),
            }
        };

        debug!("robot {} <- {}", report.id, motion);
        if let Err(error) = self.link.motion(&member.robot, motion) {
            warn!("robot {} did not take {}: {}", report.id, motion, error);
        }
    }

    /// Takes a reading, maps it, replans if needed and turns the robot
    /// towards its next cell.
    fn measure(&self, member: &Member, state: &mut RobotState) -> Motion {
        let distance = self.link.range(&member.robot).unwrap_or_else(|error| {
            warn!("range reading from robot {} failed: {}", member.robot.id, error);
            0.0
        });

        let mut grid = self.grid();
        // zero means no echo, or a failed reading already logged above
        if distance != 0.0 {
            match grid.integrate_range(&state.pose, distance) {
                Some(hit) => trace!("robot {} sees an obstacle in {}", member.robot.id, hit),
                None => warn!(
                    "discarding range reading {} cm from robot {}",
                    distance, member.robot.id
                ),
            }
        }
        let here = grid.cell_of(state.pose.position());
        if state.path.len() < 2 {
            let candidates = {
                let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                planner::sample_candidates(
                    &mut *rng,
                    here,
                    self.config.frontier_samples,
                    self.config.frontier_radius,
                )
            };
            state.path = planner::replan(&grid, &candidates, here).unwrap_or_default();
            if state.path.is_empty() {
                debug!("robot {} has nowhere to go from {}", member.robot.id, here);
            }
        }
        drop(grid);

        let turn = match self.next_heading(state, here) {
            Some(heading) => planner::rotation_delta(state.pose.rotation, heading),
            None => self.config.scan_turn_deg,
        };
        Motion::Rotate(turn.round() as i32)
    }

    /// Sends the robot to the centre of its next cell, dropping the cell it
    /// is leaving from the path.
    fn advance(&self, state: &mut RobotState) -> Motion {
        let Some(&next) = state.path.iter().rev().nth(1) else {
            // nothing to drive to; an empty move brings the robot back for a
            // fresh reading
            return Motion::Forward(0);
        };
        let target = self.center_of(next);
        state.path.pop();
        Motion::Forward(state.pose.position().abs_dist(&target).round() as u32)
    }

    /// Compass heading towards the next path cell. The path's tail stands in
    /// for where the robot is; if odometry has drifted so far that the next
    /// cell is no longer adjacent to it, the true bearing is used instead.
    fn next_heading(&self, state: &RobotState, here: Cell) -> Option<f64> {
        let (&tail, rest) = state.path.split_last()?;
        let &next = rest.last()?;
        planner::compass_heading(tail, next)
            .or_else(|| planner::compass_heading(here, next))
            .or_else(|| {
                let target = self.center_of(next);
                let (dx, dy) = (target.x - state.pose.x, target.y - state.pose.y);
                Some(crate::normalize_degrees(dx.atan2(dy).to_degrees()))
            })
    }

    fn center_of(&self, cell: Cell) -> crate::Point {
        crate::Point {
            x: (cell.x as f64 + 0.5) * self.cell_cm,
            y: (cell.y as f64 + 0.5) * self.cell_cm,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fleet::{Registration, Robot},
        link::{LinkError, ListenCommand, SpeakCommand},
        reports::report_queues,
        Pose,
    };
    use std::sync::mpsc;

    /// A robot in an empty world: every reading is the same distance and
    /// every motion is only recorded.
    struct Recorder {
        reading: Result<f64, LinkError>,
        sent: Mutex<Vec<(usize, Motion)>>,
    }

    impl Recorder {
        fn new(reading: Result<f64, LinkError>) -> Self {
            Self {
                reading,
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<(usize, Motion)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl RobotLink for Recorder {
        fn listen(&self, _: &Robot, _: ListenCommand) -> Result<String, LinkError> {
            Ok("0,0".to_string())
        }

        fn speak(&self, _: &Robot, _: SpeakCommand) -> Result<(), LinkError> {
            Ok(())
        }

        fn motion(&self, robot: &Robot, motion: Motion) -> Result<(), LinkError> {
            self.sent.lock().unwrap().push((robot.id, motion));
            Ok(())
        }

        fn range(&self, _: &Robot) -> Result<f64, LinkError> {
            self.reading.clone()
        }
    }

    fn fleet(size: usize) -> Fleet {
        let fleet = Fleet::new(size);
        for i in 0..size {
            let registration = Registration {
                clock: 0,
                address: format!("robot-{}", i),
            };
            fleet.register(&registration, 0).unwrap();
        }
        fleet
    }

    fn config() -> FleetConfig {
        let mut config = FleetConfig::default();
        config.exploration.seed = Some(5);
        config.exploration.tick_ms = 10;
        config
    }

    #[test]
    fn measure_maps_plans_and_turns() {
        let config = config();
        let fleet = fleet(2);
        let link = Recorder::new(Ok(40.0));
        let session = ExplorationSession::new(&config, &fleet, &link);

        session.handle(&MovementReport::kickoff(0));

        // the reading put an obstacle four cells north
        let grid = session.grid();
        assert!(grid.value(Cell::new(0, 4)) > 0.0);
        assert!(grid.value(Cell::new(0, 2)) < 0.0);
        drop(grid);

        let state = fleet.member(0).unwrap().state().clone();
        assert!(state.path.len() >= 2);
        assert_eq!(state.path.last(), Some(&Cell::new(0, 0)));

        let sent = link.sent();
        assert_eq!(sent.len(), 1);
        let Motion::Rotate(turn) = sent[0].1 else {
            panic!("expected a turn, got {:?}", sent[0].1);
        };
        let tail = state.path[state.path.len() - 1];
        let next = state.path[state.path.len() - 2];
        let heading = planner::compass_heading(tail, next).unwrap();
        assert_eq!(turn as f64, planner::rotation_delta(0.0, heading));
    }

    #[test]
    fn advance_steps_along_the_path() {
        let config = config();
        let fleet = fleet(1);
        let link = Recorder::new(Ok(0.0));
        let session = ExplorationSession::new(&config, &fleet, &link);
        {
            let member = fleet.member(0).unwrap();
            let mut state = member.state();
            state.pose = Pose::new(5.0, 5.0, 0.0);
            state.path = vec![Cell::new(0, 2), Cell::new(0, 1), Cell::new(0, 0)];
        }

        let mut turned = MovementReport::kickoff(0);
        turned.kind = MovementKind::Advance;
        session.handle(&turned);
        assert_eq!(link.sent(), vec![(0, Motion::Forward(10))]);
        assert_eq!(
            fleet.member(0).unwrap().state().path,
            vec![Cell::new(0, 2), Cell::new(0, 1)]
        );

        // having driven, the robot measures and is pointed on
        session.handle(&MovementReport {
            id: 0,
            start: 0.0,
            end: 10.0,
            rotation: 0.0,
            kind: MovementKind::Measure,
        });
        let pose = fleet.pose(0).unwrap();
        assert!((pose.y - 15.0).abs() < 1e-9);
        assert_eq!(link.sent()[1], (0, Motion::Rotate(0)));
    }

    #[test]
    fn empty_path_means_forward_zero() {
        let config = config();
        let fleet = fleet(1);
        let link = Recorder::new(Ok(0.0));
        let session = ExplorationSession::new(&config, &fleet, &link);
        let mut turned = MovementReport::kickoff(0);
        turned.kind = MovementKind::Advance;
        session.handle(&turned);
        assert_eq!(link.sent(), vec![(0, Motion::Forward(0))]);
    }

    #[test]
    fn failed_reading_leaves_the_map_alone() {
        let config = config();
        let fleet = fleet(1);
        let link = Recorder::new(Err(LinkError::Unreachable("timeout".to_string())));
        let session = ExplorationSession::new(&config, &fleet, &link);
        session.handle(&MovementReport::kickoff(0));
        assert!(session.grid().is_empty());
        // still told to do something
        assert_eq!(link.sent().len(), 1);
    }

    #[test]
    fn unusable_readings_are_discarded() {
        let config = config();
        for reading in [f64::INFINITY, f64::NAN, 1e6] {
            let fleet = fleet(1);
            fleet.set_pose(0, Pose::new(0.0, 0.0, 30.0));
            let link = Recorder::new(Ok(reading));
            let session = ExplorationSession::new(&config, &fleet, &link);

            session.handle(&MovementReport::kickoff(0));
            assert!(session.grid().is_empty(), "{} was mapped", reading);
            assert_eq!(link.sent().len(), 1);
        }
    }

    #[test]
    fn malformed_movement_keeps_the_pose() {
        let config = config();
        let fleet = fleet(1);
        fleet.set_pose(0, Pose::new(10.0, 20.0, 90.0));
        let link = Recorder::new(Ok(0.0));
        let session = ExplorationSession::new(&config, &fleet, &link);

        session.handle(&MovementReport {
            id: 0,
            start: 0.0,
            end: f64::INFINITY,
            rotation: 0.0,
            kind: MovementKind::Measure,
        });
        session.handle(&MovementReport {
            id: 0,
            start: 0.0,
            end: 5.0,
            rotation: f64::NAN,
            kind: MovementKind::Measure,
        });
        let pose = fleet.pose(0).unwrap();
        assert_eq!((pose.x, pose.y, pose.rotation), (10.0, 20.0, 90.0));
        assert_eq!(link.sent().len(), 2);
    }

    #[test]
    fn boxed_in_robot_scans() {
        let config = config();
        let fleet = fleet(1);
        let link = Recorder::new(Ok(0.0));
        let session = ExplorationSession::new(&config, &fleet, &link);
        {
            let mut grid = session.grid();
            for cell in Cell::new(0, 0).neighbors_8() {
                grid.set(cell, 5.0);
            }
        }
        session.handle(&MovementReport::kickoff(0));
        assert!(fleet.member(0).unwrap().state().path.is_empty());
        assert_eq!(link.sent(), vec![(0, Motion::Rotate(45))]);
    }

    #[test]
    fn run_kicks_off_and_stops() {
        let config = config();
        let fleet = fleet(2);
        let link = Recorder::new(Ok(30.0));
        let session = ExplorationSession::new(&config, &fleet, &link);
        let (tx, mut rx) = report_queues(4);
        let (stop_tx, stop_rx) = mpsc::channel();

        tx.submit_movement(MovementReport {
            id: 1,
            start: 0.0,
            end: 0.0,
            rotation: 90.0,
            kind: MovementKind::Advance,
        });
        stop_tx.send(()).unwrap();
        let snapshot = session.run(&mut rx.movements, Duration::from_secs(60), &stop_rx);

        // both kickoffs measured before the loop returned
        assert!(!snapshot.cells.is_empty());
        let kicked: Vec<usize> = link.sent().iter().map(|(id, _)| *id).collect();
        assert!(kicked.contains(&0) && kicked.contains(&1));
    }

    #[test]
    fn run_ends_at_the_deadline() {
        let config = config();
        let fleet = fleet(1);
        let link = Recorder::new(Ok(20.0));
        let session = ExplorationSession::new(&config, &fleet, &link);
        let (_tx, mut rx) = report_queues(1);
        let (_stop_tx, stop_rx) = mpsc::channel();

        let started = Instant::now();
        session.run(&mut rx.movements, Duration::from_millis(50), &stop_rx);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
