//! The entry points a transport drives: registering robots and starting the
//! two long-running jobs.
//!
//! Triggers check their arguments and return at once; the job itself runs
//! on its own thread and hands back its result through a join handle. Only
//! one job runs at a time, since both need the report queues to themselves.

use crate::{
    config::{ConfigError, FleetConfig},
    exploration::ExplorationSession,
    fleet::{Fleet, Registration, RegistryError},
    grid::GridSnapshot,
    link::RobotLink,
    localization::{LocalizationError, Localizer},
    now_ms,
    reports::{report_queues, CaptureReport, MovementReport, Rendezvous, ReportReceivers, ReportSender},
    Point, RobotId,
};
use log::{info, warn};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Sender},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// Why a trigger was refused. Nothing has changed when one of these comes
/// back.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerError {
    /// Localization needs the leader and at least one follower.
    TooFewRobots(usize),
    /// More robots were asked for than the fleet can ever hold.
    ExceedsFleet {
        #[allow(missing_docs)]
        requested: usize,
        #[allow(missing_docs)]
        capacity: usize,
    },
    /// More robots were asked for than have registered so far.
    NotRegistered {
        #[allow(missing_docs)]
        requested: usize,
        #[allow(missing_docs)]
        registered: usize,
    },
    /// Exploration needs a finite, non-negative duration in seconds.
    BadDuration(f64),
    /// There is nobody to explore with.
    EmptyFleet,
    /// Another localization or exploration run is in progress.
    Busy,
}

impl fmt::Display for TriggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerError::TooFewRobots(n) => {
                write!(f, "need at least 2 robots to localize, got {}", n)
            }
            TriggerError::ExceedsFleet {
                requested,
                capacity,
            } => write!(
                f,
                "asked for {} robots but the fleet holds {}",
                requested, capacity
            ),
            TriggerError::NotRegistered {
                requested,
                registered,
            } => write!(
                f,
                "asked for {} robots but only {} have registered",
                requested, registered
            ),
            TriggerError::BadDuration(secs) => write!(f, "invalid duration {} s", secs),
            TriggerError::EmptyFleet => write!(f, "no robots have registered"),
            TriggerError::Busy => write!(f, "a run is already in progress"),
        }
    }
}

impl std::error::Error for TriggerError {}

struct Shared<L> {
    config: FleetConfig,
    fleet: Fleet,
    link: L,
    captures: Mutex<Rendezvous<CaptureReport>>,
    movements: Mutex<Rendezvous<MovementReport>>,
    busy: AtomicBool,
}

/// Clears the busy flag when a run ends, however it ends.
struct RunGuard<L>(Arc<Shared<L>>);

impl<L> Drop for RunGuard<L> {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
    }
}

/// A running exploration.
#[derive(Debug)]
pub struct ExplorationHandle {
    stop: Sender<()>,
    thread: JoinHandle<GridSnapshot>,
}

impl ExplorationHandle {
    /// Asks the loop to finish early. Handlers already running still
    /// complete.
    pub fn stop(&self) {
        // the loop may already have ended on its own
        let _ = self.stop.send(());
    }

    /// Waits for the loop to end and returns the final map.
    pub fn join(self) -> thread::Result<GridSnapshot> {
        self.thread.join()
    }

    /// Whether the loop has ended.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// A fleet, the link to it, and the queues its reports arrive on.
pub struct Mission<L: RobotLink + 'static> {
    shared: Arc<Shared<L>>,
}

impl<L: RobotLink + 'static> Mission<L> {
    /// A mission with fresh report queues. The returned sender is where the
    /// transport posts robot reports. Fails if the config does not validate.
    pub fn new(config: FleetConfig, link: L) -> Result<(Self, ReportSender), ConfigError> {
        let (sender, receivers) = report_queues(config.effective_queue_depth());
        Ok((Self::with_queues(config, link, receivers)?, sender))
    }

    /// A mission reading reports from queues made elsewhere, for when the
    /// link itself needs the sending end.
    pub fn with_queues(
        config: FleetConfig,
        link: L,
        receivers: ReportReceivers,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let fleet = Fleet::new(config.fleet_size);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                fleet,
                link,
                captures: Mutex::new(receivers.captures),
                movements: Mutex::new(receivers.movements),
                busy: AtomicBool::new(false),
            }),
        })
    }

    #[allow(missing_docs)]
    pub fn config(&self) -> &FleetConfig {
        &self.shared.config
    }

    #[allow(missing_docs)]
    pub fn fleet(&self) -> &Fleet {
        &self.shared.fleet
    }

    #[allow(missing_docs)]
    pub fn link(&self) -> &L {
        &self.shared.link
    }

    /// Registers a robot, stamping the registration with the host clock now.
    pub fn register(&self, registration: &Registration) -> Result<RobotId, RegistryError> {
        self.register_at(registration, now_ms())
    }

    /// Registers a robot whose registration arrived at `received_at_ms`.
    pub fn register_at(
        &self,
        registration: &Registration,
        received_at_ms: i64,
    ) -> Result<RobotId, RegistryError> {
        self.shared.fleet.register(registration, received_at_ms)
    }

    fn claim(&self) -> Result<RunGuard<L>, TriggerError> {
        self.shared
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| TriggerError::Busy)?;
        Ok(RunGuard(Arc::clone(&self.shared)))
    }

    /// Starts localizing robots `1..count` against robot 0.
    pub fn start_localization(
        &self,
        count: usize,
    ) -> Result<JoinHandle<Result<Vec<(RobotId, Point)>, LocalizationError>>, TriggerError> {
        let fleet = &self.shared.fleet;
        if count < 2 {
            return Err(TriggerError::TooFewRobots(count));
        }
        if count > fleet.capacity() {
            return Err(TriggerError::ExceedsFleet {
                requested: count,
                capacity: fleet.capacity(),
            });
        }
        if count > fleet.len() {
            return Err(TriggerError::NotRegistered {
                requested: count,
                registered: fleet.len(),
            });
        }
        let guard = self.claim()?;

        Ok(thread::spawn(move || {
            let shared = &guard.0;
            let mut captures = shared.captures.lock().unwrap_or_else(|e| e.into_inner());
            let mut movements = shared.movements.lock().unwrap_or_else(|e| e.into_inner());
            let result = Localizer::new(
                &shared.config,
                &shared.fleet,
                &shared.link,
                &mut captures,
                &mut movements,
            )
            .run(count);
            if let Err(error) = &result {
                warn!("localization abandoned: {}", error);
            }
            result
        }))
    }

    /// Starts exploring for `secs` seconds.
    pub fn start_exploration(&self, secs: f64) -> Result<ExplorationHandle, TriggerError> {
        if !secs.is_finite() || secs < 0.0 {
            return Err(TriggerError::BadDuration(secs));
        }
        if self.shared.fleet.is_empty() {
            return Err(TriggerError::EmptyFleet);
        }
        let guard = self.claim()?;
        if !self.shared.fleet.is_localized() {
            warn!("exploring before localization; robots start from their current poses");
        }

        let (stop, stop_rx) = mpsc::channel();
        let thread = thread::spawn(move || {
            let shared = &guard.0;
            let mut movements = shared.movements.lock().unwrap_or_else(|e| e.into_inner());
            let stale = movements.drain();
            if stale > 0 {
                info!("discarded {} movement reports from before exploration", stale);
            }
            ExplorationSession::new(&shared.config, &shared.fleet, &shared.link).run(
                &mut movements,
                Duration::from_secs_f64(secs),
                &stop_rx,
            )
        });
        Ok(ExplorationHandle { stop, thread })
    }
}
