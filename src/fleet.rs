//! Registration bookkeeping and per-robot state.
//!
//! A robot registers once, telling us its local clock and the address we can
//! reach it at. From then on it is known by the integer id it was handed; the
//! address and clock offset never change. What does change, the pose and the
//! planned path, sits behind a mutex per robot so that one robot's handler
//! never waits on another's.

use crate::{Cell, Pose, RobotId};
use log::info;
use serde::Deserialize;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, RwLock,
    },
};

/// What a robot sends when it first comes online.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Registration {
    /// The robot's local clock, in milliseconds.
    pub clock: i64,
    /// Where commands for this robot should be sent.
    pub address: String,
}

/// The immutable facts about a registered robot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Robot {
    #[allow(missing_docs)]
    pub id: RobotId,
    #[allow(missing_docs)]
    pub address: String,
    /// Add this to a timestamp from the robot to get host time.
    pub clock_offset_ms: i64,
}

impl Robot {
    /// Converts a robot-local timestamp into host time.
    pub fn align(&self, local_ms: i64) -> i64 {
        local_ms + self.clock_offset_ms
    }
}

/// The mutable half of a robot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RobotState {
    #[allow(missing_docs)]
    pub pose: Pose,
    /// Cells from the frontier goal back to the robot; the robot's own cell
    /// is last.
    pub path: Vec<Cell>,
}

/// A registered robot together with its state.
#[derive(Debug)]
pub struct Member {
    #[allow(missing_docs)]
    pub robot: Robot,
    state: Mutex<RobotState>,
}

impl Member {
    /// Locks this robot's pose and path.
    pub fn state(&self) -> MutexGuard<'_, RobotState> {
        // a handler that panicked mid-update leaves a usable pose behind
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Returned when registration is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The fleet already has as many robots as it was sized for.
    FleetFull(usize),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::FleetFull(size) => write!(f, "fleet is full ({} robots)", size),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Every robot that has registered, in id order.
#[derive(Debug)]
pub struct Fleet {
    capacity: usize,
    members: RwLock<Vec<Arc<Member>>>,
    localized: AtomicBool,
}

impl Fleet {
    /// An empty fleet that will accept at most `capacity` robots.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            members: RwLock::new(Vec::with_capacity(capacity)),
            localized: AtomicBool::new(false),
        }
    }

    /// Registers a robot, or returns the id it already has if its address is
    /// known. `received_at_ms` is the host time the registration arrived,
    /// which fixes the robot's clock offset.
    pub fn register(
        &self,
        registration: &Registration,
        received_at_ms: i64,
    ) -> Result<RobotId, RegistryError> {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = members
            .iter()
            .find(|m| m.robot.address == registration.address)
        {
            return Ok(existing.robot.id);
        }
        if members.len() >= self.capacity {
            return Err(RegistryError::FleetFull(self.capacity));
        }

        let robot = Robot {
            id: members.len(),
            address: registration.address.clone(),
            clock_offset_ms: received_at_ms - registration.clock,
        };
        info!(
            "registered {} as robot {} (clock offset {} ms)",
            robot.address, robot.id, robot.clock_offset_ms
        );
        let id = robot.id;
        members.push(Arc::new(Member {
            robot,
            state: Mutex::new(RobotState::default()),
        }));
        Ok(id)
    }

    #[allow(missing_docs)]
    pub fn member(&self, id: RobotId) -> Option<Arc<Member>> {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    #[allow(missing_docs)]
    pub fn robot(&self, id: RobotId) -> Option<Robot> {
        self.member(id).map(|m| m.robot.clone())
    }

    /// Every registered robot, in id order.
    pub fn members(&self) -> Vec<Arc<Member>> {
        self.members.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// How many robots have registered.
    pub fn len(&self) -> usize {
        self.members.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many robots this fleet was sized for.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current pose of a robot, if it is registered.
    pub fn pose(&self, id: RobotId) -> Option<Pose> {
        self.member(id).map(|m| m.state().pose)
    }

    /// Overwrites a robot's pose.
    pub fn set_pose(&self, id: RobotId, pose: Pose) {
        if let Some(member) = self.member(id) {
            member.state().pose = pose;
        }
    }

    /// Whether a localization run has completed.
    pub fn is_localized(&self) -> bool {
        self.localized.load(Ordering::Acquire)
    }

    pub(crate) fn mark_localized(&self) {
        self.localized.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(clock: i64, address: &str) -> Registration {
        Registration {
            clock,
            address: address.to_owned(),
        }
    }

    #[test]
    fn ids_follow_registration_order() {
        let fleet = Fleet::new(3);
        assert_eq!(fleet.register(&registration(1000, "10.0.0.2"), 1000), Ok(0));
        assert_eq!(fleet.register(&registration(950, "10.0.0.3"), 1000), Ok(1));

        assert_eq!(fleet.robot(0).unwrap().clock_offset_ms, 0);
        assert_eq!(fleet.robot(1).unwrap().clock_offset_ms, 50);
        assert_eq!(fleet.robot(1).unwrap().align(1020), 1070);
    }

    #[test]
    fn reregistering_keeps_the_first_offset() {
        let fleet = Fleet::new(2);
        fleet.register(&registration(900, "10.0.0.2"), 1000).unwrap();
        assert_eq!(fleet.register(&registration(0, "10.0.0.2"), 5000), Ok(0));
        assert_eq!(fleet.len(), 1);
        assert_eq!(fleet.robot(0).unwrap().clock_offset_ms, 100);
    }

    #[test]
    fn full_fleet_refuses() {
        let fleet = Fleet::new(1);
        fleet.register(&registration(0, "a"), 0).unwrap();
        assert_eq!(
            fleet.register(&registration(0, "b"), 0),
            Err(RegistryError::FleetFull(1))
        );
    }

    #[test]
    fn poses_are_per_robot() {
        let fleet = Fleet::new(2);
        fleet.register(&registration(0, "a"), 0).unwrap();
        fleet.register(&registration(0, "b"), 0).unwrap();
        fleet.set_pose(1, Pose::new(3.0, 4.0, 90.0));
        assert_eq!(fleet.pose(0), Some(Pose::default()));
        assert_eq!(fleet.pose(1), Some(Pose::new(3.0, 4.0, 90.0)));
        assert_eq!(fleet.pose(2), None);
    }
}
