//! EchoFleet coordinates a small fleet of mobile robots that have no
//! absolute positioning hardware. The robots first locate themselves
//! relative to a leader robot by acoustic time-of-flight ranging: the leader
//! listens with two microphones while another robot plays a tone, and the
//! arrival time of that tone at each microphone is turned into a distance.
//! Two such captures from two leader positions resolve the follower's
//! position.
//!
//! Once localized, the fleet explores. Every robot reports its movements and
//! range readings back to this host, which folds the readings into a shared
//! log-odds occupancy grid, picks uncertain frontier cells to visit, plans a
//! path to them with a breadth-first search, and sends the next movement
//! command.
//!
//! The transport that carries commands and reports to and from the robots
//! lives behind the [`link::RobotLink`] trait; [`simulator::SimulatedFleet`]
//! is an in-process implementation used by the `echofleet` binary and the
//! tests.

#![warn(missing_docs)]
pub mod args;
pub mod capture_writer;
pub mod config;
pub mod exploration;
pub mod fleet;
pub mod grid;
pub mod link;
pub mod localization;
pub mod mission;
pub mod multilateration;
pub mod planner;
pub mod ranging;
pub mod reports;
pub mod signal;
pub mod simulator;

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::{SystemTime, UNIX_EPOCH};

/// Robots are identified by the order in which they registered.
pub type RobotId = usize;

/// Robot 0 is the reference every other robot is localized against.
pub const LEADER: RobotId = 0;

/// A position in the plane, in centimeters.
#[derive(Debug, PartialEq, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Point {
    #[allow(missing_docs)]
    pub x: f64,
    #[allow(missing_docs)]
    pub y: f64,
}

impl Point {
    /// Euclidean distance between two points.
    pub fn abs_dist(&self, other: &Self) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    /// The point halfway between `self` and `other`.
    pub fn midpoint(&self, other: &Self) -> Point {
        Point {
            x: (self.x + other.x) / 2.0,
            y: (self.y + other.y) / 2.0,
        }
    }
}

impl Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.1}, {:.1})", self.x, self.y)
    }
}

/// An integer cell of the occupancy grid.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cell {
    #[allow(missing_docs)]
    pub x: i64,
    #[allow(missing_docs)]
    pub y: i64,
}

impl Cell {
    /// Shorthand constructor.
    pub fn new(x: i64, y: i64) -> Self {
        Cell { x, y }
    }

    /// The eight surrounding cells, clockwise from north. The neighbour at
    /// index `i` lies at compass heading `45 * i` degrees.
    pub fn neighbors_8(&self) -> [Cell; 8] {
        [
            Cell::new(self.x, self.y + 1),     // N
            Cell::new(self.x + 1, self.y + 1), // NE
            Cell::new(self.x + 1, self.y),     // E
            Cell::new(self.x + 1, self.y - 1), // SE
            Cell::new(self.x, self.y - 1),     // S
            Cell::new(self.x - 1, self.y - 1), // SW
            Cell::new(self.x - 1, self.y),     // W
            Cell::new(self.x - 1, self.y + 1), // NW
        ]
    }
}

impl Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.x, self.y)
    }
}

/// Where a robot is and which way it faces.
///
/// Rotation is in degrees, 0 facing +y and growing clockwise, so a robot at
/// 90 degrees drives along +x.
#[derive(Debug, PartialEq, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Pose {
    #[allow(missing_docs)]
    pub x: f64,
    #[allow(missing_docs)]
    pub y: f64,
    #[allow(missing_docs)]
    pub rotation: f64,
}

impl Pose {
    #[allow(missing_docs)]
    pub fn new(x: f64, y: f64, rotation: f64) -> Self {
        Pose {
            x,
            y,
            rotation: normalize_degrees(rotation),
        }
    }

    #[allow(missing_docs)]
    pub fn position(&self) -> Point {
        Point {
            x: self.x,
            y: self.y,
        }
    }

    /// Turn by `degrees` and then travel `distance` centimeters along the new
    /// heading.
    pub fn advance(&mut self, degrees: f64, distance: f64) {
        self.rotation = normalize_degrees(self.rotation + degrees);
        let heading = self.rotation.to_radians();
        self.x += distance * heading.sin();
        self.y += distance * heading.cos();
    }

    /// The point `distance` centimeters straight ahead.
    pub fn ahead(&self, distance: f64) -> Point {
        let heading = self.rotation.to_radians();
        Point {
            x: self.x + distance * heading.sin(),
            y: self.y + distance * heading.cos(),
        }
    }
}

impl Display for Pose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.1}, {:.1}, {:.0}°)", self.x, self.y, self.rotation)
    }
}

/// Folds any angle into `[0, 360)`.
pub fn normalize_degrees(degrees: f64) -> f64 {
    let folded = degrees.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if folded >= 360.0 {
        0.0
    } else {
        folded
    }
}

/// Milliseconds since the unix epoch on the host clock. This is the leader
/// time base that robot timestamps are aligned to.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_wraps() {
        assert_eq!(normalize_degrees(405.0), 45.0);
        assert_eq!(normalize_degrees(-90.0), 270.0);
        assert_eq!(Pose::new(0.0, 0.0, 720.0).rotation, 0.0);
    }

    #[test]
    fn advance_follows_heading() {
        let mut pose = Pose::default();
        pose.advance(90.0, 10.0);
        assert!((pose.x - 10.0).abs() < 1e-9);
        assert!(pose.y.abs() < 1e-9);

        pose.advance(90.0, 5.0);
        assert!((pose.x - 10.0).abs() < 1e-9);
        assert!((pose.y + 5.0).abs() < 1e-9);
        assert_eq!(pose.rotation, 180.0);
    }
}
