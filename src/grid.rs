//! The shared occupancy grid.
//!
//! Each cell holds the log-odds that it is occupied; zero means nothing is
//! known. A range reading from a robot to an obstacle is evidence that every
//! cell along the way is free and that the cell at the end is occupied, and
//! evidence is folded in by plain addition, which is what makes updates from
//! different robots commute.
//!
//! The map is sparse: only cells that have received evidence are stored.

use crate::{config::MappingConfig, Cell, Point, Pose};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    collections::{HashMap, HashSet},
    fmt,
    fs::File,
    io::{Read, Write},
    path::Path,
};

/// Sparse log-odds occupancy map.
#[derive(Debug, Clone, PartialEq)]
pub struct OccupancyGrid {
    cells: HashMap<Cell, f64>,
    cell_cm: f64,
    occupied_threshold: f64,
    max_range_cm: f64,
    /// Added to a cell seen as occupied; the free update is its negation.
    hit_log_odds: f64,
}

impl OccupancyGrid {
    #[allow(missing_docs)]
    pub fn new(mapping: &MappingConfig) -> Self {
        let p = mapping.hit_probability;
        Self {
            cells: HashMap::new(),
            cell_cm: mapping.cell_cm,
            occupied_threshold: mapping.occupied_threshold,
            max_range_cm: mapping.max_range_cm,
            hit_log_odds: (p / (1.0 - p)).ln(),
        }
    }

    /// Log-odds of a cell; zero if it has never been observed.
    pub fn value(&self, cell: Cell) -> f64 {
        self.cells.get(&cell).copied().unwrap_or(0.0)
    }

    /// Whether evidence about a cell, either way, is strong enough that a
    /// robot should not plan through it.
    pub fn is_impassable(&self, cell: Cell) -> bool {
        self.value(cell).abs() >= self.occupied_threshold
    }

    /// Overwrites a cell's log-odds.
    pub fn set(&mut self, cell: Cell, log_odds: f64) {
        self.cells.insert(cell, log_odds);
    }

    /// Adds one observation of `cell` being occupied.
    pub fn observe_occupied(&mut self, cell: Cell) {
        *self.cells.entry(cell).or_insert(0.0) += self.hit_log_odds;
    }

    /// Adds one observation of `cell` being free.
    pub fn observe_free(&mut self, cell: Cell) {
        *self.cells.entry(cell).or_insert(0.0) -= self.hit_log_odds;
    }

    #[allow(missing_docs)]
    pub fn occupied_threshold(&self) -> f64 {
        self.occupied_threshold
    }

    #[allow(missing_docs)]
    pub fn cell_cm(&self) -> f64 {
        self.cell_cm
    }

    /// The cell a world point falls in.
    pub fn cell_of(&self, point: Point) -> Cell {
        Cell {
            x: (point.x / self.cell_cm).floor() as i64,
            y: (point.y / self.cell_cm).floor() as i64,
        }
    }

    /// The world point at the centre of a cell.
    pub fn center_of(&self, cell: Cell) -> Point {
        Point {
            x: (cell.x as f64 + 0.5) * self.cell_cm,
            y: (cell.y as f64 + 0.5) * self.cell_cm,
        }
    }

    /// Folds in a range reading of `distance_cm` taken straight ahead from
    /// `pose`. Returns the cell the obstacle was placed in, or `None` if the
    /// reading is not a positive finite distance within the maximum range
    /// and the map was left alone.
    pub fn integrate_range(&mut self, pose: &Pose, distance_cm: f64) -> Option<Cell> {
        // also rejects NaN
        if !(distance_cm > 0.0 && distance_cm <= self.max_range_cm) {
            return None;
        }
        let from = self.cell_of(pose.position());
        let to = self.cell_of(pose.ahead(distance_cm));
        self.integrate_ray(from, to).then_some(to)
    }

    /// Marks the cells strictly between `from` and `to` free, once each, and
    /// `to` occupied. A ray too long to step through is refused, leaving the
    /// map unchanged, and `false` is returned.
    pub fn integrate_ray(&mut self, from: Cell, to: Cell) -> bool {
        if ray_steps(from, to).is_none() {
            warn!("refusing to trace a ray from {} to {}", from, to);
            return false;
        }
        let mut seen = HashSet::from([from, to]);
        for cell in ray_cells(from, to) {
            if seen.insert(cell) {
                self.observe_free(cell);
            }
        }
        self.observe_occupied(to);
        true
    }

    /// Inclusive bounding box `(min, max)` of every observed cell.
    pub fn bounds(&self) -> Option<(Cell, Cell)> {
        let mut cells = self.cells.keys();
        let first = *cells.next()?;
        Some(cells.fold((first, first), |(lo, hi), c| {
            (
                Cell::new(lo.x.min(c.x), lo.y.min(c.y)),
                Cell::new(hi.x.max(c.x), hi.y.max(c.y)),
            )
        }))
    }

    /// Number of cells holding any evidence.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// A copy of the map, sorted by cell, for reporting.
    pub fn snapshot(&self) -> GridSnapshot {
        let mut cells: Vec<(Cell, f64)> = self.cells.iter().map(|(c, v)| (*c, *v)).collect();
        cells.sort_by(|a, b| a.0.cmp(&b.0));
        GridSnapshot {
            cell_cm: self.cell_cm,
            occupied_threshold: self.occupied_threshold,
            cells,
        }
    }
}

fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Most samples a single ray may take.
const MAX_RAY_STEPS: i64 = 1 << 20;

/// Least common multiple of the non-zero deltas; 1 when both are zero.
/// `None` when that exceeds [`MAX_RAY_STEPS`].
fn step_count(dx: i64, dy: i64) -> Option<i64> {
    let steps = match (dx.checked_abs()?, dy.checked_abs()?) {
        (0, 0) => 1,
        (a, 0) => a,
        (0, b) => b,
        (a, b) => (a / gcd(a, b)).checked_mul(b)?,
    };
    (steps <= MAX_RAY_STEPS).then_some(steps)
}

/// Deltas and step count of the ray from `from` to `to`, if it is short
/// enough to trace.
fn ray_steps(from: Cell, to: Cell) -> Option<(i64, i64, i64)> {
    let dx = to.x.checked_sub(from.x)?;
    let dy = to.y.checked_sub(from.y)?;
    Some((dx, dy, step_count(dx, dy)?))
}

/// Cells sampled along the segment from `from` to `to`, `from` included and
/// `to` excluded, in steps of `1 / lcm(|dx|, |dy|)` of the segment.
/// Consecutive samples can land in the same cell. Yields nothing for a ray
/// too long to trace.
pub fn ray_cells(from: Cell, to: Cell) -> impl Iterator<Item = Cell> {
    let (dx, dy, steps) = ray_steps(from, to).unwrap_or((0, 0, 0));
    (0..steps).map(move |k| {
        let t = k as f64 / steps as f64;
        Cell {
            x: (from.x as f64 + dx as f64 * t).round() as i64,
            y: (from.y as f64 + dy as f64 * t).round() as i64,
        }
    })
}

/// A frozen copy of an [`OccupancyGrid`], as emitted when exploration ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSnapshot {
    /// Side length of a cell.
    pub cell_cm: f64,
    /// |log-odds| at or above which a cell counts as settled.
    pub occupied_threshold: f64,
    /// Every observed cell and its log-odds, sorted by cell.
    pub cells: Vec<(Cell, f64)>,
}

/// Returned when a snapshot cannot be written or read.
#[derive(Debug)]
pub enum SnapshotError {
    /// Returned when io fails when reading or writing files.
    IoError(std::io::Error),
    /// Returned when serialization fails.
    RonError(ron::Error),
    /// Returned when deserialization fails.
    RonSpannedError(ron::de::SpannedError),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            SnapshotError::IoError(error) => Cow::from(format!("io error: {}", error)),
            SnapshotError::RonError(error) => Cow::from(format!("ron error: {}", error)),
            SnapshotError::RonSpannedError(error) => {
                Cow::from(format!("ron spanning error: {}", error))
            }
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for SnapshotError {}

impl GridSnapshot {
    /// Inclusive cell bounds `(min, max)`, always containing the origin.
    pub fn bounds(&self) -> (Cell, Cell) {
        self.cells.iter().fold(
            (Cell::new(0, 0), Cell::new(0, 0)),
            |(lo, hi), (c, _)| {
                (
                    Cell::new(lo.x.min(c.x), lo.y.min(c.y)),
                    Cell::new(hi.x.max(c.x), hi.y.max(c.y)),
                )
            },
        )
    }

    /// Log-odds of a cell; zero if it was never observed.
    pub fn value(&self, cell: Cell) -> f64 {
        self.cells
            .binary_search_by(|(c, _)| c.cmp(&cell))
            .map(|i| self.cells[i].1)
            .unwrap_or(0.0)
    }

    /// Rebuilds a live grid from this snapshot.
    pub fn to_grid(&self, mapping: &MappingConfig) -> OccupancyGrid {
        let mut grid = OccupancyGrid::new(&MappingConfig {
            cell_cm: self.cell_cm,
            occupied_threshold: self.occupied_threshold,
            ..mapping.clone()
        });
        for (cell, value) in &self.cells {
            grid.set(*cell, *value);
        }
        grid
    }

    /// Write this snapshot to the path provided as RON.
    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
        let mut handle = File::create(path).map_err(SnapshotError::IoError)?;
        self.to_file(&mut handle)
    }

    /// Write this snapshot to the [Write]able object provided.
    pub fn to_file(&self, file: &mut impl Write) -> Result<(), SnapshotError> {
        let text = ron::ser::to_string(self).map_err(SnapshotError::RonError)?;
        file.write_all(text.as_bytes())
            .map_err(SnapshotError::IoError)
    }

    /// Read a snapshot from the path provided.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let mut handle = File::open(path).map_err(SnapshotError::IoError)?;
        Self::from_file(&mut handle)
    }

    /// Read a snapshot from the [Read]able object provided.
    pub fn from_file(file: &mut impl Read) -> Result<Self, SnapshotError> {
        let mut text = String::new();
        file.read_to_string(&mut text)
            .map_err(SnapshotError::IoError)?;
        ron::from_str(&text).map_err(SnapshotError::RonSpannedError)
    }
}

/// The map as a matrix of occupancy probabilities, one row per x, columns
/// by increasing y, in the `p=[ ... ; ... ];` form that pastes straight into
/// a numeric shell.
impl fmt::Display for GridSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (lo, hi) = self.bounds();
        write!(f, "p=[")?;
        for x in lo.x..=hi.x {
            if x > lo.x {
                write!(f, ";")?;
            }
            for y in lo.y..=hi.y {
                let p = 1.0 - 1.0 / (1.0 + self.value(Cell::new(x, y)).exp());
                write!(f, " {:.2}", p)?;
            }
        }
        write!(f, " ];")
    }
}
