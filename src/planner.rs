//! Choosing where to go next and how to get there.
//!
//! A robot that has run out of path draws a handful of random cells around
//! itself and heads for the one the map knows least about. The route is a
//! breadth-first search over the 8-connected grid, run from the goal back to
//! the robot so that the robot's own cell ends up at the tail of the path and
//! can be popped off as it drives.

use crate::{grid::OccupancyGrid, normalize_degrees, Cell};
use log::{debug, trace};
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};

/// Draws `count` cells within `radius` of `origin` on both axes, never
/// `origin` itself.
pub fn sample_candidates<R: Rng + ?Sized>(
    rng: &mut R,
    origin: Cell,
    count: usize,
    radius: i64,
) -> Vec<Cell> {
    let radius = radius.max(1);
    let mut candidates = Vec::with_capacity(count);
    while candidates.len() < count {
        let dx = rng.gen_range(-radius..=radius);
        let dy = rng.gen_range(-radius..=radius);
        if dx == 0 && dy == 0 {
            continue;
        }
        candidates.push(Cell::new(origin.x + dx, origin.y + dy));
    }
    candidates
}

/// The candidate whose log-odds is closest to zero. Earlier candidates win
/// ties. `None` only for an empty slice.
pub fn least_certain(grid: &OccupancyGrid, candidates: &[Cell]) -> Option<Cell> {
    candidates
        .iter()
        .fold(None, |best: Option<Cell>, &cell| match best {
            Some(b) if grid.value(b).abs() <= grid.value(cell).abs() => best,
            _ => Some(cell),
        })
}

/// Shortest 8-connected route from `frontier` to `robot`, both included,
/// ordered frontier first.
///
/// Only passable cells are expanded, but the robot's cell is accepted the
/// moment it is reached whatever the map says about it. Returns `None` when
/// the robot cannot be reached, including when the frontier itself is
/// impassable.
///
/// Everything outside the observed part of the map is unknown and passable,
/// so the search never needs to stray more than one cell beyond the box
/// holding the map, the frontier and the robot. That keeps it finite when
/// the robot is walled in.
pub fn plan_path(grid: &OccupancyGrid, frontier: Cell, robot: Cell) -> Option<Vec<Cell>> {
    let (mut lo, mut hi) = grid.bounds().unwrap_or((robot, robot));
    for cell in [frontier, robot] {
        lo = Cell::new(lo.x.min(cell.x), lo.y.min(cell.y));
        hi = Cell::new(hi.x.max(cell.x), hi.y.max(cell.y));
    }
    let in_window =
        |c: &Cell| c.x >= lo.x - 1 && c.x <= hi.x + 1 && c.y >= lo.y - 1 && c.y <= hi.y + 1;

    let mut came_from: HashMap<Cell, Cell> = HashMap::new();
    let mut visited: HashSet<Cell> = HashSet::new();
    let mut queue = VecDeque::from([frontier]);
    let mut expanded = 0usize;

    while let Some(current) = queue.pop_front() {
        if current == robot {
            let mut path = vec![current];
            let mut cursor = current;
            while let Some(&prev) = came_from.get(&cursor) {
                path.push(prev);
                cursor = prev;
            }
            path.reverse();
            trace!(
                "planned {} cells from {} to {} after expanding {}",
                path.len(),
                frontier,
                robot,
                expanded
            );
            return Some(path);
        }
        if grid.is_impassable(current) || !visited.insert(current) {
            continue;
        }
        expanded += 1;
        for neighbor in current.neighbors_8() {
            if in_window(&neighbor)
                && !visited.contains(&neighbor)
                && !came_from.contains_key(&neighbor)
            {
                came_from.insert(neighbor, current);
                queue.push_back(neighbor);
            }
        }
    }
    debug!("no route from {} to {}", frontier, robot);
    None
}

/// Picks a frontier around `robot` from `candidates` and plans a route to it.
pub fn replan(grid: &OccupancyGrid, candidates: &[Cell], robot: Cell) -> Option<Vec<Cell>> {
    let frontier = least_certain(grid, candidates)?;
    debug!(
        "frontier {} (log-odds {:.2}) for robot at {}",
        frontier,
        grid.value(frontier),
        robot
    );
    plan_path(grid, frontier, robot)
}

/// Absolute heading from `from` to an adjacent cell `to`. `None` if the cells
/// are not neighbours.
pub fn compass_heading(from: Cell, to: Cell) -> Option<f64> {
    from.neighbors_8()
        .iter()
        .position(|&n| n == to)
        .map(|i| i as f64 * 45.0)
}

/// The turn, in `(-180, 180]` degrees clockwise, from heading `current` to
/// heading `target`.
pub fn rotation_delta(current: f64, target: f64) -> f64 {
    let delta = normalize_degrees(target - current);
    if delta > 180.0 {
        delta - 360.0
    } else {
        delta
    }
}
