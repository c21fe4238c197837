//! Resolving a follower's position from two listening positions.
//!
//! From one position the leader hears the follower at distance `L` on its
//! left microphone and `R` on its right. The two circles meet in two points,
//! mirror images across the microphone baseline, and one capture cannot tell
//! them apart. After the leader drives forward the mirror images move but the
//! true point does not, so of the four pairings between the two positions'
//! candidates, the closest pair is taken to be the true one and its midpoint
//! is the answer.
//!
//! ```text
//!    second     mL ---- mR        . follower?
//!                   ^
//!                   |  leader_step_cm
//!    first      mL ---- mR
//!                                 . mirror?
//! ```

use crate::{Point, Pose};

/// One listening position and what was heard from it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vantage {
    /// Where the leader stood and which way it faced.
    pub pose: Pose,
    /// Distance from the left microphone to the follower.
    pub left_cm: f64,
    /// Distance from the right microphone to the follower.
    pub right_cm: f64,
}

/// Solves the two-circle geometry for a given microphone spacing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolver {
    mic_spacing_cm: f64,
}

impl Resolver {
    #[allow(missing_docs)]
    pub fn new(mic_spacing_cm: f64) -> Self {
        Self { mic_spacing_cm }
    }

    /// Both intersection points of the microphone circles, in world
    /// coordinates: first the one ahead of the baseline, then its mirror.
    ///
    /// The solution is anchored on the circle of the larger reading, which
    /// keeps the square root real for the common case where noise makes the
    /// circles barely miss. When they miss anyway the perpendicular offset is
    /// clamped to zero, putting both candidates on the baseline.
    pub fn candidates(&self, vantage: &Vantage) -> [Point; 2] {
        let s = self.mic_spacing_cm;
        let (l, r) = (vantage.left_cm, vantage.right_cm);

        // lateral (along-baseline) coordinate, measured from the leader's
        // centre, and the anchor circle it is measured on
        let (lateral, anchor, from_anchor) = if l > r {
            let from_left = (l * l + s * s - r * r) / (2.0 * s);
            (from_left - s / 2.0, l, from_left)
        } else {
            let from_right = (r * r + s * s - l * l) / (2.0 * s);
            (s / 2.0 - from_right, r, from_right)
        };
        let forward = (anchor * anchor - from_anchor * from_anchor).max(0.0).sqrt();

        [
            to_world(&vantage.pose, lateral, forward),
            to_world(&vantage.pose, lateral, -forward),
        ]
    }

    /// Picks the most consistent pair of candidates across both vantages and
    /// returns its midpoint. Never fails; ties go to the first pairing in
    /// the order (+,+), (+,-), (-,+), (-,-).
    pub fn resolve(&self, first: &Vantage, second: &Vantage) -> Point {
        let [p0, n0] = self.candidates(first);
        let [p1, n1] = self.candidates(second);
        let pairings = [(p0, p1), (p0, n1), (n0, p1), (n0, n1)];

        let (a, b) = pairings
            .iter()
            .fold(None, |best: Option<&(Point, Point)>, pair| match best {
                Some((a, b)) if a.abs_dist(b) <= pair.0.abs_dist(&pair.1) => best,
                _ => Some(pair),
            })
            .copied()
            .unwrap_or(pairings[0]);
        a.midpoint(&b)
    }
}

/// Maps a point in the robot's frame (x to its right, y straight ahead) into
/// the world.
fn to_world(pose: &Pose, right: f64, ahead: f64) -> Point {
    let (sin, cos) = pose.rotation.to_radians().sin_cos();
    Point {
        x: pose.x + right * cos + ahead * sin,
        y: pose.y - right * sin + ahead * cos,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPACING: f64 = 10.1;

    fn heard_from(pose: Pose, target: Point) -> Vantage {
        let left_mic = to_world(&pose, -SPACING / 2.0, 0.0);
        let right_mic = to_world(&pose, SPACING / 2.0, 0.0);
        Vantage {
            pose,
            left_cm: left_mic.abs_dist(&target),
            right_cm: right_mic.abs_dist(&target),
        }
    }

    fn close(a: Point, b: Point) -> bool {
        a.abs_dist(&b) < 1e-3
    }

    #[test]
    fn candidates_are_mirror_images() {
        let resolver = Resolver::new(SPACING);
        let target = Point { x: 40.0, y: 120.0 };
        let [ahead, behind] = resolver.candidates(&heard_from(Pose::default(), target));
        assert!(close(ahead, target));
        assert!(close(behind, Point { x: 40.0, y: -120.0 }));
    }

    #[test]
    fn anchoring_on_either_microphone_agrees() {
        let resolver = Resolver::new(SPACING);
        for target in [Point { x: -75.0, y: 30.0 }, Point { x: 75.0, y: 30.0 }] {
            let [ahead, _] = resolver.candidates(&heard_from(Pose::default(), target));
            assert!(close(ahead, target));
        }
    }

    #[test]
    fn resolves_from_two_vantages() {
        let resolver = Resolver::new(SPACING);
        let target = Point { x: -60.0, y: -150.0 };
        let first = heard_from(Pose::new(10.0, 20.0, 0.0), target);
        let second = heard_from(Pose::new(10.0, 120.0, 0.0), target);
        assert!(close(resolver.resolve(&first, &second), target));
    }

    #[test]
    fn respects_leader_heading() {
        let resolver = Resolver::new(SPACING);
        let target = Point { x: 200.0, y: 35.0 };
        // facing +x, so the baseline runs north-south
        let first = heard_from(Pose::new(0.0, 0.0, 90.0), target);
        let second = heard_from(Pose::new(100.0, 0.0, 90.0), target);
        assert!(close(resolver.resolve(&first, &second), target));
    }

    #[test]
    fn coincident_candidates_return_that_point() {
        let resolver = Resolver::new(SPACING);
        // on the first baseline: both first candidates are the target itself
        let target = Point { x: 80.0, y: 0.0 };
        let first = heard_from(Pose::default(), target);
        let [a, b] = resolver.candidates(&first);
        assert!(close(a, b));
        let second = heard_from(Pose::new(0.0, 100.0, 0.0), target);
        assert!(close(resolver.resolve(&first, &second), target));
    }

    #[test]
    fn degenerate_readings_still_give_a_point() {
        let resolver = Resolver::new(SPACING);
        let zero = Vantage {
            pose: Pose::default(),
            left_cm: 0.0,
            right_cm: 0.0,
        };
        let moved = Vantage {
            pose: Pose::new(0.0, 100.0, 0.0),
            ..zero
        };
        let point = resolver.resolve(&zero, &moved);
        assert!(point.x.is_finite() && point.y.is_finite());
        assert_eq!(point, resolver.resolve(&zero, &moved));
        // both vantages collapse onto their own baseline; the first pairing wins
        assert!(close(point, Point { x: 0.0, y: 50.0 }));
    }
}
