//! Simulated time for the net scheduler.
//!
//! Time is a continuous quantity (seconds as `f64`) with a total
//! ordering, so it can key the scheduler's priority queue. Time
//! advances only when the scheduler dispatches events; an optional
//! [`Pacing`] maps wall-clock progress onto simulated time for
//! real-time runs and for the real-mode transceiver clock.

use std::time::{Duration, Instant};

/// A point in simulated time, in seconds.
///
/// `NaN` is not an admissible value; constructors debug-assert it
/// away so that the total ordering below is a genuine `Ord`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct SimTime(f64);

impl SimTime {
    /// The zero-point of simulated time.
    pub const ZERO: SimTime = SimTime(0.0);

    /// The "never" sentinel, later than every schedulable event.
    pub const NEVER: SimTime = SimTime(f64::INFINITY);

    /// Create a new `SimTime` from seconds.
    #[inline]
    pub fn new(secs: f64) -> Self {
        debug_assert!(!secs.is_nan(), "SimTime cannot be NaN");
        SimTime(secs)
    }

    /// Return the raw value in seconds.
    #[inline]
    pub fn secs(self) -> f64 {
        self.0
    }

    /// The time `delta` seconds after `self`.
    #[inline]
    pub fn plus(self, delta: f64) -> SimTime {
        SimTime::new(self.0 + delta)
    }

    /// The time `delta` seconds before `self` (saturating at zero
    /// only in sign, negative times are admissible for windows).
    #[inline]
    pub fn minus(self, delta: f64) -> SimTime {
        SimTime::new(self.0 - delta)
    }

    /// Returns `true` if `self` is strictly before `other`.
    #[inline]
    pub fn is_before(self, other: SimTime) -> bool {
        self < other
    }

    /// Seconds elapsed from `other` to `self`.
    #[inline]
    pub fn since(self, other: SimTime) -> f64 {
        self.0 - other.0
    }
}

impl Eq for SimTime {}

impl Ord for SimTime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for SimTime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T={}", self.0)
    }
}

// ── Pacing ────────────────────────────────────────────────────────────

/// Maps wall-clock time onto simulated time.
///
/// A factor of `1.0` runs the net in real time; `2.0` runs it at
/// double speed. The net uses this to delay event dispatch, and
/// real-mode radio links use it as their clock source.
#[derive(Debug, Clone)]
pub struct Pacing {
    origin: Instant,
    factor: f64,
}

impl Pacing {
    /// Start a pacing clock now, with the given speed-up factor.
    pub fn starting_now(factor: f64) -> Self {
        Pacing {
            origin: Instant::now(),
            factor,
        }
    }

    /// The current simulated time according to the wall clock.
    pub fn now(&self) -> SimTime {
        SimTime::new(self.origin.elapsed().as_secs_f64() * self.factor)
    }

    /// Sleep until the wall clock reaches the given simulated time.
    pub fn sleep_until(&self, t: SimTime) {
        let target = Duration::from_secs_f64((t.secs() / self.factor).max(0.0));
        let elapsed = self.origin.elapsed();
        if target > elapsed {
            std::thread::sleep(target - elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_and_never() {
        assert_eq!(SimTime::ZERO.secs(), 0.0);
        assert!(SimTime::new(1e12) < SimTime::NEVER);
    }

    #[test]
    fn test_ordering() {
        let t1 = SimTime::new(1.5);
        let t2 = SimTime::new(2.0);
        assert!(t1 < t2);
        assert!(t1.is_before(t2));
        assert!(!t2.is_before(t1));
        assert_eq!(t1.cmp(&t1), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_arithmetic() {
        let t = SimTime::new(10.0);
        assert_eq!(t.plus(2.5), SimTime::new(12.5));
        assert_eq!(t.minus(4.0), SimTime::new(6.0));
        assert_eq!(t.since(SimTime::new(4.0)), 6.0);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", SimTime::new(42.0)), "T=42");
        assert_eq!(format!("{}", SimTime::new(0.5)), "T=0.5");
    }

    #[test]
    fn test_pacing_monotone() {
        let p = Pacing::starting_now(1000.0);
        let a = p.now();
        let b = p.now();
        assert!(a <= b);
    }
}
