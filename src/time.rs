//! Time sources.
//!
//! The engine never reads the system time directly. Every timer deadline is expressed
//! as a monotonic offset from the clock's origin (`Clock::now`), and every timestamp
//! attached to a value comes from `Clock::wall_time`. Production code uses
//! [`SystemClock`]; tests drive a [`ManualClock`] so that sampling and publish cycles
//! run without wall-clock waits.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// A steady clock plus the matching wall-clock time.
pub trait Clock: Send + Sync + Debug {
    /// Monotonic time elapsed since the clock's origin.
    fn now(&self) -> Duration;

    /// Wall-clock time corresponding to `now()`.
    fn wall_time(&self) -> DateTime<Utc>;
}

/// Real time.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Clock anchored at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall_time(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Virtual time that only moves when told to.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use uasub::time::{Clock, ManualClock};
///
/// let clock = ManualClock::new();
/// clock.advance(Duration::from_millis(250));
/// assert_eq!(clock.now(), Duration::from_millis(250));
/// ```
#[derive(Debug)]
pub struct ManualClock {
    wall_origin: DateTime<Utc>,
    elapsed_micros: AtomicU64,
}

impl ManualClock {
    /// Starts at zero, with wall time anchored at the current system time.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Clock at offset zero whose wall time starts at `wall_origin`.
    #[must_use]
    pub const fn starting_at(wall_origin: DateTime<Utc>) -> Self {
        Self {
            wall_origin,
            elapsed_micros: AtomicU64::new(0),
        }
    }

    /// Moves time forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.elapsed_micros.fetch_add(duration_micros(by), Ordering::AcqRel);
    }

    /// Moves time forward to `at`. Never moves backwards.
    pub fn set(&self, at: Duration) {
        self.elapsed_micros.fetch_max(duration_micros(at), Ordering::AcqRel);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.elapsed_micros.load(Ordering::Acquire))
    }

    fn wall_time(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.now()).unwrap_or(chrono::Duration::zero());
        self.wall_origin + elapsed
    }
}

fn duration_micros(d: Duration) -> u64 {
    d.as_micros().min(u128::from(u64::MAX)) as u64
}

/// Milliseconds of a duration, saturating.
pub(crate) fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_forward() {
        let clock = ManualClock::new();
        clock.set(Duration::from_secs(2));
        clock.set(Duration::from_secs(1));
        assert_eq!(clock.now(), Duration::from_secs(2));

        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now(), Duration::from_millis(2500));
    }

    #[test]
    fn manual_wall_time_tracks_elapsed() {
        let origin = Utc::now();
        let clock = ManualClock::starting_at(origin);
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.wall_time(), origin + chrono::Duration::milliseconds(1500));
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
