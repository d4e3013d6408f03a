//! Drift-free periodic scheduler for timed loops.
//!
//! Successive returns from [`Beat::tick`] are spaced exactly one interval
//! apart, measured from the previous return rather than from body
//! completion, so a loop body that runs for 40ms on a 100ms beat still
//! produces a 100ms cadence.

use std::fmt;
use std::time::{Duration, Instant};

/// Raised when a loop body overran its beat interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeatError {
    pub interval: Duration,
    pub elapsed: Duration,
}

impl fmt::Display for BeatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loop body too slow for beat interval ({:?} elapsed > {:?} interval)",
            self.elapsed, self.interval
        )
    }
}

impl std::error::Error for BeatError {}

/// A timed loop helper; one per periodic worker.
#[derive(Debug)]
pub struct Beat {
    interval: Duration,
    last_beat: Option<Instant>,
}

impl Beat {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            last_beat: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sleeps out the remainder of the current interval. Fails if the loop
    /// body already consumed more than one interval since the last tick.
    pub fn tick(&mut self) -> Result<(), BeatError> {
        if let Some(last_beat) = self.last_beat {
            let elapsed = last_beat.elapsed();
            match self.interval.checked_sub(elapsed) {
                Some(remaining) => std::thread::sleep(remaining),
                None => {
                    return Err(BeatError {
                        interval: self.interval,
                        elapsed,
                    })
                }
            }
        }
        self.last_beat = Some(Instant::now());
        Ok(())
    }

    /// Resets timing; the next `tick` returns immediately.
    pub fn clear(&mut self) {
        self.last_beat = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_tick_returns_immediately() {
        let mut beat = Beat::new(500);
        let start = Instant::now();
        beat.tick().unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_cadence_measured_from_previous_return() {
        let mut beat = Beat::new(100);
        beat.tick().unwrap();
        let start = Instant::now();
        std::thread::sleep(Duration::from_millis(40));
        beat.tick().unwrap();
        let elapsed = start.elapsed();
        // `start` lags the beat's internal timestamp by a hair, so allow
        // a millisecond of slack on the lower bound.
        assert!(elapsed >= Duration::from_millis(99), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(200), "elapsed {elapsed:?}");
    }

    #[test]
    fn test_overrun_raises() {
        let mut beat = Beat::new(100);
        beat.tick().unwrap();
        std::thread::sleep(Duration::from_millis(150));
        let err = beat.tick().unwrap_err();
        assert_eq!(err.interval, Duration::from_millis(100));
        assert!(err.to_string().contains("loop body too slow"));
    }

    #[test]
    fn test_clear_resets_timing() {
        let mut beat = Beat::new(100);
        beat.tick().unwrap();
        std::thread::sleep(Duration::from_millis(150));
        beat.clear();
        beat.tick().unwrap();
    }
}
