//! Wall-clock timestamps and real-time pacing.
//!
//! Conference timelines are expressed as [`Timestamp`] values (nanoseconds
//! since the Unix epoch). Every participant adopts the inviter's start
//! timestamp so media timestamps share one origin.

use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

/// Nanoseconds since the Unix epoch.
pub type Timestamp = u64;

/// Returns the current wall-clock time as a [`Timestamp`].
///
/// Clocks set before 1970 or beyond 2262 saturate to `0`.
pub fn now_timestamp() -> Timestamp {
    Utc::now()
        .timestamp_nanos_opt()
        .and_then(|nanos| u64::try_from(nanos).ok())
        .unwrap_or(0)
}

/// Time elapsed between `origin` and now. Returns zero if `origin` lies in
/// the future.
pub fn elapsed_since(origin: Timestamp) -> Duration {
    Duration::from_nanos(now_timestamp().saturating_sub(origin))
}

/// Throttles a producer to real time.
///
/// Each call to [`FramePacer::pace`] sleeps until at least `expected` has
/// passed since the previous call. The first call never sleeps.
#[derive(Debug, Default)]
pub struct FramePacer {
    last: Option<Instant>,
}

impl FramePacer {
    /// Creates a pacer with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits out the remainder of `expected` and returns how long it slept.
    pub fn pace(&mut self, expected: Duration) -> Duration {
        let now = Instant::now();
        let slept = match self.last {
            Some(prev) => {
                let delta = now.saturating_duration_since(prev);
                if expected > delta {
                    let wait = expected - delta;
                    thread::sleep(wait);
                    wait
                } else {
                    Duration::ZERO
                }
            }
            None => Duration::ZERO,
        };
        self.last = Some(Instant::now());
        slept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(now_timestamp() > 1_577_836_800_000_000_000);
    }

    #[test]
    fn elapsed_since_future_is_zero() {
        let future = now_timestamp() + 60_000_000_000;
        assert_eq!(elapsed_since(future), Duration::ZERO);
    }

    #[test]
    fn elapsed_since_past() {
        let origin = now_timestamp() - 2_000_000_000;
        assert!(elapsed_since(origin) >= Duration::from_secs(2));
    }

    #[test]
    fn first_pace_does_not_sleep() {
        let mut pacer = FramePacer::new();
        assert_eq!(pacer.pace(Duration::from_millis(50)), Duration::ZERO);
    }

    #[test]
    fn pace_throttles_fast_producer() {
        let mut pacer = FramePacer::new();
        pacer.pace(Duration::from_millis(20));
        let start = Instant::now();
        pacer.pace(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn late_frame_does_not_sleep() {
        let mut pacer = FramePacer::new();
        pacer.pace(Duration::from_millis(10));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(pacer.pace(Duration::from_millis(10)), Duration::ZERO);
    }
}
