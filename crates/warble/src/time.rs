use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch for encoded post-id timestamps: Monday, January 1, 2018
/// 00:00:00 UTC, in milliseconds since the unix epoch.
pub const CUSTOM_EPOCH_MS: i64 = 1_514_764_800_000;

/// A wall-clock time source in unix milliseconds.
///
/// This is deliberately a wall clock, not a monotonic one: the id generator
/// must observe clock regressions and reject them, so hiding them behind a
/// monotonic source would change its contract. Tests substitute fixed or
/// stepped implementations.
pub trait TimeSource {
    /// Returns the current time in milliseconds since the unix epoch.
    fn unix_millis(&self) -> i64;
}

/// The system wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct WallClock;

impl TimeSource for WallClock {
    fn unix_millis(&self) -> i64 {
        // A system clock before 1970 reads as 0 and is rejected downstream
        // as a before-epoch reading.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since_epoch| since_epoch.as_millis() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_clock_is_past_the_custom_epoch() {
        assert!(WallClock.unix_millis() > CUSTOM_EPOCH_MS);
    }
}
