use std::time::{SystemTime, UNIX_EPOCH};

/// Time source used by the batching pipeline for window bucketing and
/// worker wake-ups.
///
/// Window boundaries are wall-clock aligned, so this deliberately reads
/// the wall clock. Durations inside records use `std::time::Instant`
/// and are unaffected by this trait.
pub trait Clock: Send + Sync {
    /// Seconds since the unix epoch, with sub-second precision.
    fn now(&self) -> f64;
}

/// The default clock: `SystemTime::now()`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}
