use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

pub(crate) fn get_duration_since_epoch() -> Duration {
    // A clock set before 1970 reports zero rather than failing the caller
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

/// Wall-clock timestamp attached to subscription items, in nanoseconds.
pub fn now_nanos() -> u64 {
    u64::try_from(get_duration_since_epoch().as_nanos()).unwrap_or(u64::MAX)
}
