use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch; the clock all request and cooldown
/// timestamps are taken from.
pub fn now_millis() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_millis() as i64
}

/// Milliseconds left until `deadline`, zero once it has passed.
pub fn remaining_until(deadline: i64, now: i64) -> Duration {
  Duration::from_millis(deadline.saturating_sub(now).max(0) as u64)
}

/// `now` moved forward by `delay`, pinned at `i64::MAX`.
pub fn millis_after(now: i64, delay: Duration) -> i64 {
  let delay = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
  now.saturating_add(delay)
}

/// Table / file name of a cluster's logout affinity store.
pub fn affinity_store_name(cluster: &str) -> String {
  format!("logoutserver_{}", cluster.to_lowercase().replace('-', "_"))
}
