// Wall-clock deadlines. tokio::time is monotonic and stops while the process is
// suspended; these re-check SystemTime so work started before a suspend expires on resume.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Longest single sleep before the wall clock is consulted again.
const RECHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Ceiling used for "no timeout" (non-positive timeouts).
pub const UNBOUNDED: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed;

impl std::fmt::Display for Elapsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("wall-clock deadline elapsed")
    }
}

impl std::error::Error for Elapsed {}

/// Converts a seconds setting where `<= 0` means unbounded.
pub fn timeout_from_secs(secs: i64) -> Duration {
    if secs <= 0 {
        UNBOUNDED
    } else {
        Duration::from_secs(secs as u64)
    }
}

/// Resolves once `deadline` has passed on the wall clock.
pub async fn sleep_until_wall(deadline: SystemTime) {
    loop {
        let remaining = match deadline.duration_since(SystemTime::now()) {
            Ok(d) if !d.is_zero() => d,
            _ => return,
        };
        tokio::time::sleep(remaining.min(RECHECK_INTERVAL)).await;
    }
}

/// The wall-clock instant `timeout` from now, saturating at the unbounded ceiling.
pub fn deadline_after(timeout: Duration) -> SystemTime {
    let now = SystemTime::now();
    now.checked_add(timeout).unwrap_or(now + UNBOUNDED)
}

/// Races `fut` against a wall-clock deadline `timeout` from now.
pub async fn wall_clock_timeout<F: Future>(timeout: Duration, fut: F) -> Result<F::Output, Elapsed> {
    run_until(deadline_after(timeout), fut).await
}

/// Races `fut` against an absolute wall-clock `deadline`.
pub async fn run_until<F: Future>(deadline: SystemTime, fut: F) -> Result<F::Output, Elapsed> {
    tokio::select! {
        out = fut => Ok(out),
        () = sleep_until_wall(deadline) => Err(Elapsed),
    }
}

/// Milliseconds since the Unix epoch, 0 if the clock is before the epoch.
pub fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, operation = "get_timestamp", "system time error");
            0
        })
}

pub fn now_millis() -> u64 {
    unix_millis(SystemTime::now())
}
