//! Time-related abstractions.
//!
//! Re-exports tokio's timer so that paused-clock tests (`start_paused`)
//! drive throttle sleeps and pacing delays deterministically.
//!
//! ```rust
//! use core_async::time::{sleep, Duration, Instant};
//!
//! async fn example() {
//!     let start = Instant::now();
//!     sleep(Duration::from_millis(10)).await;
//!     let _elapsed = start.elapsed();
//! }
//! ```

pub use tokio::time::{error::Elapsed, interval, sleep, timeout, Instant, Interval, Sleep};

pub use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
