//! Executor abstraction layer for the sealed audio delivery engine.
//!
//! Every `core-*` crate depends on this crate instead of reaching for tokio
//! directly. That keeps the cooperative scheduling model in one place: one
//! task per playback session, suspension at every fetch, sink call and
//! throttle sleep, and cancellation through [`sync::CancellationToken`].
//!
//! # Modules
//!
//! - `task`: Task spawning and abort handles
//! - `time`: Sleep, timeout and monotonic instants
//! - `sync`: Locks, channels and cancellation tokens
//! - `runtime`: Runtime handles and a blocking entry point for hosts
//!
//! # Examples
//!
//! ```rust
//! use core_async::sync::CancellationToken;
//! use core_async::time::{sleep, Duration};
//!
//! async fn example(token: CancellationToken) {
//!     let handle = core_async::spawn(async move {
//!         core_async::select! {
//!             _ = token.cancelled() => None,
//!             _ = sleep(Duration::from_millis(5)) => Some(42),
//!         }
//!     });
//!     let _ = handle.await;
//! }
//! ```

pub mod runtime;
pub mod sync;
pub mod task;
pub mod time;

pub use task::spawn;
pub use time::{sleep, Duration, Instant};

/// Waits on multiple concurrent branches, returning when the first completes.
pub use tokio::select;
