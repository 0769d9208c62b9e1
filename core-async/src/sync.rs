//! Synchronization primitives.
//!
//! Async-aware locks and channels from `tokio::sync`, plus the cooperative
//! [`CancellationToken`] from `tokio-util` used to supersede playback
//! sessions.
//!
//! ```rust
//! use core_async::sync::{CancellationToken, Mutex};
//!
//! async fn example() {
//!     let mutex = Mutex::new(0);
//!     *mutex.lock().await += 1;
//!
//!     let token = CancellationToken::new();
//!     let child = token.child_token();
//!     token.cancel();
//!     assert!(child.is_cancelled());
//! }
//! ```

pub use tokio::sync::{
    broadcast, mpsc, oneshot, watch, Mutex, MutexGuard, Notify, OnceCell, RwLock,
    RwLockReadGuard, RwLockWriteGuard,
};

pub use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};
