//! Thread-safety marker used by every bridge trait.
//!
//! Bridge implementations are shared between the caller and the session task,
//! so they must be `Send + Sync`.

/// Marker trait for `Send + Sync` bridge implementations.
pub trait PlatformSendSync: Send + Sync {}

impl<T> PlatformSendSync for T where T: Send + Sync {}
