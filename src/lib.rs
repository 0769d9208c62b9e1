//! Workspace facade.
//!
//! Re-exports the delivery engine crates so a host can depend on a single
//! crate. With the default `desktop-shims` feature the reqwest-backed HTTP
//! client is wired in automatically when no client is configured.

pub use bridge_traits;
pub use core_auth;
pub use core_playback;
pub use core_runtime;

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop;

pub use core_playback::{
    DeliveryError, EngineStatus, LoadOptions, PlaybackEngine, SeekOutcome, StreamingConfig,
    TransportTier,
};
pub use core_runtime::{EndpointConfig, EngineConfig, EventBus};
