//! # Host Bridge Traits
//!
//! Contracts between the delivery engine and the host platform.
//!
//! ## Overview
//!
//! The engine needs three things it cannot provide itself: a way to make HTTP
//! requests, an audio backend to feed, and a clock. Each is a trait here; each
//! host ships an adapter (`bridge-desktop` for reqwest-based desktop builds,
//! mobile hosts inject their own).
//!
//! ## Traits
//!
//! - [`HttpClient`](http::HttpClient) - Token, manifest, segment and stream requests
//! - [`PlaybackSink`](playback::PlaybackSink) - Host audio backend (segment append,
//!   playlist, buffer or stream playback)
//! - [`Clock`](time::Clock) - Time source for credential expiry
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Fail-Fast Strategy
//!
//! The runtime fails fast with `CapabilityMissing` when a required bridge is
//! not supplied:
//!
//! ```ignore
//! let http_client = config.http_client.ok_or_else(|| Error::CapabilityMissing {
//!     capability: "HttpClient".to_string(),
//!     message: "No HTTP client implementation provided.".to_string(),
//! })?;
//! ```
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). A sink reports a
//! fatal playback fault with `BridgeError::Rejected`; the engine reacts by
//! falling back to a simpler delivery mode.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so they can be shared across the
//! engine's background tasks.

pub mod error;
pub mod http;
pub mod platform;
pub mod playback;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy};
pub use platform::PlatformSendSync;
pub use playback::{
    AudioSource, PlaybackOptions, PlaybackSessionId, PlaybackSink, SinkCapabilities,
};
pub use time::{Clock, ConsoleLogger, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
