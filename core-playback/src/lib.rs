//! # Sealed Audio Delivery
//!
//! Delivers token-gated, encrypted audio to a host playback sink.
//!
//! ## Overview
//!
//! This crate handles:
//! - Segment manifests and byte-range planning
//! - Per-segment access credentials with a single refresh on expiry
//! - Segment decryption (AES-GCM) and legacy XOR deobfuscation
//! - Look-ahead buffering bounded by a time horizon
//! - Seeking into unbuffered regions
//! - Transport fallback from segmented delivery down to a direct stream
//!
//! [`PlaybackEngine`] is the entry point; everything else is exposed for
//! hosts that want to drive the pieces themselves.

pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod manifest;
pub mod seek;
mod session;
pub mod transport;

pub use config::{StreamingConfig, StreamingStats};
pub use crypto::{CipherScheme, SegmentKey};
pub use engine::{EngineStatus, LoadOptions, PlaybackEngine};
pub use error::{DeliveryError, Result};
pub use fetch::{SegmentFetcher, TrackAccess};
pub use manifest::{Addressing, Manifest, Segment};
pub use seek::{SeekOutcome, SeekTarget};
pub use transport::{CapabilityCache, SelectionContext, TransportSelector, TransportTier};
