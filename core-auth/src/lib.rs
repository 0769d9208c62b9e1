//! # Token/Session Client
//!
//! Obtains short-lived, per-track or per-segment access grants from the
//! token endpoint.
//!
//! ## Overview
//!
//! - [`TokenClient::fetch_token`] / [`TokenClient::fetch_segment_token`] return
//!   `Option<AccessGrant>`; `None` is the failure sentinel and the cause is
//!   logged
//! - Grants carry optional key and nonce material and an optional expiry
//! - No caching: each call hits the endpoint, so grants never cross tracks
//! - Grant issue, refresh and failure are reported on the event bus
//!
//! The single refresh-and-retry on an expired segment credential is driven by
//! the segment fetch pipeline in `core-playback`.

pub mod client;
pub mod error;
pub mod types;

pub use client::TokenClient;
pub use error::{AuthError, Result};
pub use types::{AccessGrant, GrantScope};
