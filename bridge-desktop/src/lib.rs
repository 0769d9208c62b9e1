//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest` (rustls, connection pooling, retry on 5xx/429)
//!
//! The playback sink is always supplied by the host application; desktop
//! players differ too much for a useful default.
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::ReqwestHttpClient;
//! use core_runtime::config::EngineConfig;
//!
//! let config = EngineConfig::builder()
//!     .http_client(Arc::new(ReqwestHttpClient::new()))
//!     .build()?;
//! ```

mod http;

pub use http::ReqwestHttpClient;
