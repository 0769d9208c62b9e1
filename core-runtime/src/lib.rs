//! # Core Runtime Module
//!
//! Foundational runtime infrastructure for the delivery engine:
//! - Logging and tracing infrastructure with credential redaction
//! - Engine configuration (bridges, endpoint templates)
//! - Event bus system
//!
//! ## Overview
//!
//! Every other engine crate depends on this one. It establishes the logging
//! conventions, the fail-fast configuration builder and the broadcast channel
//! through which lifecycle events reach the host.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{EndpointConfig, EngineConfig, EngineConfigBuilder};
pub use error::{Error, Result};
pub use events::{CoreEvent, EventBus, EventStream, PlaybackEvent, TokenEvent, TransportEvent};
