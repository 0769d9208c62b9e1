//! # Streaming Configuration
//!
//! Knobs for the look-ahead scheduler and the segment pipeline.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DeliveryError, Result};

/// Scheduler and pipeline configuration.
///
/// Every field has a serde default so a partial document (or `{}`) yields a
/// working configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// How far ahead of the playhead the scheduler buffers before throttling.
    ///
    /// Default: 30 seconds.
    #[serde(default = "default_buffer_horizon")]
    pub buffer_horizon: Duration,

    /// Sleep between horizon re-checks while throttled.
    ///
    /// Default: 1 second.
    #[serde(default = "default_throttle_interval")]
    pub throttle_interval: Duration,

    /// Delay between consecutive segment fetches.
    ///
    /// Default: 50 ms.
    #[serde(default = "default_pacing_delay")]
    pub pacing_delay: Duration,

    /// Delay before a new pass over segments that failed.
    ///
    /// Default: 500 ms.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: Duration,

    /// Segments loaded inline before the session is marked ready.
    ///
    /// Default: 3.
    #[serde(default = "default_initial_window")]
    pub initial_window: usize,

    /// Segments loaded around a seek target (the target plus followers).
    ///
    /// Default: 3.
    #[serde(default = "default_seek_window")]
    pub seek_window: usize,

    /// Passes over the segment list before gaps are reported as a stall.
    ///
    /// Default: 3.
    #[serde(default = "default_max_fetch_passes")]
    pub max_fetch_passes: u32,

    /// Constant-bitrate estimate used for durations and seek offsets when
    /// neither the load options nor the manifest provide one.
    ///
    /// Default: 16 000 bytes per second (128 kbit/s).
    #[serde(default = "default_bytes_per_second")]
    pub bytes_per_second: u64,

    /// Maximum duration of a single segment, manifest or stream request.
    ///
    /// Default: 20 seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffer_horizon: default_buffer_horizon(),
            throttle_interval: default_throttle_interval(),
            pacing_delay: default_pacing_delay(),
            retry_delay: default_retry_delay(),
            initial_window: default_initial_window(),
            seek_window: default_seek_window(),
            max_fetch_passes: default_max_fetch_passes(),
            bytes_per_second: default_bytes_per_second(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl StreamingConfig {
    /// Buffer the whole track as fast as the network allows.
    ///
    /// - Horizon large enough to never throttle
    /// - No pacing between segments
    pub fn eager() -> Self {
        Self {
            buffer_horizon: Duration::from_secs(24 * 60 * 60),
            pacing_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_horizon.is_zero() {
            return Err(config_error("buffer_horizon must be > 0"));
        }

        if self.throttle_interval.is_zero() {
            return Err(config_error("throttle_interval must be > 0"));
        }

        if self.initial_window == 0 {
            return Err(config_error("initial_window must be > 0"));
        }

        if self.seek_window == 0 {
            return Err(config_error("seek_window must be > 0"));
        }

        if self.max_fetch_passes == 0 {
            return Err(config_error("max_fetch_passes must be > 0"));
        }

        if self.bytes_per_second == 0 {
            return Err(config_error("bytes_per_second must be > 0"));
        }

        if self.request_timeout.is_zero() {
            return Err(config_error("request_timeout must be > 0"));
        }

        Ok(())
    }
}

fn config_error(message: &str) -> DeliveryError {
    DeliveryError::Config(message.to_string())
}

// ============================================================================
// Default Functions (for serde)
// ============================================================================

fn default_buffer_horizon() -> Duration {
    Duration::from_secs(30)
}

fn default_throttle_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_pacing_delay() -> Duration {
    Duration::from_millis(50)
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_initial_window() -> usize {
    3
}

fn default_seek_window() -> usize {
    3
}

fn default_max_fetch_passes() -> u32 {
    3
}

fn default_bytes_per_second() -> u64 {
    16_000 // 128 kbit/s
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(20)
}

// ============================================================================
// Streaming Statistics
// ============================================================================

/// Counters kept by the segment pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingStats {
    /// Total encrypted bytes received.
    pub total_bytes_downloaded: u64,
    /// Total number of HTTP requests made.
    pub http_requests: u64,
    /// Segments decoded and handed to the sink.
    pub segments_loaded: u64,
    /// Segment fetches that ended without bytes.
    pub failed_fetches: u64,
    /// Credential refreshes triggered by expiry.
    pub token_refreshes: u64,
    /// Delivery tier downgrades.
    pub downgrades: u32,
}
