//! # Delivery Error Types
//!
//! Failure taxonomy for the segment pipeline, the scheduler and the session
//! lifecycle. Most variants never reach the host: transient ones are retried,
//! `DecodeFatal` is answered with a tier downgrade, and only
//! `TerminalFailure` surfaces as the session's `error`.

use bridge_traits::error::BridgeError;
use thiserror::Error;

/// Errors raised while delivering a track.
#[derive(Error, Debug)]
pub enum DeliveryError {
    // ========================================================================
    // Credential Errors
    // ========================================================================
    /// The server rejected the credential (401/403/410) or it is known to be
    /// expired locally.
    #[error("Access token expired for track {track_id} (segment {index:?})")]
    TokenExpired {
        track_id: String,
        index: Option<usize>,
    },

    // ========================================================================
    // Transfer Errors
    // ========================================================================
    /// A segment, manifest or stream request failed.
    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    /// Segment bytes could not be decrypted or deobfuscated.
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// The manifest is malformed or violates segment coverage.
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    // ========================================================================
    // Playback Errors
    // ========================================================================
    /// The sink rejected data or the pipeline stalled. Handled by moving to
    /// the next delivery tier.
    #[error("Fatal playback error: {0}")]
    DecodeFatal(String),

    /// A delivery tier cannot run on this platform. Not an error condition;
    /// the tier is skipped.
    #[error("Delivery tier {tier} unavailable: {reason}")]
    CapabilityUnavailable { tier: String, reason: String },

    /// Every delivery tier failed.
    #[error("Playback failed: {0}")]
    TerminalFailure(String),

    /// The session was superseded or torn down.
    #[error("Session cancelled")]
    Cancelled,

    /// Attempted operation when no track is loaded.
    #[error("No track loaded")]
    NoTrackLoaded,

    // ========================================================================
    // Generic Errors
    // ========================================================================
    /// Invalid streaming configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Host bridge failure.
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),
}

impl DeliveryError {
    /// Returns `true` if retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeliveryError::TokenExpired { .. }
                | DeliveryError::FetchFailed(_)
                | DeliveryError::Decryption(_)
        )
    }

    /// Returns `true` if the current delivery tier cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeliveryError::DecodeFatal(_) | DeliveryError::TerminalFailure(_)
        )
    }

    /// Returns `true` if the session was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DeliveryError::Cancelled)
    }

    /// Map a sink failure: rejections are fatal for the tier, everything else
    /// is passed through as a bridge error.
    pub(crate) fn from_sink(error: BridgeError) -> Self {
        match error {
            BridgeError::Rejected(reason) => DeliveryError::DecodeFatal(reason),
            other => DeliveryError::Bridge(other),
        }
    }
}

/// Result type for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;
