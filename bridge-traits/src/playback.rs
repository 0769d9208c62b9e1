//! Playback sink bridge trait and supporting types.
//!
//! The sink is the host's audio backend: an in-process demuxer that accepts
//! discrete segments, a native player that resolves playlists or stream URLs,
//! or a plain buffer player. The engine never decodes audio; it only decides
//! which of these entry points to feed and in what order.
//!
//! Every call carries a [`PlaybackSessionId`] so an implementation can ignore
//! stragglers from a session that has already been detached.

use crate::{error::Result, platform::PlatformSendSync};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// What the host playback backend can do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkCapabilities {
    /// Accepts discrete media segments appended by the engine.
    pub segmented_append: bool,
    /// Resolves a segmented-playlist URL without engine-side demuxing.
    pub native_playlist: bool,
    /// Audio from segmented or playlist sources is invisible to the
    /// platform's capture/analysis path.
    pub capture_restricted: bool,
}

impl SinkCapabilities {
    /// A backend that supports every delivery mode and has no capture restriction.
    pub fn full() -> Self {
        Self {
            segmented_append: true,
            native_playlist: true,
            capture_restricted: false,
        }
    }

    /// A backend that can only play a finished buffer or a plain stream.
    pub fn minimal() -> Self {
        Self::default()
    }
}

/// Source handed to the sink when a delivery tier starts.
#[derive(Clone)]
pub enum AudioSource {
    /// Segments will follow through [`PlaybackSink::append_segment`].
    Segmented {
        track_id: String,
        segment_count: usize,
        estimated_duration: Duration,
    },
    /// A playlist document the sink resolves on its own.
    Playlist { url: String },
    /// The complete decoded asset, assembled locally.
    MemoryBuffer { data: Bytes },
    /// A single full-resource byte stream.
    RemoteStream {
        url: String,
        headers: HashMap<String, String>,
    },
}

impl AudioSource {
    /// Determine whether the sink fetches the media itself.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            AudioSource::Playlist { .. } | AudioSource::RemoteStream { .. }
        )
    }

    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AudioSource::Segmented { .. } => "segmented",
            AudioSource::Playlist { .. } => "playlist",
            AudioSource::MemoryBuffer { .. } => "memory-buffer",
            AudioSource::RemoteStream { .. } => "remote-stream",
        }
    }
}

// URLs carry access tokens and buffers carry plaintext; neither belongs in logs.
impl fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioSource::Segmented {
                track_id,
                segment_count,
                estimated_duration,
            } => f
                .debug_struct("Segmented")
                .field("track_id", track_id)
                .field("segment_count", segment_count)
                .field("estimated_duration", estimated_duration)
                .finish(),
            AudioSource::Playlist { .. } => f
                .debug_struct("Playlist")
                .field("url", &"[REDACTED]")
                .finish(),
            AudioSource::MemoryBuffer { data } => f
                .debug_struct("MemoryBuffer")
                .field("len", &data.len())
                .finish(),
            AudioSource::RemoteStream { headers, .. } => f
                .debug_struct("RemoteStream")
                .field("url", &"[REDACTED]")
                .field("headers", &headers.len())
                .finish(),
        }
    }
}

/// Options applied when a source is opened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackOptions {
    /// Initial playback position (defaults to start of stream).
    pub start_position: Duration,
    /// Start playing as soon as enough data is available.
    pub autoplay: bool,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            start_position: Duration::ZERO,
            autoplay: true,
        }
    }
}

/// Unique identifier for one engine session as seen by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaybackSessionId(Uuid);

impl PlaybackSessionId {
    /// Generate a new session identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Borrow the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PlaybackSessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlaybackSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host playback backend driven by the delivery engine.
///
/// Appends for one session are strictly sequential: the engine awaits each
/// `append_segment` before issuing the next, so implementations never see
/// overlapping writes.
///
/// An implementation signals a fatal playback problem (buffer-append
/// rejection, decode fault) by returning [`BridgeError::Rejected`]; the
/// engine answers by falling back to a simpler delivery mode.
///
/// [`BridgeError::Rejected`]: crate::error::BridgeError::Rejected
#[async_trait::async_trait]
pub trait PlaybackSink: PlatformSendSync {
    /// Report which delivery modes the backend supports.
    async fn probe_capabilities(&self) -> SinkCapabilities;

    /// Start a session from the given source.
    async fn open(
        &self,
        session: PlaybackSessionId,
        source: AudioSource,
        options: PlaybackOptions,
    ) -> Result<()>;

    /// Append one decoded segment to a `Segmented` session.
    async fn append_segment(&self, session: PlaybackSessionId, index: usize, data: Bytes)
        -> Result<()>;

    /// No further segments will be appended.
    async fn end_of_stream(&self, session: PlaybackSessionId) -> Result<()>;

    /// Move the playhead.
    async fn seek(&self, session: PlaybackSessionId, position: Duration) -> Result<()>;

    /// Current playhead position.
    async fn position(&self, session: PlaybackSessionId) -> Result<Duration>;

    /// Release everything held for the session. Must tolerate unknown sessions.
    async fn detach(&self, session: PlaybackSessionId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playback_options_default_values() {
        let opts = PlaybackOptions::default();
        assert_eq!(opts.start_position, Duration::ZERO);
        assert!(opts.autoplay);
    }

    #[test]
    fn session_id_is_unique() {
        let a = PlaybackSessionId::new();
        let b = PlaybackSessionId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.as_uuid().to_string());
    }

    #[test]
    fn remote_sources_hide_their_urls() {
        let source = AudioSource::RemoteStream {
            url: "https://cdn.example.com/t/1?token=abc".to_string(),
            headers: HashMap::new(),
        };
        assert!(source.is_remote());
        let debug = format!("{:?}", source);
        assert!(!debug.contains("token=abc"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn capability_presets() {
        let full = SinkCapabilities::full();
        assert!(full.segmented_append && full.native_playlist);
        assert!(!full.capture_restricted);
        assert_eq!(SinkCapabilities::minimal(), SinkCapabilities::default());
    }
}
