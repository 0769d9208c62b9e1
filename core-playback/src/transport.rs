//! Delivery tier selection.
//!
//! Tiers are tried in strict descending preference. Ineligible tiers are
//! skipped without ever being attempted, and a running tier that fails hands
//! over to the next eligible tier below it. No tier is attempted twice in one
//! session.

use bridge_traits::playback::{PlaybackSink, SinkCapabilities};
use core_async::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::error::DeliveryError;

/// Delivery strategy, ordered from most to least preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportTier {
    /// Engine fetches, decrypts and appends discrete segments.
    AdaptiveSegmented,
    /// Sink resolves a segmented playlist itself.
    NativePlaylist,
    /// Engine downloads every segment into one local buffer.
    AssembledBuffer,
    /// Sink plays a single full-resource stream URL.
    DirectStream,
}

impl TransportTier {
    /// All tiers in preference order.
    pub const ALL: [TransportTier; 4] = [
        TransportTier::AdaptiveSegmented,
        TransportTier::NativePlaylist,
        TransportTier::AssembledBuffer,
        TransportTier::DirectStream,
    ];

    /// The next less preferred tier.
    pub fn next(self) -> Option<TransportTier> {
        match self {
            TransportTier::AdaptiveSegmented => Some(TransportTier::NativePlaylist),
            TransportTier::NativePlaylist => Some(TransportTier::AssembledBuffer),
            TransportTier::AssembledBuffer => Some(TransportTier::DirectStream),
            TransportTier::DirectStream => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportTier::AdaptiveSegmented => "adaptive-segmented",
            TransportTier::NativePlaylist => "native-playlist",
            TransportTier::AssembledBuffer => "assembled-buffer",
            TransportTier::DirectStream => "direct-stream",
        }
    }

    /// The sink owns the media timeline and handles seeks itself.
    pub fn delegates_seek(&self) -> bool {
        matches!(
            self,
            TransportTier::NativePlaylist | TransportTier::DirectStream
        )
    }

    /// Check whether this tier can run in `context`.
    ///
    /// Returns `CapabilityUnavailable` with the reason when it cannot.
    pub fn eligibility(&self, context: &SelectionContext) -> Result<(), DeliveryError> {
        let blocked_by_capture =
            context.capture_required && context.capabilities.capture_restricted;

        let reason = match self {
            TransportTier::AdaptiveSegmented if !context.capabilities.segmented_append => {
                Some("sink cannot append segments")
            }
            TransportTier::AdaptiveSegmented if !context.has_manifest => Some("no manifest"),
            TransportTier::NativePlaylist if !context.capabilities.native_playlist => {
                Some("sink cannot resolve playlists")
            }
            TransportTier::AdaptiveSegmented | TransportTier::NativePlaylist
                if blocked_by_capture =>
            {
                Some("capture path cannot observe this tier")
            }
            TransportTier::AssembledBuffer if !context.has_manifest => Some("no manifest"),
            _ => None,
        };

        match reason {
            Some(reason) => Err(DeliveryError::CapabilityUnavailable {
                tier: self.as_str().to_string(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Display for TransportTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to tier selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionContext {
    pub capabilities: SinkCapabilities,
    /// A valid manifest was negotiated for the track.
    pub has_manifest: bool,
    /// The host needs the audio visible to the platform capture path.
    pub capture_required: bool,
}

/// Chooses and downgrades delivery tiers for one session.
#[derive(Debug, Clone)]
pub struct TransportSelector {
    context: SelectionContext,
    current: Option<TransportTier>,
    history: Vec<TransportTier>,
    skipped: Vec<(TransportTier, String)>,
}

impl TransportSelector {
    pub fn new(context: SelectionContext) -> Self {
        Self {
            context,
            current: None,
            history: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Pick the most preferred eligible tier.
    ///
    /// Always succeeds on a fresh selector since the direct stream has no
    /// requirements.
    pub fn select_initial(&mut self) -> Option<TransportTier> {
        self.advance_from(Some(TransportTier::AdaptiveSegmented))
    }

    /// Move below the current tier. `None` when nothing is left.
    pub fn downgrade(&mut self) -> Option<TransportTier> {
        let start = match self.current {
            Some(current) => current.next(),
            None => Some(TransportTier::AdaptiveSegmented),
        };
        self.advance_from(start)
    }

    fn advance_from(&mut self, mut candidate: Option<TransportTier>) -> Option<TransportTier> {
        while let Some(tier) = candidate {
            if self.history.contains(&tier) {
                candidate = tier.next();
                continue;
            }
            match tier.eligibility(&self.context) {
                Ok(()) => {
                    self.current = Some(tier);
                    self.history.push(tier);
                    return Some(tier);
                }
                Err(err) => {
                    debug!(tier = %tier, reason = %err, "Skipping delivery tier");
                    if !self.skipped.iter().any(|(skipped, _)| *skipped == tier) {
                        self.skipped.push((tier, reason_of(&err)));
                    }
                    candidate = tier.next();
                }
            }
        }
        self.current = None;
        None
    }

    pub fn current(&self) -> Option<TransportTier> {
        self.current
    }

    /// Tiers attempted so far, in order.
    pub fn history(&self) -> &[TransportTier] {
        &self.history
    }

    /// Tiers passed over as ineligible, with the reason.
    pub fn skipped(&self) -> &[(TransportTier, String)] {
        &self.skipped
    }

    pub fn context(&self) -> &SelectionContext {
        &self.context
    }
}

fn reason_of(err: &DeliveryError) -> String {
    match err {
        DeliveryError::CapabilityUnavailable { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// Capability Cache
// ============================================================================

static GLOBAL_CAPABILITIES: OnceLock<Arc<CapabilityCache>> = OnceLock::new();

/// Memoised sink capability probe.
///
/// The first caller probes the sink; concurrent callers wait for that probe
/// instead of starting their own. Once filled the cache never changes.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    cell: OnceCell<SinkCapabilities>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide cache, shared by every engine that opts into it.
    ///
    /// Assumes one playback backend per process.
    pub fn global() -> Arc<CapabilityCache> {
        Arc::clone(GLOBAL_CAPABILITIES.get_or_init(|| Arc::new(CapabilityCache::new())))
    }

    /// Return cached capabilities, probing `sink` on first use.
    pub async fn get_or_probe(&self, sink: &dyn PlaybackSink) -> SinkCapabilities {
        *self
            .cell
            .get_or_init(|| async {
                let capabilities = sink.probe_capabilities().await;
                debug!(?capabilities, "Probed sink capabilities");
                capabilities
            })
            .await
    }

    /// Cached capabilities without probing.
    pub fn peek(&self) -> Option<SinkCapabilities> {
        self.cell.get().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(capabilities: SinkCapabilities, has_manifest: bool) -> SelectionContext {
        SelectionContext {
            capabilities,
            has_manifest,
            capture_required: false,
        }
    }

    #[test]
    fn test_tier_order() {
        assert_eq!(
            TransportTier::AdaptiveSegmented.next(),
            Some(TransportTier::NativePlaylist)
        );
        assert_eq!(TransportTier::DirectStream.next(), None);
        assert!(TransportTier::AdaptiveSegmented < TransportTier::DirectStream);
        assert_eq!(TransportTier::ALL.len(), 4);
    }

    #[test]
    fn test_full_platform_starts_at_top() {
        let mut selector = TransportSelector::new(context(SinkCapabilities::full(), true));
        assert_eq!(
            selector.select_initial(),
            Some(TransportTier::AdaptiveSegmented)
        );
        assert!(selector.skipped().is_empty());
    }

    #[test]
    fn test_fallback_order_is_strict() {
        let mut selector = TransportSelector::new(context(SinkCapabilities::full(), true));
        let mut visited = vec![selector.select_initial().unwrap()];
        while let Some(tier) = selector.downgrade() {
            visited.push(tier);
        }
        assert_eq!(visited, TransportTier::ALL.to_vec());
        assert_eq!(selector.history(), &TransportTier::ALL);
        assert_eq!(selector.current(), None);
        assert_eq!(selector.downgrade(), None);
    }

    #[test]
    fn test_minimal_platform_skips_to_buffer() {
        let mut selector = TransportSelector::new(context(SinkCapabilities::minimal(), true));
        assert_eq!(
            selector.select_initial(),
            Some(TransportTier::AssembledBuffer)
        );
        let skipped: Vec<_> = selector.skipped().iter().map(|(t, _)| *t).collect();
        assert_eq!(
            skipped,
            vec![TransportTier::AdaptiveSegmented, TransportTier::NativePlaylist]
        );
        assert_eq!(selector.downgrade(), Some(TransportTier::DirectStream));
    }

    #[test]
    fn test_no_manifest_uses_playlist_then_stream() {
        let mut selector = TransportSelector::new(context(SinkCapabilities::full(), false));
        assert_eq!(selector.select_initial(), Some(TransportTier::NativePlaylist));
        assert_eq!(selector.downgrade(), Some(TransportTier::DirectStream));
        assert_eq!(selector.history(), &[
            TransportTier::NativePlaylist,
            TransportTier::DirectStream
        ]);
    }

    #[test]
    fn test_capture_restriction_only_blocks_when_capture_is_required() {
        let mut capabilities = SinkCapabilities::full();
        capabilities.capture_restricted = true;

        let mut relaxed = TransportSelector::new(context(capabilities, true));
        assert_eq!(
            relaxed.select_initial(),
            Some(TransportTier::AdaptiveSegmented)
        );

        let mut strict = TransportSelector::new(SelectionContext {
            capabilities,
            has_manifest: true,
            capture_required: true,
        });
        assert_eq!(strict.select_initial(), Some(TransportTier::AssembledBuffer));
    }

    #[test]
    fn test_eligibility_reasons() {
        let ctx = context(SinkCapabilities::minimal(), false);
        match TransportTier::AdaptiveSegmented.eligibility(&ctx) {
            Err(DeliveryError::CapabilityUnavailable { tier, .. }) => {
                assert_eq!(tier, "adaptive-segmented")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(TransportTier::AssembledBuffer.eligibility(&ctx).is_err());
        assert!(TransportTier::DirectStream.eligibility(&ctx).is_ok());
    }

    #[test]
    fn test_delegated_seek_tiers() {
        assert!(TransportTier::NativePlaylist.delegates_seek());
        assert!(TransportTier::DirectStream.delegates_seek());
        assert!(!TransportTier::AssembledBuffer.delegates_seek());
        assert!(!TransportTier::AdaptiveSegmented.delegates_seek());
    }

    #[test]
    fn test_global_cache_is_shared() {
        let a = CapabilityCache::global();
        let b = CapabilityCache::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
