//! # Playback Engine
//!
//! Session lifecycle manager and caller-facing API.
//!
//! The engine owns at most one [`Session`] at a time. `load_track` always
//! tears down the previous session first, so two tracks can never feed the
//! sink concurrently. Observable state is published on a `watch` channel and
//! lifecycle events go to the shared [`EventBus`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use core_playback::{LoadOptions, PlaybackEngine};
//! use core_runtime::config::{EndpointConfig, EngineConfig};
//! # use std::sync::Arc;
//! # async fn example(sink: Arc<dyn bridge_traits::PlaybackSink>) -> core_playback::Result<()> {
//! let config = EngineConfig::builder()
//!     .endpoints(EndpointConfig::new("https://media.example.com/v1"))
//!     .build()
//!     .map_err(|e| core_playback::DeliveryError::Config(e.to_string()))?;
//!
//! let engine = PlaybackEngine::new(config, sink);
//! if engine.load_track("track-42", LoadOptions::default()).await {
//!     engine.seek_to(90.0).await?;
//! }
//! engine.cleanup().await;
//! # Ok(())
//! # }
//! ```

use bridge_traits::playback::PlaybackSink;
use core_async::sync::{mpsc, watch};
use core_async::task::{spawn, JoinHandle};
use core_auth::TokenClient;
use core_runtime::config::EngineConfig;
use core_runtime::events::{CoreEvent, EventBus, PlaybackEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::{StreamingConfig, StreamingStats};
use crate::error::{DeliveryError, Result};
use crate::fetch::SegmentFetcher;
use crate::seek::SeekOutcome;
use crate::session::{Session, SessionParts};
use crate::transport::{CapabilityCache, TransportTier};

// ============================================================================
// Caller Types
// ============================================================================

/// Per-load options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadOptions {
    /// The host needs the audio visible to the platform capture path
    /// (visualisers, analysers). Disables segment and playlist tiers on
    /// capture-restricted platforms.
    pub capture_required: bool,
    /// Position to start playback from.
    pub start_position: Duration,
    /// Bitrate estimate overriding the manifest hint and the configured
    /// default.
    pub bytes_per_second: Option<u64>,
    /// Start playing as soon as the sink is ready.
    pub autoplay: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            capture_required: false,
            start_position: Duration::ZERO,
            bytes_per_second: None,
            autoplay: true,
        }
    }
}

impl LoadOptions {
    pub fn with_capture(mut self, required: bool) -> Self {
        self.capture_required = required;
        self
    }

    pub fn with_start_position(mut self, position: Duration) -> Self {
        self.start_position = position;
        self
    }

    pub fn with_bytes_per_second(mut self, bytes_per_second: u64) -> Self {
        self.bytes_per_second = Some(bytes_per_second);
        self
    }

    pub fn with_autoplay(mut self, autoplay: bool) -> Self {
        self.autoplay = autoplay;
        self
    }
}

/// Observable engine state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStatus {
    pub track_id: Option<String>,
    pub is_loading: bool,
    pub is_ready: bool,
    /// Buffering progress, 0-100.
    pub loading_progress: u8,
    /// Set only when every delivery tier failed.
    pub error: Option<String>,
    pub estimated_duration: Option<Duration>,
    pub tier: Option<TransportTier>,
}

// ============================================================================
// PlaybackEngine
// ============================================================================

struct ActiveSession {
    session: Arc<Session>,
    faults: mpsc::UnboundedSender<String>,
    faults_rx: Option<mpsc::UnboundedReceiver<String>>,
    supervisor: Option<JoinHandle<()>>,
}

/// Token-gated audio delivery engine.
pub struct PlaybackEngine {
    config: EngineConfig,
    streaming: StreamingConfig,
    sink: Arc<dyn PlaybackSink>,
    tokens: TokenClient,
    capabilities: Arc<CapabilityCache>,
    status: Arc<watch::Sender<EngineStatus>>,
    stats: Arc<Mutex<StreamingStats>>,
    active: Mutex<Option<ActiveSession>>,
}

impl PlaybackEngine {
    /// Create an engine with the default streaming configuration.
    pub fn new(config: EngineConfig, sink: Arc<dyn PlaybackSink>) -> Self {
        let (status, _) = watch::channel(EngineStatus::default());
        Self {
            tokens: TokenClient::new(&config),
            config,
            streaming: StreamingConfig::default(),
            sink,
            capabilities: Arc::new(CapabilityCache::new()),
            status: Arc::new(status),
            stats: Arc::new(Mutex::new(StreamingStats::default())),
            active: Mutex::new(None),
        }
    }

    /// Replace the streaming configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Config` if the configuration is invalid.
    pub fn with_streaming_config(mut self, streaming: StreamingConfig) -> Result<Self> {
        streaming.validate()?;
        self.streaming = streaming;
        Ok(self)
    }

    /// Use a specific capability cache, e.g. [`CapabilityCache::global`].
    pub fn with_capability_cache(mut self, cache: Arc<CapabilityCache>) -> Self {
        self.capabilities = cache;
        self
    }

    /// Use a preconfigured token client (for example one carrying the
    /// user's session credential).
    pub fn with_token_client(mut self, tokens: TokenClient) -> Self {
        self.tokens = tokens;
        self
    }

    // ------------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------------

    /// Load a track, replacing any current session.
    ///
    /// Returns `true` once the initial window is buffered and the sink is
    /// ready. Returns `false` if every delivery tier failed (see
    /// [`EngineStatus::error`]) or the load was superseded.
    #[instrument(skip(self, options), fields(track_id = %track_id))]
    pub async fn load_track(&self, track_id: &str, options: LoadOptions) -> bool {
        self.cleanup().await;

        let fetcher = SegmentFetcher::new(
            Arc::clone(&self.config.http_client),
            self.tokens.clone(),
            self.config.endpoints.clone(),
            Arc::clone(&self.config.clock),
            self.config.token_expiry_skew,
            self.streaming.request_timeout,
        )
        .with_stats(Arc::clone(&self.stats));

        let session = Arc::new(Session::new(SessionParts {
            track_id: track_id.to_string(),
            options,
            streaming: self.streaming.clone(),
            endpoints: self.config.endpoints.clone(),
            http_client: Arc::clone(&self.config.http_client),
            tokens: self.tokens.clone(),
            fetcher,
            sink: Arc::clone(&self.sink),
            capabilities: Arc::clone(&self.capabilities),
            events: self.config.event_bus.clone(),
            status: Arc::clone(&self.status),
            stats: Arc::clone(&self.stats),
        }));

        let (faults, faults_rx) = mpsc::unbounded_channel();
        {
            let mut active = self.active.lock();
            if let Some(previous) = active.take() {
                // Another load raced in between cleanup and here.
                previous.session.cancel();
                if let Some(handle) = previous.supervisor {
                    handle.abort();
                }
            }
            *active = Some(ActiveSession {
                session: Arc::clone(&session),
                faults,
                faults_rx: Some(faults_rx),
                supervisor: None,
            });
        }

        match session.load().await {
            Ok(tier) => {
                let mut active = self.active.lock();
                match active.as_mut() {
                    Some(current) if current.session.id() == session.id() && !session.is_cancelled() => {
                        if let Some(faults_rx) = current.faults_rx.take() {
                            current.supervisor =
                                Some(spawn(Arc::clone(&session).supervise(faults_rx)));
                        }
                        debug!(tier = %tier, "Session supervisor started");
                        true
                    }
                    _ => {
                        debug!("Load superseded");
                        false
                    }
                }
            }
            Err(DeliveryError::Cancelled) => {
                debug!("Load cancelled");
                false
            }
            Err(e) => {
                warn!(error = %e, "Track load failed");
                false
            }
        }
    }

    /// Tear down the current session. Idempotent.
    ///
    /// Cancels outstanding fetches and timers, aborts the session task,
    /// releases assembled buffers, detaches the sink and resets the status.
    pub async fn cleanup(&self) {
        let active = self.active.lock().take();

        if let Some(active) = active {
            info!(track_id = %active.session.track_id(), "Releasing playback session");
            active.session.cancel();
            if let Some(handle) = active.supervisor {
                handle.abort();
            }
            drop(active.faults);
            active.session.release().await;

            self.config
                .event_bus
                .emit(CoreEvent::Playback(PlaybackEvent::Stopped {
                    track_id: Some(active.session.track_id().to_string()),
                }))
                .ok();
        }

        self.status.send_replace(EngineStatus::default());
    }

    /// Move the playhead to `seconds`.
    ///
    /// Negative or NaN values seek to the start. Values past the end of
    /// the track seek to its estimated end.
    pub async fn seek_to(&self, seconds: f64) -> Result<SeekOutcome> {
        let position = if seconds.is_nan() || seconds <= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
        };
        self.seek_to_position(position).await
    }

    /// Move the playhead to `position`.
    #[instrument(skip(self))]
    pub async fn seek_to_position(&self, position: Duration) -> Result<SeekOutcome> {
        let session = self.current_session().ok_or(DeliveryError::NoTrackLoaded)?;
        session.seek_to(position).await
    }

    /// Report an asynchronous playback fault from the host (decode error,
    /// media element failure). The engine answers by downgrading the
    /// delivery tier.
    ///
    /// Returns `false` when no session is active.
    pub fn notify_playback_error(&self, reason: impl Into<String>) -> bool {
        let active = self.active.lock();
        match active.as_ref() {
            Some(active) => active.faults.send(reason.into()).is_ok(),
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    /// Snapshot of the observable state.
    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    /// Follow state changes.
    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.status.borrow().is_loading
    }

    pub fn is_ready(&self) -> bool {
        self.status.borrow().is_ready
    }

    pub fn loading_progress(&self) -> u8 {
        self.status.borrow().loading_progress
    }

    pub fn error(&self) -> Option<String> {
        self.status.borrow().error.clone()
    }

    pub fn estimated_duration(&self) -> Option<Duration> {
        self.status.borrow().estimated_duration
    }

    /// Delivery tier of the current session.
    pub fn current_tier(&self) -> Option<TransportTier> {
        self.current_session().and_then(|session| session.tier())
    }

    /// Tiers the current session has attempted, in order.
    pub fn tier_history(&self) -> Vec<TransportTier> {
        self.current_session()
            .map(|session| session.tier_history())
            .unwrap_or_default()
    }

    /// Segment indices delivered to the sink by the current tier.
    pub fn loaded_segments(&self) -> Vec<usize> {
        self.current_session()
            .map(|session| session.loaded_segments())
            .unwrap_or_default()
    }

    /// Pipeline counters accumulated over the engine's lifetime.
    pub fn stats(&self) -> StreamingStats {
        self.stats.lock().clone()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.config.event_bus
    }

    pub fn streaming_config(&self) -> &StreamingConfig {
        &self.streaming
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        self.active
            .lock()
            .as_ref()
            .map(|active| Arc::clone(&active.session))
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.session.cancel();
            if let Some(handle) = active.supervisor {
                handle.abort();
            }
        }
    }
}

impl std::fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackEngine")
            .field("streaming", &self.streaming)
            .field("status", &*self.status.borrow())
            .finish()
    }
}
