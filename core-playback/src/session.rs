//! # Playback Session
//!
//! One session delivers one track. It negotiates access (grant, manifest,
//! sink capabilities), establishes the best delivery tier, and for the
//! segmented tier runs the look-ahead scheduler on a single background task.
//!
//! ## Lifecycle
//!
//! ```text
//!  load() ──> negotiate ──> establish(tier) ──ok──> ready
//!                                │                    │
//!                              error              supervise()
//!                                │              ┌─────┴──────┐
//!                                ▼              ▼            ▼
//!                         next tier ...   scheduler     host fault
//!                                │         stall            │
//!                                ▼              └─> fail_over ┘
//!                         terminal failure
//! ```
//!
//! Every suspension point checks the session's cancellation token, and every
//! status write is dropped once the token fires, so a superseded session can
//! never touch the state of its successor.

use bridge_traits::http::{HttpClient, HttpRequest};
use bridge_traits::playback::{AudioSource, PlaybackOptions, PlaybackSessionId, PlaybackSink};
use bytes::{BufMut, Bytes, BytesMut};
use core_async::sync::{mpsc, watch, CancellationToken, Notify};
use core_async::task::yield_now;
use core_async::time::{sleep, timeout};
use core_auth::TokenClient;
use core_runtime::config::{with_token_query, EndpointConfig};
use core_runtime::events::{CoreEvent, EventBus, PlaybackEvent, TransportEvent};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{StreamingConfig, StreamingStats};
use crate::engine::{EngineStatus, LoadOptions};
use crate::error::{DeliveryError, Result};
use crate::fetch::{SegmentFetcher, TrackAccess};
use crate::manifest::Manifest;
use crate::seek::{SeekOutcome, SeekTarget};
use crate::transport::{CapabilityCache, SelectionContext, TransportSelector, TransportTier};

/// Everything a session borrows from its engine.
pub(crate) struct SessionParts {
    pub track_id: String,
    pub options: LoadOptions,
    pub streaming: StreamingConfig,
    pub endpoints: EndpointConfig,
    pub http_client: Arc<dyn HttpClient>,
    pub tokens: TokenClient,
    pub fetcher: SegmentFetcher,
    pub sink: Arc<dyn PlaybackSink>,
    pub capabilities: Arc<CapabilityCache>,
    pub events: EventBus,
    pub status: Arc<watch::Sender<EngineStatus>>,
    pub stats: Arc<Mutex<StreamingStats>>,
}

/// Mutable per-session state.
struct SessionState {
    manifest: Option<Arc<Manifest>>,
    bytes_per_second: u64,
    selector: TransportSelector,
    tier: Option<TransportTier>,
    /// Segments handed to the sink by the current tier.
    loaded: BTreeSet<usize>,
    pending_seek: Option<SeekTarget>,
    /// Last known good playhead position.
    last_position: Duration,
    end_of_stream_sent: bool,
    assembled: Option<Bytes>,
}

pub(crate) struct Session {
    id: PlaybackSessionId,
    track_id: String,
    options: LoadOptions,
    streaming: StreamingConfig,
    endpoints: EndpointConfig,
    http_client: Arc<dyn HttpClient>,
    tokens: TokenClient,
    fetcher: SegmentFetcher,
    sink: Arc<dyn PlaybackSink>,
    capabilities: Arc<CapabilityCache>,
    events: EventBus,
    status: Arc<watch::Sender<EngineStatus>>,
    stats: Arc<Mutex<StreamingStats>>,
    access: TrackAccess,
    cancel: CancellationToken,
    seek_signal: Notify,
    state: Mutex<SessionState>,
}

/// Why the supervisor woke up.
enum Wake {
    Cancelled,
    SchedulerDone,
    Fault(String),
}

impl Session {
    pub(crate) fn new(parts: SessionParts) -> Self {
        let bytes_per_second = parts.streaming.bytes_per_second;
        let last_position = parts.options.start_position;

        Self {
            id: PlaybackSessionId::new(),
            access: TrackAccess::new(parts.track_id.clone(), None),
            track_id: parts.track_id,
            options: parts.options,
            streaming: parts.streaming,
            endpoints: parts.endpoints,
            http_client: parts.http_client,
            tokens: parts.tokens,
            fetcher: parts.fetcher,
            sink: parts.sink,
            capabilities: parts.capabilities,
            events: parts.events,
            status: parts.status,
            stats: parts.stats,
            cancel: CancellationToken::new(),
            seek_signal: Notify::new(),
            state: Mutex::new(SessionState {
                manifest: None,
                bytes_per_second,
                selector: TransportSelector::new(SelectionContext::default()),
                tier: None,
                loaded: BTreeSet::new(),
                pending_seek: None,
                last_position,
                end_of_stream_sent: false,
                assembled: None,
            }),
        }
    }

    pub(crate) fn id(&self) -> PlaybackSessionId {
        self.id
    }

    pub(crate) fn track_id(&self) -> &str {
        &self.track_id
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn tier(&self) -> Option<TransportTier> {
        self.state.lock().tier
    }

    pub(crate) fn tier_history(&self) -> Vec<TransportTier> {
        self.state.lock().selector.history().to_vec()
    }

    pub(crate) fn loaded_segments(&self) -> Vec<usize> {
        self.state.lock().loaded.iter().copied().collect()
    }

    // ========================================================================
    // Negotiation
    // ========================================================================

    /// Negotiate access and start the best tier that works.
    #[instrument(skip(self), fields(track_id = %self.track_id, session = %self.id))]
    pub(crate) async fn load(&self) -> Result<TransportTier> {
        info!("Loading track");
        self.emit_playback(PlaybackEvent::Loading {
            track_id: self.track_id.clone(),
        });
        self.update_status(|status| {
            status.track_id = Some(self.track_id.clone());
            status.is_loading = true;
        });

        let capabilities = self.capabilities.get_or_probe(self.sink.as_ref()).await;
        self.check_cancelled()?;

        let grant = core_async::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DeliveryError::Cancelled),
            grant = self.tokens.fetch_token(&self.track_id) => grant,
        };
        match grant {
            Some(grant) => self.access.replace_grant(grant),
            None => warn!("No track grant; relying on per-segment credentials"),
        }

        let manifest = self.fetch_manifest().await?.map(Arc::new);
        let bytes_per_second = self
            .options
            .bytes_per_second
            .or_else(|| manifest.as_ref().and_then(|m| m.bytes_per_second))
            .unwrap_or(self.streaming.bytes_per_second);
        let estimated_duration = manifest
            .as_ref()
            .map(|m| m.estimated_duration(bytes_per_second));

        let context = SelectionContext {
            capabilities,
            has_manifest: manifest.is_some(),
            capture_required: self.options.capture_required,
        };
        let mut selector = TransportSelector::new(context);
        let initial = selector.select_initial();

        for (tier, reason) in selector.skipped() {
            self.emit_transport(TransportEvent::Skipped {
                track_id: self.track_id.clone(),
                tier: tier.to_string(),
                reason: reason.clone(),
            });
        }

        {
            let mut state = self.state.lock();
            state.manifest = manifest;
            state.bytes_per_second = bytes_per_second;
            state.selector = selector;
        }
        self.update_status(|status| status.estimated_duration = estimated_duration);

        self.establish(initial).await
    }

    async fn fetch_manifest(&self) -> Result<Option<Manifest>> {
        self.check_cancelled()?;

        let url = self.endpoints.manifest_url(&self.track_id);
        let mut request = HttpRequest::get(url)
            .header("Accept", "application/json")
            .timeout(self.streaming.request_timeout);
        if let Some(token) = self.access.token() {
            request = request.bearer_token(token);
        }
        self.stats.lock().http_requests += 1;

        let outcome = core_async::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DeliveryError::Cancelled),
            outcome = timeout(self.streaming.request_timeout, self.http_client.execute(request)) => outcome,
        };

        let parsed = match outcome {
            Err(_) => Err(DeliveryError::FetchFailed("manifest request timed out".to_string())),
            Ok(Err(e)) => Err(DeliveryError::FetchFailed(e.to_string())),
            Ok(Ok(response)) if !response.is_success() => Err(DeliveryError::FetchFailed(
                format!("manifest returned HTTP {}", response.status),
            )),
            Ok(Ok(response)) => response
                .json::<Manifest>()
                .map_err(|e| DeliveryError::InvalidManifest(e.to_string())),
        };

        let validated = parsed.and_then(|manifest| {
            manifest.validate()?;
            if manifest.track_id != self.track_id {
                return Err(DeliveryError::InvalidManifest(format!(
                    "manifest is for track {}",
                    manifest.track_id
                )));
            }
            Ok(manifest)
        });

        match validated {
            Ok(manifest) => {
                debug!(segments = manifest.segment_count(), "Manifest negotiated");
                Ok(Some(manifest))
            }
            Err(e) => {
                warn!(error = %e, "Manifest unavailable; segment tiers disabled");
                Ok(None)
            }
        }
    }

    // ========================================================================
    // Tier Establishment
    // ========================================================================

    /// Start `candidate`, walking down the tiers until one starts.
    ///
    /// Marks the session ready on success and terminally failed when nothing
    /// is left.
    async fn establish(&self, mut candidate: Option<TransportTier>) -> Result<TransportTier> {
        while let Some(tier) = candidate {
            self.check_cancelled()?;
            info!(tier = %tier, "Starting delivery tier");
            self.emit_transport(TransportEvent::Selected {
                track_id: self.track_id.clone(),
                tier: tier.to_string(),
            });
            self.begin_tier(tier);

            match self.start_tier(tier).await {
                Ok(()) => {
                    self.check_cancelled()?;
                    self.mark_ready(tier);
                    return Ok(tier);
                }
                Err(DeliveryError::Cancelled) => return Err(DeliveryError::Cancelled),
                Err(e) => {
                    warn!(tier = %tier, error = %e, "Delivery tier failed to start");
                    self.stats.lock().downgrades += 1;
                    self.teardown_tier().await;
                    candidate = self.state.lock().selector.downgrade();
                    if let Some(next) = candidate {
                        self.emit_transport(TransportEvent::Downgraded {
                            track_id: self.track_id.clone(),
                            from: tier.to_string(),
                            to: next.to_string(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        Err(self.fail_terminally())
    }

    fn begin_tier(&self, tier: TransportTier) {
        let mut state = self.state.lock();
        state.tier = Some(tier);
        state.loaded.clear();
        state.end_of_stream_sent = false;
    }

    fn playback_options(&self) -> PlaybackOptions {
        let state = self.state.lock();
        PlaybackOptions {
            start_position: state
                .pending_seek
                .as_ref()
                .map(|target| target.position)
                .unwrap_or(state.last_position),
            autoplay: self.options.autoplay,
        }
    }

    async fn start_tier(&self, tier: TransportTier) -> Result<()> {
        match tier {
            TransportTier::AdaptiveSegmented => self.start_segmented().await,
            TransportTier::NativePlaylist => {
                let url = self.authorize(self.endpoints.playlist_url(&self.track_id));
                self.open(AudioSource::Playlist { url }).await
            }
            TransportTier::AssembledBuffer => self.start_assembled().await,
            TransportTier::DirectStream => {
                let url = self.authorize(self.endpoints.stream_url(&self.track_id));
                self.open(AudioSource::RemoteStream {
                    url,
                    headers: HashMap::new(),
                })
                .await
            }
        }
    }

    async fn start_segmented(&self) -> Result<()> {
        let manifest = self.manifest()?;
        let total = manifest.segment_count();
        let options = self.playback_options();
        let estimated_duration = manifest.estimated_duration(self.bytes_per_second());

        self.open_with(
            AudioSource::Segmented {
                track_id: self.track_id.clone(),
                segment_count: total,
                estimated_duration,
            },
            options,
        )
        .await?;

        let window: Vec<usize> = if options.start_position.is_zero() {
            (0..self.streaming.initial_window.min(total)).collect()
        } else {
            let target = SeekTarget::plan(
                options.start_position,
                self.bytes_per_second(),
                &manifest,
                self.streaming.initial_window,
            );
            target.window.collect()
        };

        let mut delivered = 0usize;
        for index in window {
            self.check_cancelled()?;
            if let Some(bytes) = self
                .fetcher
                .fetch_segment(&self.access, &manifest, &manifest.segments[index], &self.cancel)
                .await
            {
                self.append(index, bytes, total).await?;
                delivered += 1;
            }
        }
        self.check_cancelled()?;

        if delivered == 0 {
            return Err(DeliveryError::FetchFailed(
                "initial window could not be loaded".to_string(),
            ));
        }

        debug!(delivered, "Initial window buffered");
        Ok(())
    }

    async fn start_assembled(&self) -> Result<()> {
        let manifest = self.manifest()?;
        let total = manifest.segment_count();
        let mut parts: BTreeMap<usize, Bytes> = BTreeMap::new();

        for pass in 0..self.streaming.max_fetch_passes {
            if pass > 0 {
                self.pause(self.streaming.retry_delay).await?;
            }
            for segment in &manifest.segments {
                if parts.contains_key(&segment.index) {
                    continue;
                }
                self.check_cancelled()?;
                if let Some(bytes) = self
                    .fetcher
                    .fetch_segment(&self.access, &manifest, segment, &self.cancel)
                    .await
                {
                    parts.insert(segment.index, bytes);
                    self.record_loaded(segment.index, total);
                }
                self.pause(self.streaming.pacing_delay).await?;
            }
            if parts.len() == total {
                break;
            }
        }
        self.check_cancelled()?;

        if parts.len() < total {
            return Err(DeliveryError::FetchFailed(format!(
                "{} of {} segments unavailable for assembly",
                total - parts.len(),
                total
            )));
        }

        let size = parts.values().map(Bytes::len).sum();
        let mut buffer = BytesMut::with_capacity(size);
        for part in parts.values() {
            buffer.put_slice(part);
        }
        let data = buffer.freeze();
        debug!(bytes = data.len(), "Assembled local buffer");

        self.state.lock().assembled = Some(data.clone());
        self.open(AudioSource::MemoryBuffer { data }).await
    }

    async fn open(&self, source: AudioSource) -> Result<()> {
        let options = self.playback_options();
        self.open_with(source, options).await
    }

    async fn open_with(&self, source: AudioSource, options: PlaybackOptions) -> Result<()> {
        self.check_cancelled()?;
        debug!(source = source.kind(), "Opening sink");
        self.sink
            .open(self.id, source, options)
            .await
            .map_err(DeliveryError::from_sink)?;
        self.check_cancelled()
    }

    fn authorize(&self, url: String) -> String {
        match self.access.token() {
            Some(token) => with_token_query(&url, &token),
            None => url,
        }
    }

    fn mark_ready(&self, tier: TransportTier) {
        let (progress, duration) = {
            let state = self.state.lock();
            let progress = match (tier, &state.manifest) {
                (TransportTier::AdaptiveSegmented, Some(manifest)) => {
                    percent(state.loaded.len(), manifest.segment_count())
                }
                _ => 100,
            };
            let duration = state
                .manifest
                .as_ref()
                .map(|m| m.estimated_duration(state.bytes_per_second));
            (progress, duration)
        };

        info!(tier = %tier, "Playback ready");
        self.update_status(|status| {
            status.is_loading = false;
            status.is_ready = true;
            status.error = None;
            status.tier = Some(tier);
            status.loading_progress = progress;
        });
        self.emit_playback(PlaybackEvent::Ready {
            track_id: self.track_id.clone(),
            tier: tier.to_string(),
            duration_ms: duration.map(|d| d.as_millis() as u64).unwrap_or(0),
        });
    }

    fn fail_terminally(&self) -> DeliveryError {
        let message = format!("all delivery tiers failed for track {}", self.track_id);
        error!(track_id = %self.track_id, "All delivery tiers failed");

        self.state.lock().tier = None;
        self.update_status(|status| {
            status.is_loading = false;
            status.is_ready = false;
            status.tier = None;
            status.error = Some(message.clone());
        });
        self.emit_transport(TransportEvent::Exhausted {
            track_id: self.track_id.clone(),
        });
        self.emit_playback(PlaybackEvent::Error {
            track_id: Some(self.track_id.clone()),
            message: message.clone(),
            recoverable: false,
        });

        DeliveryError::TerminalFailure(message)
    }

    // ========================================================================
    // Supervision
    // ========================================================================

    /// Background task: runs the scheduler for the segmented tier and
    /// answers fatal errors with a downgrade.
    pub(crate) async fn supervise(self: Arc<Self>, mut faults: mpsc::UnboundedReceiver<String>) {
        let mut scheduler_done = self.tier() != Some(TransportTier::AdaptiveSegmented);

        loop {
            let wake = if scheduler_done {
                core_async::select! {
                    biased;
                    _ = self.cancel.cancelled() => Wake::Cancelled,
                    fault = faults.recv() => fault.map(Wake::Fault).unwrap_or(Wake::Cancelled),
                }
            } else {
                core_async::select! {
                    biased;
                    _ = self.cancel.cancelled() => Wake::Cancelled,
                    fault = faults.recv() => fault.map(Wake::Fault).unwrap_or(Wake::Cancelled),
                    outcome = self.run_scheduler() => match outcome {
                        Ok(()) => Wake::SchedulerDone,
                        Err(DeliveryError::Cancelled) => Wake::Cancelled,
                        Err(e) => Wake::Fault(e.to_string()),
                    },
                }
            };

            match wake {
                Wake::Cancelled => {
                    debug!("Supervisor stopping");
                    return;
                }
                Wake::SchedulerDone => scheduler_done = true,
                Wake::Fault(reason) => {
                    let recovered = self.fail_over(reason).await;
                    // Faults queued during the downgrade refer to the old tier.
                    while faults.try_recv().is_ok() {}
                    match recovered {
                        Some(tier) => scheduler_done = tier != TransportTier::AdaptiveSegmented,
                        None => return,
                    }
                }
            }
        }
    }

    /// Tear down the current tier and move to the next eligible one,
    /// resuming from the last known good position.
    async fn fail_over(&self, reason: String) -> Option<TransportTier> {
        if self.is_cancelled() {
            return None;
        }
        let from = self.tier()?;
        warn!(tier = %from, reason = %reason, "Fatal playback error; downgrading");

        let resume = self.resume_position().await;
        {
            let mut state = self.state.lock();
            state.last_position = resume;
            state.pending_seek = None;
        }
        self.stats.lock().downgrades += 1;

        self.emit_playback(PlaybackEvent::Error {
            track_id: Some(self.track_id.clone()),
            message: reason.clone(),
            recoverable: true,
        });
        self.update_status(|status| {
            status.is_loading = true;
            status.is_ready = false;
            status.loading_progress = 0;
        });

        self.teardown_tier().await;

        let next = self.state.lock().selector.downgrade();
        if let Some(next) = next {
            self.emit_transport(TransportEvent::Downgraded {
                track_id: self.track_id.clone(),
                from: from.to_string(),
                to: next.to_string(),
                reason,
            });
        }

        self.establish(next).await.ok()
    }

    async fn resume_position(&self) -> Duration {
        let pending = self.state.lock().pending_seek.as_ref().map(|t| t.position);
        if let Some(position) = pending {
            return position;
        }
        match self.sink.position(self.id).await {
            Ok(position) => position,
            Err(_) => self.state.lock().last_position,
        }
    }

    /// Detach the sink and drop everything the current tier holds.
    async fn teardown_tier(&self) {
        if let Err(e) = self.sink.detach(self.id).await {
            debug!(error = %e, "Sink detach failed");
        }
        let mut state = self.state.lock();
        state.loaded.clear();
        state.assembled = None;
        state.end_of_stream_sent = false;
    }

    /// Cancel outstanding work and release every resource. Idempotent.
    pub(crate) async fn release(&self) {
        self.cancel.cancel();
        if let Err(e) = self.sink.detach(self.id).await {
            debug!(error = %e, "Sink detach failed");
        }
        let mut state = self.state.lock();
        state.loaded.clear();
        state.pending_seek = None;
        state.assembled = None;
        state.tier = None;
    }

    // ========================================================================
    // Look-Ahead Scheduler
    // ========================================================================

    /// Fill the sink in ascending segment order.
    ///
    /// Returns once every segment is appended and end-of-stream is signalled.
    /// A stall (gaps left after the configured number of passes) is returned
    /// as `DecodeFatal`.
    pub(crate) async fn run_scheduler(&self) -> Result<()> {
        let manifest = self.manifest()?;
        let total = manifest.segment_count();
        let mut failed_this_pass: BTreeSet<usize> = BTreeSet::new();
        let mut passes = 0u32;

        debug!(total, "Scheduler started");

        loop {
            self.check_cancelled()?;

            let pending = self.state.lock().pending_seek.take();
            if let Some(target) = pending {
                self.service_seek(&manifest, target).await?;
                continue;
            }

            let next = {
                let state = self.state.lock();
                (0..total).find(|index| {
                    !state.loaded.contains(index) && !failed_this_pass.contains(index)
                })
            };

            let Some(index) = next else {
                let loaded = self.state.lock().loaded.len();
                if loaded == total {
                    return self.finish_stream().await;
                }

                passes += 1;
                if passes >= self.streaming.max_fetch_passes {
                    return Err(DeliveryError::DecodeFatal(format!(
                        "stalled with {} of {} segments missing",
                        total - loaded,
                        total
                    )));
                }
                debug!(pass = passes, missing = total - loaded, "Retrying failed segments");
                failed_this_pass.clear();
                self.pause(self.streaming.retry_delay).await?;
                continue;
            };

            if self.horizon_reached(&manifest, index).await {
                self.pause(self.streaming.throttle_interval).await?;
                continue;
            }

            match self
                .fetcher
                .fetch_segment(&self.access, &manifest, &manifest.segments[index], &self.cancel)
                .await
            {
                Some(bytes) => self.append(index, bytes, total).await?,
                None => {
                    self.check_cancelled()?;
                    failed_this_pass.insert(index);
                }
            }

            self.pause(self.streaming.pacing_delay).await?;
        }
    }

    /// Whether fetching `index` would push the buffer past the horizon.
    async fn horizon_reached(&self, manifest: &Manifest, index: usize) -> bool {
        let position = self.playhead().await;
        let state = self.state.lock();
        let bytes_per_second = state.bytes_per_second.max(1);
        let offset = (position.as_secs_f64() * bytes_per_second as f64) as u64;
        let playhead_index = manifest.index_for_offset(offset);

        if index <= playhead_index {
            return false;
        }

        let mut run_end = None;
        let mut cursor = playhead_index;
        while cursor < manifest.segment_count() && state.loaded.contains(&cursor) {
            run_end = Some(cursor);
            cursor += 1;
        }

        let ahead_bytes = run_end
            .map(|end| (manifest.segments[end].end + 1).saturating_sub(offset))
            .unwrap_or(0);
        let ahead = Duration::from_secs_f64(ahead_bytes as f64 / bytes_per_second as f64);

        ahead >= self.streaming.buffer_horizon
    }

    async fn playhead(&self) -> Duration {
        match self.sink.position(self.id).await {
            Ok(position) => {
                self.state.lock().last_position = position;
                position
            }
            Err(_) => self.state.lock().last_position,
        }
    }

    /// Load the seek window out of order, then move the sink playhead.
    ///
    /// Abandoned without seeking when a newer seek arrives.
    async fn service_seek(&self, manifest: &Manifest, target: SeekTarget) -> Result<()> {
        let total = manifest.segment_count();
        debug!(index = target.index, window = ?target.window, "Servicing pending seek");

        for attempt in 0..self.streaming.max_fetch_passes {
            let missing = target.missing(&self.state.lock().loaded);
            if missing.is_empty() {
                break;
            }
            if attempt > 0 {
                self.pause(self.streaming.retry_delay).await?;
            }

            for index in missing {
                self.check_cancelled()?;
                if self.state.lock().pending_seek.is_some() {
                    debug!("Seek superseded");
                    return Ok(());
                }
                if let Some(bytes) = self
                    .fetcher
                    .fetch_segment(&self.access, manifest, &manifest.segments[index], &self.cancel)
                    .await
                {
                    self.append(index, bytes, total).await?;
                } else {
                    // Later window segments wait so the sink sees them in order.
                    break;
                }
            }
        }

        self.check_cancelled()?;
        if self.state.lock().pending_seek.is_some() {
            return Ok(());
        }
        if !target.is_buffered(&self.state.lock().loaded) {
            warn!(index = target.index, "Seek window incomplete; seeking anyway");
        }

        self.sink
            .seek(self.id, target.position)
            .await
            .map_err(DeliveryError::from_sink)?;
        self.state.lock().last_position = target.position;
        self.emit_playback(PlaybackEvent::SeekCompleted {
            track_id: self.track_id.clone(),
            position_ms: target.position.as_millis() as u64,
        });
        Ok(())
    }

    async fn finish_stream(&self) -> Result<()> {
        let first = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.end_of_stream_sent, true)
        };
        if !first {
            return Ok(());
        }

        self.sink
            .end_of_stream(self.id)
            .await
            .map_err(DeliveryError::from_sink)?;
        info!("All segments delivered");
        self.emit_playback(PlaybackEvent::EndOfStream {
            track_id: self.track_id.clone(),
        });
        Ok(())
    }

    async fn append(&self, index: usize, bytes: Bytes, total: usize) -> Result<()> {
        self.check_cancelled()?;
        self.sink
            .append_segment(self.id, index, bytes)
            .await
            .map_err(DeliveryError::from_sink)?;
        self.check_cancelled()?;
        self.record_loaded(index, total);
        Ok(())
    }

    fn record_loaded(&self, index: usize, total: usize) {
        let loaded = {
            let mut state = self.state.lock();
            if !state.loaded.insert(index) {
                return;
            }
            state.loaded.len()
        };
        self.stats.lock().segments_loaded += 1;

        let progress = percent(loaded, total);
        self.update_status(|status| status.loading_progress = progress);
        self.emit_playback(PlaybackEvent::Progress {
            track_id: self.track_id.clone(),
            loaded_segments: loaded as u64,
            total_segments: total as u64,
            percent: progress,
        });
    }

    /// Sleep for `duration`, waking early for a seek or cancellation.
    async fn pause(&self, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            yield_now().await;
            return self.check_cancelled();
        }

        core_async::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DeliveryError::Cancelled),
            _ = self.seek_signal.notified() => Ok(()),
            _ = sleep(duration) => Ok(()),
        }
    }

    // ========================================================================
    // Seeking
    // ========================================================================

    pub(crate) async fn seek_to(&self, position: Duration) -> Result<SeekOutcome> {
        self.check_cancelled()?;
        let tier = self.tier().ok_or(DeliveryError::NoTrackLoaded)?;

        let estimated = self.status.borrow().estimated_duration;
        let position = match estimated {
            Some(duration) => position.min(duration),
            None => position,
        };

        match tier {
            TransportTier::NativePlaylist | TransportTier::DirectStream => {
                self.sink_seek(position).await?;
                Ok(SeekOutcome::Delegated)
            }
            TransportTier::AssembledBuffer => {
                self.sink_seek(position).await?;
                Ok(SeekOutcome::Immediate)
            }
            TransportTier::AdaptiveSegmented => {
                let manifest = self.manifest()?;
                let target = {
                    let mut state = self.state.lock();
                    let target = SeekTarget::plan(
                        position,
                        state.bytes_per_second,
                        &manifest,
                        self.streaming.seek_window,
                    );
                    state.last_position = position;
                    if target.is_buffered(&state.loaded) {
                        state.pending_seek = None;
                        None
                    } else {
                        state.pending_seek = Some(target.clone());
                        Some(target)
                    }
                };

                match target {
                    None => {
                        self.sink_seek(position).await?;
                        Ok(SeekOutcome::Immediate)
                    }
                    Some(target) => {
                        debug!(index = target.index, "Seek pending");
                        self.emit_playback(PlaybackEvent::SeekPending {
                            track_id: self.track_id.clone(),
                            position_ms: position.as_millis() as u64,
                            segment: target.index as u64,
                        });
                        self.seek_signal.notify_one();
                        Ok(SeekOutcome::Pending)
                    }
                }
            }
        }
    }

    async fn sink_seek(&self, position: Duration) -> Result<()> {
        self.sink
            .seek(self.id, position)
            .await
            .map_err(DeliveryError::from_sink)?;
        self.state.lock().last_position = position;
        self.emit_playback(PlaybackEvent::SeekCompleted {
            track_id: self.track_id.clone(),
            position_ms: position.as_millis() as u64,
        });
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn manifest(&self) -> Result<Arc<Manifest>> {
        self.state
            .lock()
            .manifest
            .clone()
            .ok_or_else(|| DeliveryError::InvalidManifest("no manifest negotiated".to_string()))
    }

    fn bytes_per_second(&self) -> u64 {
        self.state.lock().bytes_per_second
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(DeliveryError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Apply `update` unless the session has been cancelled.
    fn update_status(&self, update: impl FnOnce(&mut EngineStatus)) {
        let cancel = &self.cancel;
        self.status.send_if_modified(|status| {
            if cancel.is_cancelled() {
                return false;
            }
            update(status);
            true
        });
    }

    fn emit_playback(&self, event: PlaybackEvent) {
        if !self.is_cancelled() {
            self.events.emit(CoreEvent::Playback(event)).ok();
        }
    }

    fn emit_transport(&self, event: TransportEvent) {
        if !self.is_cancelled() {
            self.events.emit(CoreEvent::Transport(event)).ok();
        }
    }
}

fn percent(loaded: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((loaded * 100) / total).min(100) as u8
}
