//! Shared fakes for engine integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
use bridge_traits::playback::{
    AudioSource, PlaybackOptions, PlaybackSessionId, PlaybackSink, SinkCapabilities,
};
use bytes::Bytes;
use core_playback::crypto::{deobfuscate, seal, SegmentKey, HEADER_LEN, NONCE_LEN};
use core_playback::{Addressing, CipherScheme, Manifest, PlaybackEngine, StreamingConfig};
use core_runtime::config::{EndpointConfig, EngineConfig};
use core_runtime::events::{CoreEvent, EventBus, Receiver};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BASE_URL: &str = "https://media.test/v1";
pub const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
pub const TRACK_TOKEN: &str = "track-token";
pub const FRESH_TOKEN: &str = "fresh-token";
pub const PLAIN_LEN: usize = 1000;
pub const SEALED_LEN: u64 = (PLAIN_LEN + HEADER_LEN) as u64;

/// Plaintext of segment `index`.
pub fn plaintext(index: usize) -> Vec<u8> {
    vec![(index % 251) as u8; PLAIN_LEN]
}

// ============================================================================
// Fake media service
// ============================================================================

#[derive(Default)]
struct BackendState {
    segment_count: usize,
    bytes_per_second: Option<u64>,
    manifest_status: Option<u16>,
    failing_segments: HashSet<usize>,
    /// Segments that refuse `TRACK_TOKEN` with 401.
    expired_segments: HashSet<usize>,
    scheme: CipherScheme,
    addressing: Addressing,
    /// Latency added to every segment body request.
    segment_delay: Option<Duration>,
    requests: Vec<String>,
}

/// Serves tokens, manifests and AES-GCM sealed segments for any track id.
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
}

impl FakeBackend {
    pub fn new(segment_count: usize) -> Self {
        let backend = Self::default();
        backend.state.lock().unwrap().segment_count = segment_count;
        backend
    }

    pub fn with_bytes_per_second(self, bytes_per_second: u64) -> Self {
        self.state.lock().unwrap().bytes_per_second = Some(bytes_per_second);
        self
    }

    pub fn with_scheme(self, scheme: CipherScheme) -> Self {
        self.state.lock().unwrap().scheme = scheme;
        self
    }

    pub fn with_addressing(self, addressing: Addressing) -> Self {
        self.state.lock().unwrap().addressing = addressing;
        self
    }

    pub fn with_segment_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().segment_delay = Some(delay);
        self
    }

    pub fn fail_manifest(&self, status: u16) {
        self.state.lock().unwrap().manifest_status = Some(status);
    }

    pub fn fail_segment(&self, index: usize) {
        self.state.lock().unwrap().failing_segments.insert(index);
    }

    pub fn heal_segment(&self, index: usize) {
        self.state.lock().unwrap().failing_segments.remove(&index);
    }

    pub fn expire_segment(&self, index: usize) {
        self.state.lock().unwrap().expired_segments.insert(index);
    }

    /// Request paths (query stripped) in arrival order.
    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn count_requests(&self, path: &str) -> usize {
        self.requests().iter().filter(|p| p.as_str() == path).count()
    }

    pub fn manifest(&self, track_id: &str) -> Manifest {
        let state = self.state.lock().unwrap();
        let segment_len = Self::segment_len(state.scheme);
        let mut manifest = Manifest::plan(
            track_id,
            segment_len * state.segment_count as u64,
            segment_len,
            None,
            |_| None,
        )
        .unwrap();
        manifest.bytes_per_second = state.bytes_per_second;
        manifest.scheme = state.scheme;
        manifest.addressing = state.addressing;
        manifest
    }

    fn segment_len(scheme: CipherScheme) -> u64 {
        match scheme {
            CipherScheme::AesGcm => SEALED_LEN,
            CipherScheme::Xor => PLAIN_LEN as u64,
        }
    }

    /// Wire bytes of segment `index` under `scheme`.
    fn encoded_segment(scheme: CipherScheme, index: usize) -> Bytes {
        let key = SegmentKey::from_hex(KEY_HEX).unwrap();
        match scheme {
            CipherScheme::AesGcm => {
                seal(&plaintext(index), &key, &[index as u8; NONCE_LEN]).unwrap()
            }
            CipherScheme::Xor => deobfuscate(&plaintext(index), key.as_bytes()).unwrap(),
        }
    }

    /// The whole encrypted resource, or the `Range` slice of it as a 206.
    fn stream(state: &BackendState, range: Option<&String>) -> HttpResponse {
        let mut resource = Vec::new();
        for index in 0..state.segment_count {
            resource.extend_from_slice(&Self::encoded_segment(state.scheme, index));
        }

        let Some(range) = range else {
            return HttpResponse::new(200, resource);
        };
        let bounds = range
            .strip_prefix("bytes=")
            .and_then(|spec| spec.split_once('-'))
            .and_then(|(start, end)| {
                Some((start.parse::<usize>().ok()?, end.parse::<usize>().ok()?))
            });
        match bounds {
            Some((start, end)) if start <= end && end < resource.len() => {
                HttpResponse::new(206, resource[start..=end].to_vec())
            }
            _ => HttpResponse::new(416, ""),
        }
    }

    fn grant(token: &str) -> HttpResponse {
        let body = serde_json::json!({ "token": token, "key": KEY_HEX });
        HttpResponse::new(200, body.to_string())
    }

    fn route(&self, request: &HttpRequest) -> HttpResponse {
        let (path, query) = match request.url.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (request.url.clone(), String::new()),
        };
        let path = path.trim_start_matches(BASE_URL).to_string();
        self.state.lock().unwrap().requests.push(path.clone());

        let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        match parts.as_slice() {
            ["tracks", _, "token"] => Self::grant(TRACK_TOKEN),
            ["tracks", _, "segments", _, "token"] => Self::grant(FRESH_TOKEN),
            ["tracks", track_id, "manifest"] => {
                if let Some(status) = self.state.lock().unwrap().manifest_status {
                    return HttpResponse::new(status, "");
                }
                let manifest = self.manifest(track_id);
                HttpResponse::new(200, serde_json::to_string(&manifest).unwrap())
            }
            ["tracks", _, "stream"] => {
                let state = self.state.lock().unwrap();
                if state.failing_segments.is_empty() {
                    Self::stream(&state, request.headers.get("Range"))
                } else {
                    HttpResponse::new(503, "")
                }
            }
            ["tracks", _, "segments", index] => {
                let Ok(index) = index.parse::<usize>() else {
                    return HttpResponse::new(404, "");
                };
                let state = self.state.lock().unwrap();
                if index >= state.segment_count {
                    return HttpResponse::new(404, "");
                }
                if state.failing_segments.contains(&index) {
                    return HttpResponse::new(503, "");
                }
                let presented = format!("token={}", TRACK_TOKEN);
                if state.expired_segments.contains(&index) && query.contains(&presented) {
                    return HttpResponse::new(401, "");
                }
                HttpResponse::new(200, Self::encoded_segment(state.scheme, index))
            }
            _ => HttpResponse::new(404, ""),
        }
    }
}

#[async_trait]
impl HttpClient for FakeBackend {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        let delay = self.state.lock().unwrap().segment_delay;
        if let Some(delay) = delay {
            if is_segment_body(&request.url) {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(self.route(&request))
    }
}

fn is_segment_body(url: &str) -> bool {
    let path = url.split('?').next().unwrap_or_default();
    let parts: Vec<&str> = path.trim_start_matches(BASE_URL).split('/').collect();
    matches!(
        parts.as_slice(),
        ["", "tracks", _, "segments", _] | ["", "tracks", _, "stream"]
    )
}

// ============================================================================
// Recording sink
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Open {
        session: PlaybackSessionId,
        kind: &'static str,
        start: Duration,
    },
    Append {
        session: PlaybackSessionId,
        index: usize,
        data: Bytes,
    },
    EndOfStream {
        session: PlaybackSessionId,
    },
    Seek {
        session: PlaybackSessionId,
        position: Duration,
    },
    Detach {
        session: PlaybackSessionId,
    },
}

impl SinkCall {
    pub fn session(&self) -> PlaybackSessionId {
        match self {
            SinkCall::Open { session, .. }
            | SinkCall::Append { session, .. }
            | SinkCall::EndOfStream { session }
            | SinkCall::Seek { session, .. }
            | SinkCall::Detach { session } => *session,
        }
    }
}

#[derive(Default)]
struct SinkState {
    calls: Vec<SinkCall>,
    position: Duration,
    reject_append: Option<usize>,
    reject_open: HashSet<&'static str>,
    opened: HashMap<&'static str, AudioSource>,
}

/// Playback sink that records every call.
pub struct RecordingSink {
    capabilities: SinkCapabilities,
    probes: AtomicUsize,
    state: Mutex<SinkState>,
}

impl RecordingSink {
    pub fn new(capabilities: SinkCapabilities) -> Arc<Self> {
        Arc::new(Self {
            capabilities,
            probes: AtomicUsize::new(0),
            state: Mutex::new(SinkState::default()),
        })
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn appended(&self) -> Vec<usize> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SinkCall::Append { index, .. } => Some(index),
                _ => None,
            })
            .collect()
    }

    pub fn opened_kinds(&self) -> Vec<&'static str> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SinkCall::Open { kind, .. } => Some(kind),
                _ => None,
            })
            .collect()
    }

    pub fn opened_source(&self, kind: &'static str) -> Option<AudioSource> {
        self.state.lock().unwrap().opened.get(kind).cloned()
    }

    pub fn end_of_stream_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, SinkCall::EndOfStream { .. }))
            .count()
    }

    pub fn set_position(&self, position: Duration) {
        self.state.lock().unwrap().position = position;
    }

    pub fn reject_append_of(&self, index: usize) {
        self.state.lock().unwrap().reject_append = Some(index);
    }

    pub fn reject_open_of(&self, kind: &'static str) {
        self.state.lock().unwrap().reject_open.insert(kind);
    }

    fn record(&self, call: SinkCall) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl PlaybackSink for RecordingSink {
    async fn probe_capabilities(&self) -> SinkCapabilities {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.capabilities
    }

    async fn open(
        &self,
        session: PlaybackSessionId,
        source: AudioSource,
        options: PlaybackOptions,
    ) -> BridgeResult<()> {
        let kind = source.kind();
        if self.state.lock().unwrap().reject_open.contains(kind) {
            return Err(BridgeError::Rejected(format!("{} unsupported", kind)));
        }
        let mut state = self.state.lock().unwrap();
        state.position = options.start_position;
        state.opened.insert(kind, source);
        state.calls.push(SinkCall::Open {
            session,
            kind,
            start: options.start_position,
        });
        Ok(())
    }

    async fn append_segment(
        &self,
        session: PlaybackSessionId,
        index: usize,
        data: Bytes,
    ) -> BridgeResult<()> {
        if self.state.lock().unwrap().reject_append == Some(index) {
            return Err(BridgeError::Rejected(format!("append of {} refused", index)));
        }
        self.record(SinkCall::Append {
            session,
            index,
            data,
        });
        Ok(())
    }

    async fn end_of_stream(&self, session: PlaybackSessionId) -> BridgeResult<()> {
        self.record(SinkCall::EndOfStream { session });
        Ok(())
    }

    async fn seek(&self, session: PlaybackSessionId, position: Duration) -> BridgeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.position = position;
        state.calls.push(SinkCall::Seek { session, position });
        Ok(())
    }

    async fn position(&self, _session: PlaybackSessionId) -> BridgeResult<Duration> {
        Ok(self.state.lock().unwrap().position)
    }

    async fn detach(&self, session: PlaybackSessionId) -> BridgeResult<()> {
        self.record(SinkCall::Detach { session });
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn engine_config(backend: &FakeBackend, event_bus: EventBus) -> EngineConfig {
    EngineConfig::builder()
        .http_client(Arc::new(backend.clone()))
        .endpoints(EndpointConfig::new(BASE_URL))
        .event_bus(event_bus)
        .build()
        .unwrap()
}

pub fn engine(backend: &FakeBackend, sink: Arc<RecordingSink>) -> PlaybackEngine {
    engine_with(backend, sink, StreamingConfig::default())
}

pub fn engine_with(
    backend: &FakeBackend,
    sink: Arc<RecordingSink>,
    streaming: StreamingConfig,
) -> PlaybackEngine {
    PlaybackEngine::new(engine_config(backend, EventBus::new(1024)), sink)
        .with_streaming_config(streaming)
        .unwrap()
}

/// Poll `condition` on virtual time until it holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached");
}

/// Every event currently queued on `events`.
pub fn drain(events: &mut Receiver<CoreEvent>) -> Vec<CoreEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
