//! # Segment Fetch Pipeline
//!
//! Retrieves one segment (a discrete request or a byte range of the stream
//! endpoint), reverses its on-wire transformation and hands back plaintext.
//!
//! A rejected or locally expired credential triggers exactly one refresh and
//! retry per segment. Any other failure is logged and reported as `None`,
//! which the scheduler reads as "skip for now".

use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
use bridge_traits::Clock;
use bytes::Bytes;
use core_async::sync::CancellationToken;
use core_async::time::timeout;
use core_auth::{AccessGrant, GrantScope, TokenClient};
use core_runtime::config::{with_token_query, EndpointConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::config::StreamingStats;
use crate::crypto::{CipherScheme, SegmentKey, NONCE_LEN};
use crate::error::{DeliveryError, Result};
use crate::manifest::{Addressing, Manifest, Segment};

/// Per-track access state shared by every fetch of one session.
pub struct TrackAccess {
    track_id: String,
    grant: Mutex<Option<AccessGrant>>,
}

impl TrackAccess {
    pub fn new(track_id: impl Into<String>, grant: Option<AccessGrant>) -> Self {
        Self {
            track_id: track_id.into(),
            grant: Mutex::new(grant),
        }
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Current track-scoped grant.
    pub fn grant(&self) -> Option<AccessGrant> {
        self.grant.lock().clone()
    }

    pub fn replace_grant(&self, grant: AccessGrant) {
        *self.grant.lock() = Some(grant);
    }

    /// Token of the track grant, if one was issued.
    pub fn token(&self) -> Option<String> {
        self.grant.lock().as_ref().map(|grant| grant.token.clone())
    }
}

impl std::fmt::Debug for TrackAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackAccess")
            .field("track_id", &self.track_id)
            .field("grant", &self.grant.lock())
            .finish()
    }
}

/// Credential resolved for one segment request.
struct Credential {
    token: Option<String>,
    key: Option<SegmentKey>,
    /// Nonce the wire payload must carry. Only segment-scoped grants bind one.
    nonce: Option<Vec<u8>>,
    expired: bool,
}

/// Fetches and opens segments.
#[derive(Clone)]
pub struct SegmentFetcher {
    http_client: Arc<dyn HttpClient>,
    tokens: TokenClient,
    endpoints: EndpointConfig,
    clock: Arc<dyn Clock>,
    expiry_skew: Duration,
    request_timeout: Duration,
    stats: Arc<Mutex<StreamingStats>>,
}

impl SegmentFetcher {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        tokens: TokenClient,
        endpoints: EndpointConfig,
        clock: Arc<dyn Clock>,
        expiry_skew: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            http_client,
            tokens,
            endpoints,
            clock,
            expiry_skew,
            request_timeout,
            stats: Arc::new(Mutex::new(StreamingStats::default())),
        }
    }

    /// Share an existing statistics sink.
    pub fn with_stats(mut self, stats: Arc<Mutex<StreamingStats>>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> StreamingStats {
        self.stats.lock().clone()
    }

    /// Fetch and decode one segment.
    ///
    /// Returns `None` when the segment cannot be delivered right now
    /// (network failure, refused credential after one refresh, failed
    /// decryption) or when `cancel` fires. Never returns stale or
    /// unauthenticated bytes.
    #[instrument(skip(self, access, manifest, segment, cancel), fields(track_id = %access.track_id(), index = segment.index))]
    pub async fn fetch_segment(
        &self,
        access: &TrackAccess,
        manifest: &Manifest,
        segment: &Segment,
        cancel: &CancellationToken,
    ) -> Option<Bytes> {
        match self.fetch_with_refresh(access, manifest, segment, cancel).await {
            Ok(bytes) => {
                debug!(len = bytes.len(), "Segment decoded");
                Some(bytes)
            }
            Err(DeliveryError::Cancelled) => {
                debug!("Segment fetch abandoned");
                None
            }
            Err(e) => {
                warn!(error = %e, "Segment fetch failed");
                self.stats.lock().failed_fetches += 1;
                None
            }
        }
    }

    async fn fetch_with_refresh(
        &self,
        access: &TrackAccess,
        manifest: &Manifest,
        segment: &Segment,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let mut credential = self.resolve_credential(access, manifest, segment, None)?;
        let mut refreshed = false;

        if credential.expired {
            credential = self.refresh(access, manifest, segment, cancel).await?;
            refreshed = true;
        }

        match self.fetch_once(access, manifest, segment, &credential, cancel).await {
            Err(DeliveryError::TokenExpired { .. }) if !refreshed => {
                let credential = self.refresh(access, manifest, segment, cancel).await?;
                self.fetch_once(access, manifest, segment, &credential, cancel)
                    .await
                    .map_err(|e| match e {
                        DeliveryError::TokenExpired { .. } => DeliveryError::FetchFailed(format!(
                            "segment {} refused after refresh",
                            segment.index
                        )),
                        other => other,
                    })
            }
            Err(DeliveryError::TokenExpired { .. }) => Err(DeliveryError::FetchFailed(format!(
                "segment {} refused after refresh",
                segment.index
            ))),
            other => other,
        }
    }

    /// Ask the token endpoint for a fresh grant and resolve the credential
    /// from it.
    async fn refresh(
        &self,
        access: &TrackAccess,
        manifest: &Manifest,
        segment: &Segment,
        cancel: &CancellationToken,
    ) -> Result<Credential> {
        self.tokens
            .note_refresh(access.track_id(), Some(segment.index));
        self.stats.lock().token_refreshes += 1;

        let grant = core_async::select! {
            biased;
            _ = cancel.cancelled() => return Err(DeliveryError::Cancelled),
            grant = self.tokens.fetch_segment_token(access.track_id(), segment.index) => grant,
        };

        let grant = grant.ok_or_else(|| {
            DeliveryError::FetchFailed(format!(
                "no fresh credential for segment {}",
                segment.index
            ))
        })?;

        if grant.scope == GrantScope::Track {
            access.replace_grant(grant.clone());
        }

        let mut credential = self.resolve_credential(access, manifest, segment, Some(&grant))?;
        // A grant that is already stale on arrival is still tried once.
        credential.expired = false;
        Ok(credential)
    }

    fn resolve_credential(
        &self,
        access: &TrackAccess,
        manifest: &Manifest,
        segment: &Segment,
        fresh: Option<&AccessGrant>,
    ) -> Result<Credential> {
        let track_grant = access.grant();
        let segment_key = segment.segment_key()?;

        let grant_key = |grant: &AccessGrant| -> Result<Option<SegmentKey>> {
            grant.key.clone().map(SegmentKey::from_bytes).transpose()
        };
        let track_key = match &track_grant {
            Some(grant) => grant_key(grant)?,
            None => None,
        };

        let credential = match (fresh, &segment.access_token, &track_grant) {
            (Some(grant), _, _) => Credential {
                token: Some(grant.token.clone()),
                key: segment_key.or(grant_key(grant)?).or(track_key),
                nonce: match grant.scope {
                    GrantScope::Segment(_) => grant.nonce.clone(),
                    GrantScope::Track => None,
                },
                expired: grant.is_expired(self.clock.as_ref(), self.expiry_skew),
            },
            (None, Some(token), _) => Credential {
                token: Some(token.clone()),
                key: segment_key.or(track_key),
                nonce: None,
                expired: manifest.is_expired(self.clock.now() + skew(self.expiry_skew)),
            },
            (None, None, Some(grant)) => Credential {
                token: Some(grant.token.clone()),
                key: segment_key.or(track_key),
                nonce: None,
                expired: grant.is_expired(self.clock.as_ref(), self.expiry_skew),
            },
            (None, None, None) => Credential {
                token: None,
                key: segment_key,
                nonce: None,
                expired: false,
            },
        };

        Ok(credential)
    }

    fn build_request(
        &self,
        access: &TrackAccess,
        manifest: &Manifest,
        segment: &Segment,
        token: Option<&str>,
    ) -> HttpRequest {
        let authorize = |url: String| match token {
            Some(token) => with_token_query(&url, token),
            None => url,
        };

        let request = match manifest.addressing {
            Addressing::Discrete => HttpRequest::get(authorize(
                self.endpoints.segment_url(access.track_id(), segment.index),
            )),
            Addressing::ByteRange => {
                HttpRequest::get(authorize(self.endpoints.stream_url(access.track_id())))
                    .byte_range(segment.start, segment.end)
            }
        };

        request.timeout(self.request_timeout)
    }

    async fn fetch_once(
        &self,
        access: &TrackAccess,
        manifest: &Manifest,
        segment: &Segment,
        credential: &Credential,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        if cancel.is_cancelled() {
            return Err(DeliveryError::Cancelled);
        }

        let request = self.build_request(access, manifest, segment, credential.token.as_deref());
        self.stats.lock().http_requests += 1;

        let outcome = core_async::select! {
            biased;
            _ = cancel.cancelled() => return Err(DeliveryError::Cancelled),
            outcome = timeout(self.request_timeout, self.http_client.execute(request)) => outcome,
        };

        let response = match outcome {
            Err(_) => {
                return Err(DeliveryError::FetchFailed(format!(
                    "segment {} timed out after {:?}",
                    segment.index, self.request_timeout
                )))
            }
            Ok(Err(e)) => {
                return Err(DeliveryError::FetchFailed(format!(
                    "segment {}: {}",
                    segment.index, e
                )))
            }
            Ok(Ok(response)) => response,
        };

        if response.is_auth_failure() {
            return Err(DeliveryError::TokenExpired {
                track_id: access.track_id().to_string(),
                index: Some(segment.index),
            });
        }

        if !response.is_success() {
            return Err(DeliveryError::FetchFailed(format!(
                "segment {} returned HTTP {}",
                segment.index, response.status
            )));
        }

        let body = segment_body(manifest.addressing, segment, response)?;
        self.stats.lock().total_bytes_downloaded += body.len() as u64;

        self.open(manifest.scheme, segment, credential, &body)
    }

    fn open(
        &self,
        scheme: CipherScheme,
        segment: &Segment,
        credential: &Credential,
        body: &[u8],
    ) -> Result<Bytes> {
        let key = credential.key.as_ref().ok_or_else(|| {
            DeliveryError::Decryption(format!("no key for segment {}", segment.index))
        })?;

        if let (CipherScheme::AesGcm, Some(expected)) = (scheme, &credential.nonce) {
            if body.len() < NONCE_LEN || body[..NONCE_LEN] != expected[..] {
                return Err(DeliveryError::Decryption(format!(
                    "segment {} nonce does not match its grant",
                    segment.index
                )));
            }
        }

        scheme.open(body, key)
    }
}

impl std::fmt::Debug for SegmentFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentFetcher")
            .field("endpoints", &self.endpoints)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Extract exactly the segment's bytes from a response.
///
/// A server that ignores `Range` and answers 200 with the full resource is
/// tolerated by slicing the range out locally.
fn segment_body(addressing: Addressing, segment: &Segment, response: HttpResponse) -> Result<Bytes> {
    let expected = segment.len();
    let body = response.body;

    let body = match addressing {
        Addressing::ByteRange if response.status == 200 && body.len() as u64 > expected => {
            let start = segment.start as usize;
            let end = segment.end as usize + 1;
            if end > body.len() {
                return Err(DeliveryError::FetchFailed(format!(
                    "segment {} outside returned resource",
                    segment.index
                )));
            }
            body.slice(start..end)
        }
        _ => body,
    };

    if body.len() as u64 != expected {
        return Err(DeliveryError::FetchFailed(format!(
            "segment {} length {} != expected {}",
            segment.index,
            body.len(),
            expected
        )));
    }

    Ok(body)
}

fn skew(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::seal;
    use async_trait::async_trait;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use bridge_traits::{ManualClock, SystemClock};
    use chrono::{TimeZone, Utc};
    use mockall::mock;
    use mockall::Sequence;

    mock! {
        HttpClient {}

        #[async_trait]
        impl HttpClient for HttpClient {
            async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse>;
        }
    }

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn key() -> SegmentKey {
        SegmentKey::from_hex(KEY_HEX).unwrap()
    }

    fn sealed(plaintext: &[u8]) -> Bytes {
        seal(plaintext, &key(), &[3u8; NONCE_LEN]).unwrap()
    }

    fn fetcher(http: MockHttpClient, clock: Arc<dyn Clock>) -> SegmentFetcher {
        let http: Arc<dyn HttpClient> = Arc::new(http);
        let endpoints = EndpointConfig::new("https://api.example.com");
        let tokens = TokenClient::from_parts(
            Arc::clone(&http),
            endpoints.clone(),
            Arc::clone(&clock),
            Duration::from_secs(5),
        );
        SegmentFetcher::new(
            http,
            tokens,
            endpoints,
            clock,
            Duration::from_secs(5),
            Duration::from_secs(10),
        )
    }

    fn manifest_for(payload_len: u64) -> Manifest {
        let mut manifest =
            Manifest::plan("7", payload_len * 2, payload_len, None, |i| Some(format!("seg-{i}")))
                .unwrap();
        manifest.segments[0].key = Some(KEY_HEX.to_string());
        manifest.segments[1].key = Some(KEY_HEX.to_string());
        manifest
    }

    #[tokio::test]
    async fn test_fetch_discrete_segment() {
        let wire = sealed(b"first segment");
        let manifest = manifest_for(wire.len() as u64);
        let body = wire.clone();

        let mut http = MockHttpClient::new();
        http.expect_execute()
            .withf(|req| {
                req.url == "https://api.example.com/tracks/7/segments/0?token=seg-0"
                    && !req.headers.contains_key("Range")
            })
            .times(1)
            .returning(move |_| Ok(HttpResponse::new(200, body.clone())));

        let fetcher = fetcher(http, Arc::new(SystemClock));
        let access = TrackAccess::new("7", None);
        let bytes = fetcher
            .fetch_segment(&access, &manifest, &manifest.segments[0], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(&bytes[..], b"first segment");
        let stats = fetcher.stats();
        assert_eq!(stats.http_requests, 1);
        assert_eq!(stats.total_bytes_downloaded, wire.len() as u64);
    }

    #[tokio::test]
    async fn test_fetch_byte_range_slices_full_response() {
        let first = sealed(b"aaaa");
        let second = sealed(b"bbbb");
        let mut manifest = manifest_for(first.len() as u64);
        manifest.addressing = Addressing::ByteRange;

        let mut whole = first.to_vec();
        whole.extend_from_slice(&second);
        let whole = Bytes::from(whole);

        let mut http = MockHttpClient::new();
        http.expect_execute()
            .withf(|req| {
                req.url.starts_with("https://api.example.com/tracks/7/stream?token=seg-1")
                    && req.headers.get("Range").map(String::as_str) == Some("bytes=32-63")
            })
            .times(1)
            .returning(move |_| Ok(HttpResponse::new(200, whole.clone())));

        let fetcher = fetcher(http, Arc::new(SystemClock));
        let access = TrackAccess::new("7", None);
        let bytes = fetcher
            .fetch_segment(&access, &manifest, &manifest.segments[1], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"bbbb");
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_once() {
        let wire = sealed(b"payload");
        let manifest = manifest_for(wire.len() as u64);
        let body = wire.clone();
        let mut seq = Sequence::new();

        let mut http = MockHttpClient::new();
        http.expect_execute()
            .withf(|req| req.url.ends_with("segments/0?token=seg-0"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(HttpResponse::new(401, "expired")));
        http.expect_execute()
            .withf(|req| req.url == "https://api.example.com/tracks/7/segments/0/token")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(HttpResponse::new(200, r#"{"token":"fresh"}"#)));
        http.expect_execute()
            .withf(|req| req.url.ends_with("segments/0?token=fresh"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(HttpResponse::new(200, body.clone())));

        let fetcher = fetcher(http, Arc::new(SystemClock));
        let access = TrackAccess::new("7", None);
        let bytes = fetcher
            .fetch_segment(&access, &manifest, &manifest.segments[0], &CancellationToken::new())
            .await;

        assert_eq!(bytes.as_deref(), Some(&b"payload"[..]));
        assert_eq!(fetcher.stats().token_refreshes, 1);
    }

    #[tokio::test]
    async fn test_second_rejection_is_a_failure() {
        let manifest = manifest_for(64);
        let mut http = MockHttpClient::new();
        http.expect_execute()
            .withf(|req| req.url.contains("/segments/0?"))
            .times(2)
            .returning(|_| Ok(HttpResponse::new(403, "")));
        http.expect_execute()
            .withf(|req| req.url.ends_with("/token"))
            .times(1)
            .returning(|_| Ok(HttpResponse::new(200, r#"{"token":"still-bad"}"#)));

        let fetcher = fetcher(http, Arc::new(SystemClock));
        let access = TrackAccess::new("7", None);
        let bytes = fetcher
            .fetch_segment(&access, &manifest, &manifest.segments[0], &CancellationToken::new())
            .await;

        assert!(bytes.is_none());
        let stats = fetcher.stats();
        assert_eq!(stats.token_refreshes, 1);
        assert_eq!(stats.failed_fetches, 1);
    }

    #[tokio::test]
    async fn test_locally_expired_manifest_refreshes_before_request() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let wire = sealed(b"late");
        let mut manifest = manifest_for(wire.len() as u64);
        manifest.expires_at = Some(now - chrono::Duration::seconds(1));
        let body = wire.clone();

        let mut http = MockHttpClient::new();
        http.expect_execute()
            .withf(|req| req.url.ends_with("/segments/1/token"))
            .times(1)
            .returning(|_| Ok(HttpResponse::new(200, r#"{"token":"renewed"}"#)));
        http.expect_execute()
            .withf(|req| req.url.ends_with("/segments/1?token=renewed"))
            .times(1)
            .returning(move |_| Ok(HttpResponse::new(200, body.clone())));

        let fetcher = fetcher(http, Arc::new(ManualClock::new(now)));
        let access = TrackAccess::new("7", None);
        let bytes = fetcher
            .fetch_segment(&access, &manifest, &manifest.segments[1], &CancellationToken::new())
            .await;
        assert_eq!(bytes.as_deref(), Some(&b"late"[..]));
    }

    #[tokio::test]
    async fn test_tampered_segment_is_skipped() {
        let wire = sealed(b"payload");
        let manifest = manifest_for(wire.len() as u64);
        let mut tampered = wire.to_vec();
        tampered[30] ^= 0xFF;
        let tampered = Bytes::from(tampered);

        let mut http = MockHttpClient::new();
        http.expect_execute()
            .times(1)
            .returning(move |_| Ok(HttpResponse::new(200, tampered.clone())));

        let fetcher = fetcher(http, Arc::new(SystemClock));
        let access = TrackAccess::new("7", None);
        assert!(fetcher
            .fetch_segment(&access, &manifest, &manifest.segments[0], &CancellationToken::new())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_track_grant_supplies_token_and_key() {
        let wire = sealed(b"keyed by grant");
        let mut manifest = manifest_for(wire.len() as u64);
        for segment in &mut manifest.segments {
            segment.access_token = None;
            segment.key = None;
        }
        let body = wire.clone();

        let mut http = MockHttpClient::new();
        http.expect_execute()
            .withf(|req| req.url.ends_with("/segments/0?token=track-tok"))
            .times(1)
            .returning(move |_| Ok(HttpResponse::new(200, body.clone())));

        let fetcher = fetcher(http, Arc::new(SystemClock));
        let grant = AccessGrant::new("track-tok", GrantScope::Track).with_key(key().as_bytes().to_vec());
        let access = TrackAccess::new("7", Some(grant));
        let bytes = fetcher
            .fetch_segment(&access, &manifest, &manifest.segments[0], &CancellationToken::new())
            .await;
        assert_eq!(bytes.as_deref(), Some(&b"keyed by grant"[..]));
    }

    #[tokio::test]
    async fn test_transport_error_and_server_error_yield_none() {
        let manifest = manifest_for(64);
        let mut http = MockHttpClient::new();
        let mut seq = Sequence::new();
        http.expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(BridgeError::OperationFailed("reset".into())));
        http.expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(HttpResponse::new(503, "")));

        let fetcher = fetcher(http, Arc::new(SystemClock));
        let access = TrackAccess::new("7", None);
        let cancel = CancellationToken::new();
        assert!(fetcher
            .fetch_segment(&access, &manifest, &manifest.segments[0], &cancel)
            .await
            .is_none());
        assert!(fetcher
            .fetch_segment(&access, &manifest, &manifest.segments[0], &cancel)
            .await
            .is_none());
        assert_eq!(fetcher.stats().failed_fetches, 2);
        assert_eq!(fetcher.stats().token_refreshes, 0);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_returns_none_without_failure() {
        let manifest = manifest_for(64);
        let http = MockHttpClient::new();
        let fetcher = fetcher(http, Arc::new(SystemClock));
        let access = TrackAccess::new("7", None);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(fetcher
            .fetch_segment(&access, &manifest, &manifest.segments[0], &cancel)
            .await
            .is_none());
        assert_eq!(fetcher.stats().failed_fetches, 0);
    }

    #[test]
    fn test_short_body_is_rejected() {
        let manifest = manifest_for(64);
        let response = HttpResponse::new(200, vec![0u8; 10]);
        assert!(segment_body(Addressing::Discrete, &manifest.segments[0], response).is_err());
    }
}
