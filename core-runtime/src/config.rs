//! # Engine Configuration Module
//!
//! Provides configuration management for the delivery engine.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct an
//! `EngineConfig` holding the bridges and endpoint templates the engine needs.
//! It enforces fail-fast validation so a missing bridge or a malformed
//! endpoint is reported at startup instead of on the first track load.
//!
//! ## Required Dependencies
//!
//! - `HttpClient` - token, manifest, segment and stream requests
//!   (desktop default: reqwest, with the `desktop-shims` feature)
//! - `EndpointConfig` - URL templates for the token/manifest service and CDN
//!
//! ## Optional Dependencies (with defaults)
//!
//! - `Clock` - time source for grant/manifest expiry (default: `SystemClock`)
//! - `EventBus` - lifecycle event channel (default: fresh bus)
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{EndpointConfig, EngineConfig};
//! use std::sync::Arc;
//!
//! let endpoints = EndpointConfig::new("https://api.example.com")
//!     .with_segment_template("https://cdn.example.com/a/{track_id}/{index}");
//!
//! let config = EngineConfig::builder()
//!     .endpoints(endpoints)
//!     .http_client(Arc::new(MyHttpClient))
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use crate::events::EventBus;
use bridge_traits::{Clock, HttpClient, SystemClock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Placeholder substituted with the (percent-encoded) track identifier.
pub const TRACK_ID_PLACEHOLDER: &str = "{track_id}";
/// Placeholder substituted with the zero-based segment index.
pub const INDEX_PLACEHOLDER: &str = "{index}";

/// Default allowance subtracted from a grant's expiry before it is
/// considered stale.
pub const DEFAULT_TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(5);

// ============================================================================
// Endpoints
// ============================================================================

/// URL templates for the external service contract.
///
/// Templates use `{track_id}` and `{index}` placeholders. Access tokens are
/// never part of a template; the engine appends them as a `token` query
/// parameter or bearer header at request time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// `GET` returning `{ token, nonce?, key?, expires_at? }` for a track.
    pub token: String,
    /// `GET` returning a grant scoped to one segment. Falls back to `token`
    /// when absent.
    #[serde(default)]
    pub segment_token: Option<String>,
    /// `GET` returning the manifest JSON.
    pub manifest: String,
    /// `GET` one discrete segment.
    pub segment: String,
    /// `GET` (optionally with `Range`) the full encrypted resource.
    pub stream: String,
    /// Segmented playlist document resolved by native players.
    pub playlist: String,
}

impl EndpointConfig {
    /// Conventional layout under a single base URL.
    pub fn new(base_url: impl AsRef<str>) -> Self {
        let base = base_url.as_ref().trim_end_matches('/');
        Self {
            token: format!("{base}/tracks/{{track_id}}/token"),
            segment_token: Some(format!("{base}/tracks/{{track_id}}/segments/{{index}}/token")),
            manifest: format!("{base}/tracks/{{track_id}}/manifest"),
            segment: format!("{base}/tracks/{{track_id}}/segments/{{index}}"),
            stream: format!("{base}/tracks/{{track_id}}/stream"),
            playlist: format!("{base}/tracks/{{track_id}}/playlist.m3u8"),
        }
    }

    pub fn with_token_template(mut self, template: impl Into<String>) -> Self {
        self.token = template.into();
        self
    }

    pub fn with_segment_token_template(mut self, template: Option<String>) -> Self {
        self.segment_token = template;
        self
    }

    pub fn with_manifest_template(mut self, template: impl Into<String>) -> Self {
        self.manifest = template.into();
        self
    }

    pub fn with_segment_template(mut self, template: impl Into<String>) -> Self {
        self.segment = template.into();
        self
    }

    pub fn with_stream_template(mut self, template: impl Into<String>) -> Self {
        self.stream = template.into();
        self
    }

    pub fn with_playlist_template(mut self, template: impl Into<String>) -> Self {
        self.playlist = template.into();
        self
    }

    pub fn token_url(&self, track_id: &str) -> String {
        render(&self.token, track_id, None)
    }

    /// Segment-scoped token URL, or `None` when the service only issues
    /// track-scoped grants.
    pub fn segment_token_url(&self, track_id: &str, index: usize) -> Option<String> {
        self.segment_token
            .as_deref()
            .map(|template| render(template, track_id, Some(index)))
    }

    pub fn manifest_url(&self, track_id: &str) -> String {
        render(&self.manifest, track_id, None)
    }

    pub fn segment_url(&self, track_id: &str, index: usize) -> String {
        render(&self.segment, track_id, Some(index))
    }

    pub fn stream_url(&self, track_id: &str) -> String {
        render(&self.stream, track_id, None)
    }

    pub fn playlist_url(&self, track_id: &str) -> String {
        render(&self.playlist, track_id, None)
    }

    /// Validates every template.
    ///
    /// Each must be an absolute http(s) URL once placeholders are filled,
    /// must mention `{track_id}`, and the segment-addressed templates must
    /// mention `{index}`.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, Option<&str>, bool); 6] = [
            ("token", Some(&self.token), false),
            ("segment_token", self.segment_token.as_deref(), true),
            ("manifest", Some(&self.manifest), false),
            ("segment", Some(&self.segment), true),
            ("stream", Some(&self.stream), false),
            ("playlist", Some(&self.playlist), false),
        ];

        for (name, template, needs_index) in checks {
            let Some(template) = template else {
                continue;
            };

            if !template.contains(TRACK_ID_PLACEHOLDER) {
                return Err(Error::Config(format!(
                    "Endpoint '{}' must contain {}",
                    name, TRACK_ID_PLACEHOLDER
                )));
            }

            if needs_index && !template.contains(INDEX_PLACEHOLDER) {
                return Err(Error::Config(format!(
                    "Endpoint '{}' must contain {}",
                    name, INDEX_PLACEHOLDER
                )));
            }

            let sample = render(template, "track", Some(0));
            let parsed = Url::parse(&sample).map_err(|e| {
                Error::Config(format!("Endpoint '{}' is not a valid URL: {}", name, e))
            })?;

            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(Error::Config(format!(
                    "Endpoint '{}' must use http or https, got '{}'",
                    name,
                    parsed.scheme()
                )));
            }
        }

        Ok(())
    }
}

fn render(template: &str, track_id: &str, index: Option<usize>) -> String {
    let encoded = urlencoding::encode(track_id);
    let rendered = template.replace(TRACK_ID_PLACEHOLDER, &encoded);
    match index {
        Some(index) => rendered.replace(INDEX_PLACEHOLDER, &index.to_string()),
        None => rendered,
    }
}

/// Append an access token as the `token` query parameter.
pub fn with_token_query(url: &str, token: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.query_pairs_mut().append_pair("token", token);
            parsed.into()
        }
        Err(_) => {
            let separator = if url.contains('?') { '&' } else { '?' };
            format!("{}{}token={}", url, separator, urlencoding::encode(token))
        }
    }
}

// ============================================================================
// Engine configuration
// ============================================================================

/// Configuration shared by the token client and the playback engine.
///
/// Use [`EngineConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct EngineConfig {
    /// HTTP transport for every external request.
    pub http_client: Arc<dyn HttpClient>,

    /// Time source for grant and manifest expiry.
    pub clock: Arc<dyn Clock>,

    /// External service URL templates.
    pub endpoints: EndpointConfig,

    /// A grant expiring within this window is treated as already expired.
    pub token_expiry_skew: Duration,

    /// Channel for lifecycle events.
    pub event_bus: EventBus,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("http_client", &"HttpClient { ... }")
            .field("clock", &"Clock { ... }")
            .field("endpoints", &self.endpoints)
            .field("token_expiry_skew", &self.token_expiry_skew)
            .field("event_bus", &self.event_bus)
            .finish()
    }
}

impl EngineConfig {
    /// Creates a new builder for constructing an `EngineConfig`.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        self.endpoints.validate()?;

        if self.token_expiry_skew > Duration::from_secs(300) {
            return Err(Error::Config(
                "Token expiry skew exceeds maximum of 5 minutes".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn http_client_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "No HTTP client implementation provided. \
                 Desktop: enable the 'desktop-shims' feature to use the default ReqwestHttpClient. \
                 Mobile: inject a platform-native HttpClient adapter."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new());
    Ok(client)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    Err(http_client_missing_error())
}

/// Builder for constructing [`EngineConfig`] instances.
#[derive(Default)]
pub struct EngineConfigBuilder {
    http_client: Option<Arc<dyn HttpClient>>,
    clock: Option<Arc<dyn Clock>>,
    endpoints: Option<EndpointConfig>,
    token_expiry_skew: Option<Duration>,
    event_bus: Option<EventBus>,
}

impl EngineConfigBuilder {
    /// Sets the HTTP client implementation.
    ///
    /// If not provided, the desktop default (reqwest-based) is used when the
    /// `desktop-shims` feature is enabled.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the time source. Default: [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the endpoint templates (required).
    pub fn endpoints(mut self, endpoints: EndpointConfig) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    /// Sets the grant expiry skew. Default: 5 seconds.
    pub fn token_expiry_skew(mut self, skew: Duration) -> Self {
        self.token_expiry_skew = Some(skew);
        self
    }

    /// Shares an existing event bus instead of creating one.
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Builds the final `EngineConfig` instance.
    ///
    /// # Errors
    ///
    /// - `Error::Config` if endpoints are missing or malformed
    /// - `Error::CapabilityMissing` if no `HttpClient` is available
    pub fn build(self) -> Result<EngineConfig> {
        let endpoints = self.endpoints.ok_or_else(|| {
            Error::Config("Endpoints are required. Use .endpoints() to set them.".to_string())
        })?;

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client()?,
        };

        let config = EngineConfig {
            http_client,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            endpoints,
            token_expiry_skew: self.token_expiry_skew.unwrap_or(DEFAULT_TOKEN_EXPIRY_SKEW),
            event_bus: self.event_bus.unwrap_or_default(),
        };

        config.validate()?;

        Ok(config)
    }
}
