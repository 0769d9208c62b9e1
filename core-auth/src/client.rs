//! Token/session client.
//!
//! Requests short-lived access grants from the token endpoint. Every call is
//! a free-standing fetch: nothing is cached across tracks or sessions, so a
//! grant can never leak from one track into another.
//!
//! The public fetch operations never fail loudly. A transport error, a
//! non-2xx status or a malformed body is logged and reported as `None`,
//! which callers treat as "no credential right now".

use bridge_traits::http::{HttpClient, HttpRequest};
use bridge_traits::Clock;
use core_runtime::config::{EndpointConfig, EngineConfig};
use core_runtime::events::{CoreEvent, EventBus, TokenEvent};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::error::{AuthError, Result};
use crate::types::{AccessGrant, GrantResponse, GrantScope};

/// Timeout applied to token requests.
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the token endpoint.
#[derive(Clone)]
pub struct TokenClient {
    http_client: Arc<dyn HttpClient>,
    endpoints: EndpointConfig,
    clock: Arc<dyn Clock>,
    expiry_skew: Duration,
    event_bus: Option<EventBus>,
    session_credential: Option<String>,
}

impl TokenClient {
    /// Create a client from the shared engine configuration.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            http_client: Arc::clone(&config.http_client),
            endpoints: config.endpoints.clone(),
            clock: Arc::clone(&config.clock),
            expiry_skew: config.token_expiry_skew,
            event_bus: Some(config.event_bus.clone()),
            session_credential: None,
        }
    }

    /// Create a client from individual parts (no event emission).
    pub fn from_parts(
        http_client: Arc<dyn HttpClient>,
        endpoints: EndpointConfig,
        clock: Arc<dyn Clock>,
        expiry_skew: Duration,
    ) -> Self {
        Self {
            http_client,
            endpoints,
            clock,
            expiry_skew,
            event_bus: None,
            session_credential: None,
        }
    }

    /// Send `Authorization: Bearer <credential>` with every token request.
    ///
    /// The user's account session is managed by the host; this only passes
    /// it through.
    pub fn with_session_credential(mut self, credential: impl Into<String>) -> Self {
        self.session_credential = Some(credential.into());
        self
    }

    /// Check a grant against the configured clock and skew.
    pub fn is_expired(&self, grant: &AccessGrant) -> bool {
        grant.is_expired(self.clock.as_ref(), self.expiry_skew)
    }

    /// Fetch a grant for a whole track.
    ///
    /// Returns `None` if the endpoint is unreachable or refuses.
    #[instrument(skip(self))]
    pub async fn fetch_token(&self, track_id: &str) -> Option<AccessGrant> {
        let url = self.endpoints.token_url(track_id);
        self.fetch_logged(&url, track_id, GrantScope::Track).await
    }

    /// Fetch a grant scoped to one segment.
    ///
    /// Falls back to a track-scoped grant when the service has no
    /// segment-token endpoint.
    #[instrument(skip(self))]
    pub async fn fetch_segment_token(&self, track_id: &str, index: usize) -> Option<AccessGrant> {
        match self.endpoints.segment_token_url(track_id, index) {
            Some(url) => {
                self.fetch_logged(&url, track_id, GrantScope::Segment(index))
                    .await
            }
            None => self.fetch_token(track_id).await,
        }
    }

    /// Announce that a grant is being re-issued after a rejection.
    pub fn note_refresh(&self, track_id: &str, index: Option<usize>) {
        debug!(track_id, index, "Refreshing access grant");
        self.emit(TokenEvent::Refreshing {
            track_id: track_id.to_string(),
            segment: index.map(|i| i as u64),
        });
    }

    async fn fetch_logged(
        &self,
        url: &str,
        track_id: &str,
        scope: GrantScope,
    ) -> Option<AccessGrant> {
        match self.request_grant(url, scope).await {
            Ok(grant) => {
                debug!(track_id, scope = ?scope, "Access grant issued");
                self.emit(TokenEvent::Issued {
                    track_id: track_id.to_string(),
                    segment: match scope {
                        GrantScope::Track => None,
                        GrantScope::Segment(index) => Some(index as u64),
                    },
                    expires_at: grant.expires_at.map(|t| t.timestamp()),
                });
                Some(grant)
            }
            Err(e) => {
                warn!(track_id, scope = ?scope, error = %e, "Token request failed");
                self.emit(TokenEvent::Failed {
                    track_id: track_id.to_string(),
                    message: e.to_string(),
                });
                None
            }
        }
    }

    /// Perform the token request and parse the grant.
    async fn request_grant(&self, url: &str, scope: GrantScope) -> Result<AccessGrant> {
        let mut request = HttpRequest::get(url)
            .header("Accept", "application/json")
            .timeout(TOKEN_REQUEST_TIMEOUT);

        if let Some(credential) = &self.session_credential {
            request = request.bearer_token(credential.clone());
        }

        let response = self
            .http_client
            .execute(request)
            .await
            .map_err(|e| AuthError::NetworkError(e.to_string()))?;

        if !response.is_success() {
            return Err(AuthError::HttpStatus {
                status: response.status,
            });
        }

        let body: GrantResponse = response
            .json()
            .map_err(|e| AuthError::InvalidGrant(e.to_string()))?;

        AccessGrant::from_response(body, scope)
    }

    fn emit(&self, event: TokenEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Token(event)).ok();
        }
    }
}

impl std::fmt::Debug for TokenClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenClient")
            .field("endpoints", &self.endpoints)
            .field("expiry_skew", &self.expiry_skew)
            .field("session_credential", &self.session_credential.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}
