use bridge_traits::Clock;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{AuthError, Result};

/// What a grant unlocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrantScope {
    /// Every segment of one track.
    Track,
    /// One segment of one track.
    Segment(usize),
}

/// Short-lived credential for one track or one segment.
///
/// May carry the decryption key and nonce for the segments it unlocks.
///
/// # Security
///
/// Grants must never be logged. The `Debug` implementation redacts the
/// token, key and nonce.
///
/// # Examples
///
/// ```
/// use core_auth::{AccessGrant, GrantScope};
/// use bridge_traits::SystemClock;
/// use chrono::{Duration, Utc};
/// use std::time::Duration as StdDuration;
///
/// let grant = AccessGrant::new("tok", GrantScope::Track)
///     .with_expiry(Utc::now() + Duration::minutes(5));
///
/// assert!(!grant.is_expired(&SystemClock, StdDuration::from_secs(5)));
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct AccessGrant {
    /// Opaque credential sent with segment and stream requests.
    pub token: String,
    /// Segment key material, if the service delivers it with the grant.
    pub key: Option<Vec<u8>>,
    /// Nonce, if the service delivers it with the grant.
    pub nonce: Option<Vec<u8>>,
    /// When the credential stops being accepted. `None` means unknown; the
    /// server's 401/403/410 is then the only expiry signal.
    pub expires_at: Option<DateTime<Utc>>,
    /// What the grant unlocks.
    pub scope: GrantScope,
}

impl AccessGrant {
    pub fn new(token: impl Into<String>, scope: GrantScope) -> Self {
        Self {
            token: token.into(),
            key: None,
            nonce: None,
            expires_at: None,
            scope,
        }
    }

    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_nonce(mut self, nonce: Vec<u8>) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Check whether the grant is expired or expires within `skew`.
    ///
    /// A grant without a known expiry is never considered locally expired.
    pub fn is_expired(&self, clock: &dyn Clock, skew: Duration) -> bool {
        let Some(expires_at) = self.expires_at else {
            return false;
        };
        let skew = chrono::Duration::from_std(skew).unwrap_or_else(|_| chrono::Duration::zero());
        clock.now() >= expires_at - skew
    }

    /// Time remaining until expiry, `None` when expired or unknown.
    pub fn time_until_expiry(&self, clock: &dyn Clock) -> Option<chrono::Duration> {
        let expires_at = self.expires_at?;
        let now = clock.now();
        (now < expires_at).then(|| expires_at - now)
    }

    /// Build a grant from the token endpoint's JSON body.
    pub(crate) fn from_response(response: GrantResponse, scope: GrantScope) -> Result<Self> {
        if response.token.is_empty() {
            return Err(AuthError::InvalidGrant("empty token".to_string()));
        }

        let key = response
            .key
            .as_deref()
            .map(|hex_key| decode_hex("key", hex_key))
            .transpose()?;
        let nonce = response
            .nonce
            .as_deref()
            .map(|hex_nonce| decode_hex("nonce", hex_nonce))
            .transpose()?;
        let expires_at = response.expires_at.map(Expiry::into_datetime).transpose()?;

        Ok(Self {
            token: response.token,
            key,
            nonce,
            expires_at,
            scope,
        })
    }
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value.trim())
        .map_err(|e| AuthError::InvalidGrant(format!("{} is not valid hex: {}", field, e)))
}

// Custom Debug implementation to avoid logging credentials
impl fmt::Debug for AccessGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessGrant")
            .field("token", &"[REDACTED]")
            .field("key", &self.key.as_ref().map(|_| "[REDACTED]"))
            .field("nonce", &self.nonce.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Token endpoint response body.
#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct GrantResponse {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Expiry>,
}

/// Expiry as Unix seconds or an RFC 3339 timestamp.
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub(crate) enum Expiry {
    Epoch(i64),
    Rfc3339(String),
}

impl Expiry {
    fn into_datetime(self) -> Result<DateTime<Utc>> {
        match self {
            Expiry::Epoch(secs) => Utc.timestamp_opt(secs, 0).single().ok_or_else(|| {
                AuthError::InvalidGrant(format!("expires_at {} out of range", secs))
            }),
            Expiry::Rfc3339(text) => DateTime::parse_from_rfc3339(&text)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| AuthError::InvalidGrant(format!("expires_at: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::ManualClock;
    use chrono::Duration as ChronoDuration;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_grant_expiry_with_skew() {
        let clock = ManualClock::new(start());
        let grant = AccessGrant::new("t", GrantScope::Track)
            .with_expiry(start() + ChronoDuration::seconds(30));

        assert!(!grant.is_expired(&clock, Duration::from_secs(5)));

        clock.advance(ChronoDuration::seconds(26));
        assert!(grant.is_expired(&clock, Duration::from_secs(5)));
        assert!(!grant.is_expired(&clock, Duration::ZERO));

        clock.advance(ChronoDuration::seconds(10));
        assert!(grant.time_until_expiry(&clock).is_none());
    }

    #[test]
    fn test_grant_without_expiry_is_never_locally_expired() {
        let clock = ManualClock::new(start());
        let grant = AccessGrant::new("t", GrantScope::Segment(4));
        clock.advance(ChronoDuration::days(365));
        assert!(!grant.is_expired(&clock, Duration::from_secs(5)));
    }

    #[test]
    fn test_grant_debug_redacts_secrets() {
        let grant = AccessGrant::new("super-secret-token", GrantScope::Track)
            .with_key(vec![0xAB; 32])
            .with_nonce(vec![1; 12]);
        let debug = format!("{:?}", grant);
        assert!(!debug.contains("super-secret-token"));
        assert!(!debug.contains("171"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_grant_from_response_with_epoch_expiry() {
        let response: GrantResponse = serde_json::from_str(
            r#"{"token":"abc","key":"000102030405060708090a0b0c0d0e0f","nonce":"0a0b0c0d0e0f101112131415","expires_at":1717243200}"#,
        )
        .unwrap();

        let grant = AccessGrant::from_response(response, GrantScope::Track).unwrap();
        assert_eq!(grant.token, "abc");
        assert_eq!(grant.key.as_ref().map(Vec::len), Some(16));
        assert_eq!(grant.nonce.as_ref().map(Vec::len), Some(12));
        assert_eq!(grant.expires_at, Some(start()));
    }

    #[test]
    fn test_grant_from_response_with_rfc3339_expiry() {
        let response: GrantResponse =
            serde_json::from_str(r#"{"token":"abc","expires_at":"2024-06-01T12:00:00Z"}"#).unwrap();
        let grant = AccessGrant::from_response(response, GrantScope::Segment(2)).unwrap();
        assert_eq!(grant.expires_at, Some(start()));
        assert_eq!(grant.scope, GrantScope::Segment(2));
        assert!(grant.key.is_none());
    }

    #[test]
    fn test_grant_from_response_rejects_bad_input() {
        let empty: GrantResponse = serde_json::from_str(r#"{"token":""}"#).unwrap();
        assert!(AccessGrant::from_response(empty, GrantScope::Track).is_err());

        let bad_hex: GrantResponse =
            serde_json::from_str(r#"{"token":"t","key":"zz"}"#).unwrap();
        assert!(matches!(
            AccessGrant::from_response(bad_hex, GrantScope::Track),
            Err(AuthError::InvalidGrant(_))
        ));
    }
}
