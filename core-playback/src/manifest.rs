//! Track manifest model.
//!
//! A manifest splits one asset into contiguous, non-overlapping byte ranges
//! ("segments") covering `[0, total_size)`. Each segment may carry its own
//! access token and key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::crypto::{CipherScheme, SegmentKey};
use crate::error::{DeliveryError, Result};

/// How segment bytes are requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Addressing {
    /// One request per segment against the segment endpoint.
    #[default]
    Discrete,
    /// `Range` requests against the full-resource stream endpoint.
    ByteRange,
}

/// One contiguous byte range of the asset.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub index: usize,
    /// First byte offset.
    pub start: u64,
    /// Last byte offset (inclusive).
    pub end: u64,
    /// Credential for this segment alone.
    #[serde(
        default,
        alias = "token",
        alias = "accessToken",
        skip_serializing_if = "Option::is_none"
    )]
    pub access_token: Option<String>,
    /// Hex-encoded key overriding the track key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl Segment {
    /// Length in bytes.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Whether `offset` falls inside this segment.
    pub fn contains(&self, offset: u64) -> bool {
        (self.start..=self.end).contains(&offset)
    }

    /// Parse the per-segment key, if any.
    pub fn segment_key(&self) -> Result<Option<SegmentKey>> {
        self.key.as_deref().map(SegmentKey::from_hex).transpose()
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("index", &self.index)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("key", &self.key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Segment layout and access metadata for one track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(alias = "trackId")]
    pub track_id: String,
    #[serde(alias = "totalSize")]
    pub total_size: u64,
    #[serde(alias = "segmentSize")]
    pub segment_size: u64,
    pub segments: Vec<Segment>,
    /// When the segment tokens in this manifest stop being accepted.
    #[serde(
        default,
        alias = "expiresAt",
        with = "chrono::serde::ts_seconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheme: CipherScheme,
    #[serde(default)]
    pub addressing: Addressing,
    /// Average bitrate hint used for duration and seek estimates.
    #[serde(
        default,
        alias = "bytesPerSecond",
        skip_serializing_if = "Option::is_none"
    )]
    pub bytes_per_second: Option<u64>,
}

impl Manifest {
    /// Build a manifest with segments of `segment_size` covering `total_size`.
    ///
    /// `token_for` supplies each segment's access token.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_playback::Manifest;
    ///
    /// let manifest = Manifest::plan("42", 1_000_000, 65_536, None, |_| None).unwrap();
    /// assert_eq!(manifest.segment_count(), 16);
    /// assert_eq!(manifest.segments[15].end, 999_999);
    /// ```
    pub fn plan<F>(
        track_id: impl Into<String>,
        total_size: u64,
        segment_size: u64,
        expires_at: Option<DateTime<Utc>>,
        mut token_for: F,
    ) -> Result<Self>
    where
        F: FnMut(usize) -> Option<String>,
    {
        if segment_size == 0 {
            return Err(DeliveryError::InvalidManifest(
                "segment_size must be > 0".to_string(),
            ));
        }
        if total_size == 0 {
            return Err(DeliveryError::InvalidManifest(
                "total_size must be > 0".to_string(),
            ));
        }

        let count = total_size.div_ceil(segment_size) as usize;
        let segments = (0..count)
            .map(|index| {
                let start = index as u64 * segment_size;
                let end = (start + segment_size).min(total_size) - 1;
                Segment {
                    index,
                    start,
                    end,
                    access_token: token_for(index),
                    key: None,
                }
            })
            .collect();

        Ok(Self {
            track_id: track_id.into(),
            total_size,
            segment_size,
            segments,
            expires_at,
            scheme: CipherScheme::default(),
            addressing: Addressing::default(),
            bytes_per_second: None,
        })
    }

    /// Check that segments are ordered, contiguous and cover the asset.
    pub fn validate(&self) -> Result<()> {
        if self.segment_size == 0 {
            return Err(invalid("segment_size must be > 0"));
        }
        if self.total_size == 0 || self.segments.is_empty() {
            return Err(invalid("manifest has no content"));
        }
        if self.bytes_per_second == Some(0) {
            return Err(invalid("bytes_per_second must be > 0"));
        }

        let mut expected_start = 0u64;
        for (position, segment) in self.segments.iter().enumerate() {
            if segment.index != position {
                return Err(DeliveryError::InvalidManifest(format!(
                    "segment {} out of order at position {}",
                    segment.index, position
                )));
            }
            if segment.is_empty() || segment.start != expected_start {
                return Err(DeliveryError::InvalidManifest(format!(
                    "segment {} does not start at byte {}",
                    segment.index, expected_start
                )));
            }
            if segment.len() > self.segment_size {
                return Err(DeliveryError::InvalidManifest(format!(
                    "segment {} is {} bytes, larger than segment_size {}",
                    segment.index,
                    segment.len(),
                    self.segment_size
                )));
            }
            expected_start = segment.end + 1;
        }

        if expected_start != self.total_size {
            return Err(DeliveryError::InvalidManifest(format!(
                "segments cover {} of {} bytes",
                expected_start, self.total_size
            )));
        }

        Ok(())
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }

    pub fn last_index(&self) -> usize {
        self.segments.len().saturating_sub(1)
    }

    /// Segment holding `offset`, clamped to the last segment.
    pub fn index_for_offset(&self, offset: u64) -> usize {
        if self.segment_size == 0 {
            return 0;
        }
        let index = (offset / self.segment_size).min(usize::MAX as u64) as usize;
        index.min(self.last_index())
    }

    /// Playing time of the whole asset at a constant bitrate.
    pub fn estimated_duration(&self, bytes_per_second: u64) -> Duration {
        if bytes_per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.total_size as f64 / bytes_per_second as f64)
    }

    /// Whether the manifest's segment tokens have lapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

fn invalid(message: &str) -> DeliveryError {
    DeliveryError::InvalidManifest(message.to_string())
}
