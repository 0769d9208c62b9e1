//! Seek planning.
//!
//! A time offset becomes a byte offset at the constant-bitrate estimate, and
//! the byte offset selects a segment. The target segment and its followers
//! form the window that must be buffered before the sink playhead moves.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::manifest::Manifest;

/// Where a seek lands and what it needs loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekTarget {
    /// Requested playhead position.
    pub position: Duration,
    /// Estimated byte offset of `position`.
    pub offset: u64,
    /// Segment holding `offset`.
    pub index: usize,
    /// Segments that must be loaded before the sink seeks.
    pub window: RangeInclusive<usize>,
}

impl SeekTarget {
    /// Map `position` onto the manifest.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_playback::{Manifest, SeekTarget};
    /// use std::time::Duration;
    ///
    /// let manifest = Manifest::plan("t", 4_000_000, 65_536, None, |_| None).unwrap();
    /// let target = SeekTarget::plan(Duration::from_secs(90), 16_000, &manifest, 3);
    /// assert_eq!(target.offset, 1_440_000);
    /// assert_eq!(target.index, 21);
    /// assert_eq!(target.window, 21..=23);
    /// ```
    pub fn plan(
        position: Duration,
        bytes_per_second: u64,
        manifest: &Manifest,
        window_len: usize,
    ) -> Self {
        let offset = (position.as_secs_f64() * bytes_per_second as f64).floor() as u64;
        let index = manifest.index_for_offset(offset);
        let last = index
            .saturating_add(window_len.max(1) - 1)
            .min(manifest.last_index());

        Self {
            position,
            offset,
            index,
            window: index..=last,
        }
    }

    /// Whether every segment of the window is in `loaded`.
    pub fn is_buffered(&self, loaded: &BTreeSet<usize>) -> bool {
        self.window.clone().all(|index| loaded.contains(&index))
    }

    /// Window segments still missing, ascending.
    pub fn missing(&self, loaded: &BTreeSet<usize>) -> Vec<usize> {
        self.window
            .clone()
            .filter(|index| !loaded.contains(index))
            .collect()
    }
}

/// How `seek_to` was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOutcome {
    /// The sink playhead moved right away.
    Immediate,
    /// The window is being loaded; the sink seeks once it is buffered.
    Pending,
    /// The sink owns the timeline and handled the seek itself.
    Delegated,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        Manifest::plan("t", 4_000_000, 65_536, None, |_| None).unwrap()
    }

    #[test]
    fn test_ninety_seconds_maps_to_segment_21() {
        let target = SeekTarget::plan(Duration::from_secs(90), 16_000, &manifest(), 3);
        assert_eq!(target.offset, 1_440_000);
        assert_eq!(target.index, 21);
        assert_eq!(target.window, 21..=23);
    }

    #[test]
    fn test_window_clamps_at_end() {
        let manifest = manifest();
        let last = manifest.last_index();
        let target = SeekTarget::plan(Duration::from_secs(10_000), 16_000, &manifest, 3);
        assert_eq!(target.index, last);
        assert_eq!(target.window, last..=last);

        let near_end = SeekTarget::plan(Duration::from_secs(249), 16_000, &manifest, 3);
        assert_eq!(*near_end.window.end(), last);
    }

    #[test]
    fn test_zero_is_first_segment() {
        let target = SeekTarget::plan(Duration::ZERO, 16_000, &manifest(), 3);
        assert_eq!(target.index, 0);
        assert_eq!(target.window, 0..=2);
    }

    #[test]
    fn test_buffered_and_missing() {
        let target = SeekTarget::plan(Duration::from_secs(90), 16_000, &manifest(), 3);
        let mut loaded: BTreeSet<usize> = (0..3).collect();
        assert!(!target.is_buffered(&loaded));
        assert_eq!(target.missing(&loaded), vec![21, 22, 23]);

        loaded.insert(22);
        assert_eq!(target.missing(&loaded), vec![21, 23]);

        loaded.extend([21, 23]);
        assert!(target.is_buffered(&loaded));
    }
}
