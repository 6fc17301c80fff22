//! Marker-anchored window boundaries.
//!
//! Each marker owns the window that starts at its predecessor and runs
//! forward to its successor, stretched so there is always at least
//! `minimum_lookahead` of data after the marker. Consecutive windows may
//! therefore overlap in the raw readings they cover.

use crate::core::types::{Marker, Period};
use chrono::Duration;

/// Boundary rules for marker windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentationParams {
    /// Window start for a marker with no predecessor
    pub default_lookback: Duration,
    /// Window length after a marker with no successor
    pub default_lookahead: Duration,
    /// Minimum forward window even when the next marker is close
    pub minimum_lookahead: Duration,
}

impl Default for SegmentationParams {
    fn default() -> Self {
        Self {
            default_lookback: Duration::minutes(180),
            default_lookahead: Duration::minutes(240),
            minimum_lookahead: Duration::minutes(180),
        }
    }
}

/// Window boundaries of the marker at `index` in a timestamp-sorted list.
///
/// Returns `None` when `index` is out of range.
pub fn boundaries_at(
    sorted_markers: &[Marker],
    index: usize,
    params: &SegmentationParams,
) -> Option<Period> {
    let marker = sorted_markers.get(index)?;

    let start = match index.checked_sub(1).and_then(|i| sorted_markers.get(i)) {
        Some(previous) => previous.timestamp,
        None => marker.timestamp - params.default_lookback,
    };

    let end = match sorted_markers.get(index + 1) {
        Some(next) => (marker.timestamp + params.minimum_lookahead).max(next.timestamp),
        None => marker.timestamp + params.default_lookahead,
    };

    Some(Period::new(start, end))
}

/// Boundaries for every marker, in input order. Idempotent.
pub fn compute_boundaries(sorted_markers: &[Marker], params: &SegmentationParams) -> Vec<Period> {
    (0..sorted_markers.len())
        .filter_map(|i| boundaries_at(sorted_markers, i, params))
        .collect()
}

/// Sort markers by timestamp, breaking ties by id so the order is stable.
pub fn sort_markers(markers: &mut [Marker]) {
    markers.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn markers_at(minutes: &[i64]) -> Vec<Marker> {
        minutes.iter().map(|&m| Marker::new(t(m), "note")).collect()
    }

    #[test]
    fn test_two_marker_scenario() {
        let markers = markers_at(&[0, 120]);
        let windows = compute_boundaries(&markers, &SegmentationParams::default());

        assert_eq!(windows[0], Period::new(t(-180), t(180)));
        assert_eq!(windows[1], Period::new(t(0), t(360)));
    }

    #[test]
    fn test_next_marker_beyond_minimum_lookahead() {
        let markers = markers_at(&[0, 300]);
        let windows = compute_boundaries(&markers, &SegmentationParams::default());
        assert_eq!(windows[0].end, t(300));
    }

    #[test]
    fn test_boundary_invariants_hold() {
        let params = SegmentationParams::default();
        let markers = markers_at(&[0, 5, 30, 400, 401, 1000]);
        let windows = compute_boundaries(&markers, &params);

        for (i, (marker, window)) in markers.iter().zip(&windows).enumerate() {
            assert!(window.start <= marker.timestamp && marker.timestamp <= window.end);
            assert!(window.end >= marker.timestamp + params.minimum_lookahead);
            if i > 0 {
                assert_eq!(window.start, markers[i - 1].timestamp);
            }
        }
    }

    #[test]
    fn test_compute_boundaries_idempotent() {
        let params = SegmentationParams::default();
        let markers = markers_at(&[0, 60, 600]);
        assert_eq!(
            compute_boundaries(&markers, &params),
            compute_boundaries(&markers, &params)
        );
    }

    #[test]
    fn test_insert_between_changes_only_predecessor_end() {
        let params = SegmentationParams::default();
        let before = markers_at(&[0, 600, 1200]);
        let mut after = before.clone();
        after.push(Marker::new(t(900), "inserted"));
        sort_markers(&mut after);

        let old = compute_boundaries(&before, &params);
        let new = compute_boundaries(&after, &params);

        assert_eq!(old[0], new[0]);
        assert_eq!(old[1].start, new[1].start);
        assert_ne!(old[1].end, new[1].end);
        assert_eq!(new[1].end, t(900));
    }

    #[test]
    fn test_out_of_range_index() {
        assert!(boundaries_at(&[], 0, &SegmentationParams::default()).is_none());
    }
}
