//! Change detection and the re-enrichment cooldown.

use crate::core::types::{EnrichmentHistoryEntry, Window, WindowStats};
use chrono::{DateTime, Duration, Utc};

fn defined(stats: Option<&WindowStats>) -> Option<&WindowStats> {
    stats.filter(|s| s.has_data())
}

fn differs(a: Option<f64>, b: Option<f64>, epsilon: f64) -> bool {
    match (a, b) {
        (None, None) => false,
        (Some(a), Some(b)) => (a - b).abs() > epsilon,
        _ => true,
    }
}

/// Null-aware comparison of two stats snapshots.
///
/// A snapshot with no readings counts as undefined. Counts must match
/// exactly; every other numeric field is compared within `epsilon`.
pub fn has_changed(old: Option<&WindowStats>, new: Option<&WindowStats>, epsilon: f64) -> bool {
    let (old, new) = match (defined(old), defined(new)) {
        (None, None) => return false,
        (Some(old), Some(new)) => (old, new),
        _ => return true,
    };

    if old.count != new.count || old.peak_time != new.peak_time {
        return true;
    }

    [
        (old.min, new.min),
        (old.max, new.max),
        (old.avg, new.avg),
        (old.std_dev, new.std_dev),
        (old.value_at_anchor, new.value_at_anchor),
        (old.spike, new.spike),
        (old.time_in_range_pct, new.time_in_range_pct),
        (old.time_above_range_pct, new.time_above_range_pct),
        (old.time_below_range_pct, new.time_below_range_pct),
    ]
    .into_iter()
    .any(|(a, b)| differs(a, b, epsilon))
}

/// Whether `window` may be sent for enrichment now.
///
/// Forced requests (the window's boundaries just moved) always pass. A
/// window that was never enriched always passes. Otherwise the most recent
/// history entry must be at least `cooldown` old.
pub fn may_reanalyze(
    window: &Window,
    history: &[EnrichmentHistoryEntry],
    cooldown: Duration,
    forced: bool,
    now: DateTime<Utc>,
) -> bool {
    if forced {
        return true;
    }

    let latest = history
        .iter()
        .filter(|entry| entry.window_id == window.id())
        .map(|entry| entry.analyzed_at)
        .max();

    match latest {
        None => true,
        Some(analyzed_at) => now - analyzed_at >= cooldown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{EnrichmentReason, Marker, Period};
    use uuid::Uuid;

    fn stats(avg: f64) -> WindowStats {
        WindowStats {
            count: 3,
            min: Some(avg - 10.0),
            max: Some(avg + 10.0),
            avg: Some(avg),
            std_dev: Some(10.0),
            ..WindowStats::default()
        }
    }

    fn entry(window: &Window, analyzed_at: DateTime<Utc>) -> EnrichmentHistoryEntry {
        EnrichmentHistoryEntry {
            id: Uuid::new_v4(),
            window_id: window.id(),
            stats_at_time: window.stats.clone(),
            result: "ok".into(),
            classification: None,
            reason: EnrichmentReason::Initial,
            model: None,
            analyzed_at,
        }
    }

    fn window() -> Window {
        let marker = Marker::new(Utc::now(), "breakfast");
        let period = Period::new(marker.timestamp, marker.timestamp + Duration::hours(3));
        Window::new(&marker, period, stats(120.0))
    }

    #[test]
    fn test_has_changed_reflexive() {
        let s = stats(120.0);
        assert!(!has_changed(Some(&s), Some(&s), 0.0));
        assert!(!has_changed(None, None, 0.001));
    }

    #[test]
    fn test_has_changed_null_awareness() {
        let s = stats(120.0);
        assert!(has_changed(None, Some(&s), 0.001));
        assert!(has_changed(Some(&s), None, 0.001));
        // A no-data snapshot is the same as no snapshot.
        assert!(!has_changed(None, Some(&WindowStats::empty()), 0.001));
    }

    #[test]
    fn test_has_changed_epsilon() {
        let a = stats(120.0);
        let b = stats(120.0005);
        assert!(!has_changed(Some(&a), Some(&b), 0.001));
        assert!(has_changed(Some(&a), Some(&stats(121.0)), 0.001));
    }

    #[test]
    fn test_count_mismatch_always_changes() {
        let a = stats(120.0);
        let b = WindowStats { count: 4, ..a.clone() };
        assert!(has_changed(Some(&a), Some(&b), f64::MAX));
    }

    #[test]
    fn test_cooldown_blocks_recent_history() {
        let w = window();
        let now = Utc::now();
        let history = vec![entry(&w, now - Duration::minutes(10))];
        let cooldown = Duration::minutes(30);

        assert!(!may_reanalyze(&w, &history, cooldown, false, now));
        assert!(may_reanalyze(&w, &history, cooldown, true, now));
        assert!(may_reanalyze(&w, &history, cooldown, false, now + Duration::minutes(20)));
    }

    #[test]
    fn test_first_analysis_always_allowed() {
        let w = window();
        assert!(may_reanalyze(&w, &[], Duration::minutes(30), false, Utc::now()));
    }
}
