//! Incremental window recomputation.
//!
//! The cascade turns "a marker was inserted" or "readings arrived" into the
//! minimal set of window updates, persists them, and reports which windows
//! now need enrichment. It never talks to the queue; scheduling (and the
//! cooldown) is the caller's business.

use crate::core::change::has_changed;
use crate::core::segmentation::{boundaries_at, compute_boundaries, sort_markers, SegmentationParams};
use crate::core::stats::compute_window_stats;
use crate::core::types::{EnrichmentReason, Marker, Period, TargetBand, Window, WindowStats};
use crate::error::{EngineError, Result};
use crate::store::{MarkerRepository, MeasurementRepository, SharedStore, WindowRepository};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Serializes read-modify-write cycles on window rows.
///
/// Every writer holds it from its first window read to its last window
/// write: the cascades run by the engine and the window-analysis worker's
/// projection and failure records.
#[derive(Debug, Clone, Default)]
pub struct WindowLock(Arc<Mutex<()>>);

impl WindowLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        self.0.clone().lock_owned().await
    }
}

/// Parameters the cascade recomputes with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeSettings {
    pub segmentation: SegmentationParams,
    pub band: TargetBand,
    pub epsilon: f64,
}

impl Default for CascadeSettings {
    fn default() -> Self {
        Self {
            segmentation: SegmentationParams::default(),
            band: TargetBand::default(),
            epsilon: 0.001,
        }
    }
}

/// A window that may need enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub window: Window,
    /// Boundaries moved; bypasses the cooldown
    pub forced: bool,
    pub reason: EnrichmentReason,
}

impl Candidate {
    fn initial(window: Window) -> Self {
        Self {
            window,
            forced: false,
            reason: EnrichmentReason::Initial,
        }
    }

    fn boundary_changed(window: Window) -> Self {
        Self {
            window,
            forced: true,
            reason: EnrichmentReason::BoundaryChanged,
        }
    }

    fn new_data(window: Window) -> Self {
        Self {
            window,
            forced: false,
            reason: EnrichmentReason::NewData,
        }
    }
}

/// What one cascade run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CascadeOutcome {
    /// Windows created or rewritten
    pub recomputed: usize,
    pub candidates: Vec<Candidate>,
}

impl CascadeOutcome {
    fn merge(&mut self, other: CascadeOutcome) {
        self.recomputed += other.recomputed;
        self.candidates.extend(other.candidates);
    }
}

pub struct RecomputeCascade {
    store: SharedStore,
    settings: CascadeSettings,
}

impl RecomputeCascade {
    pub fn new(store: SharedStore, settings: CascadeSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &CascadeSettings {
        &self.settings
    }

    /// Stats over the full period, recomputed from scratch.
    pub async fn recompute_stats(&self, period: Period, anchor: DateTime<Utc>) -> Result<WindowStats> {
        let readings = self.store.query_range(period.start, period.end).await?;
        Ok(compute_window_stats(&readings, anchor, &self.settings.band))
    }

    async fn sorted_markers(&self) -> Result<Vec<Marker>> {
        let mut markers = self.store.list_markers().await?;
        sort_markers(&mut markers);
        Ok(markers)
    }

    /// Create the window of a stored marker and move its predecessor's end.
    ///
    /// The predecessor is persisted first. Later markers are left alone;
    /// [`RecomputeCascade::rebuild_all`] repairs their start boundaries.
    pub async fn on_marker_inserted(&self, marker_id: Uuid) -> Result<CascadeOutcome> {
        let markers = self.sorted_markers().await?;
        let index = markers
            .iter()
            .position(|m| m.id == marker_id)
            .ok_or_else(|| EngineError::not_found("marker", marker_id))?;
        let params = &self.settings.segmentation;
        let mut outcome = CascadeOutcome::default();

        if index > 0 {
            let previous = &markers[index - 1];
            match self.store.get_window(previous.id).await? {
                Some(existing) => {
                    let end = boundaries_at(&markers, index - 1, params)
                        .map(|p| p.end)
                        .ok_or_else(|| EngineError::Invariant("marker index out of range".into()))?;
                    let period = Period::new(existing.period_start, end);
                    let stats = self.recompute_stats(period, previous.timestamp).await?;
                    let moved = existing.period() != period;

                    if moved || stats != existing.stats {
                        let updated = existing.recomputed(period, stats);
                        self.store.upsert_window(updated.clone()).await?;
                        outcome.recomputed += 1;
                        tracing::debug!(
                            marker = %previous.id,
                            end = %period.end,
                            "previous window end moved"
                        );
                        if moved {
                            outcome.candidates.push(Candidate::boundary_changed(updated));
                        }
                    }
                }
                None => {
                    tracing::debug!(marker = %previous.id, "previous marker has no window yet");
                }
            }
        }

        let marker = &markers[index];
        let period = boundaries_at(&markers, index, params)
            .ok_or_else(|| EngineError::Invariant("marker index out of range".into()))?;
        let stats = self.recompute_stats(period, marker.timestamp).await?;

        let window = match self.store.get_window(marker.id).await? {
            Some(existing) => existing.recomputed(period, stats),
            None => Window::new(marker, period, stats),
        };
        self.store.upsert_window(window.clone()).await?;
        outcome.recomputed += 1;

        if !window.enriched && has_changed(None, Some(&window.stats), self.settings.epsilon) {
            outcome.candidates.push(Candidate::initial(window));
        }

        tracing::info!(
            marker = %marker_id,
            recomputed = outcome.recomputed,
            candidates = outcome.candidates.len(),
            "marker cascade finished"
        );
        Ok(outcome)
    }

    /// Recompute every window whose boundaries intersect `[min, max]`.
    ///
    /// Only windows whose stats changed beyond epsilon are rewritten and
    /// returned.
    pub async fn on_measurements_arrived(
        &self,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    ) -> Result<CascadeOutcome> {
        let windows = self.store.list_overlapping(min, max).await?;
        let mut outcome = CascadeOutcome::default();

        for window in windows {
            let stats = self.recompute_stats(window.period(), window.anchor).await?;
            if !has_changed(Some(&window.stats), Some(&stats), self.settings.epsilon) {
                continue;
            }
            let updated = window.recomputed(window.period(), stats);
            self.store.upsert_window(updated.clone()).await?;
            outcome.recomputed += 1;
            outcome.candidates.push(Candidate::new_data(updated));
        }

        tracing::info!(
            %min,
            %max,
            recomputed = outcome.recomputed,
            "measurement cascade finished"
        );
        Ok(outcome)
    }

    /// Recompute every window from the full marker list.
    ///
    /// Fails with an invariant error if a window exists whose marker does not.
    pub async fn rebuild_all(&self) -> Result<CascadeOutcome> {
        let markers = self.sorted_markers().await?;
        let known: HashSet<Uuid> = markers.iter().map(|m| m.id).collect();
        if let Some(orphan) = self
            .store
            .list_windows()
            .await?
            .into_iter()
            .find(|w| !known.contains(&w.marker_id))
        {
            return Err(EngineError::Invariant(format!(
                "window {} has no marker",
                orphan.marker_id
            )));
        }

        let periods = compute_boundaries(&markers, &self.settings.segmentation);
        let mut outcome = CascadeOutcome::default();

        for (marker, period) in markers.iter().zip(periods) {
            outcome.merge(self.rebuild_one(marker, period).await?);
        }

        tracing::info!(
            markers = markers.len(),
            recomputed = outcome.recomputed,
            candidates = outcome.candidates.len(),
            "full rebuild finished"
        );
        Ok(outcome)
    }

    async fn rebuild_one(&self, marker: &Marker, period: Period) -> Result<CascadeOutcome> {
        let stats = self.recompute_stats(period, marker.timestamp).await?;
        let epsilon = self.settings.epsilon;
        let mut outcome = CascadeOutcome::default();

        let Some(existing) = self.store.get_window(marker.id).await? else {
            let window = Window::new(marker, period, stats);
            self.store.upsert_window(window.clone()).await?;
            outcome.recomputed = 1;
            if has_changed(None, Some(&window.stats), epsilon) {
                outcome.candidates.push(Candidate::initial(window));
            }
            return Ok(outcome);
        };

        let moved = existing.period() != period;
        let drifted = has_changed(Some(&existing.stats), Some(&stats), epsilon);
        if !moved && !drifted {
            return Ok(outcome);
        }

        let updated = existing.recomputed(period, stats);
        self.store.upsert_window(updated.clone()).await?;
        outcome.recomputed = 1;
        outcome.candidates.push(if moved {
            Candidate::boundary_changed(updated)
        } else {
            Candidate::new_data(updated)
        });
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Measurement;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn setup() -> (Arc<MemoryStore>, RecomputeCascade) {
        let store = Arc::new(MemoryStore::new());
        let cascade = RecomputeCascade::new(store.clone(), CascadeSettings::default());
        (store, cascade)
    }

    async fn insert(store: &MemoryStore, cascade: &RecomputeCascade, at: i64) -> (Marker, CascadeOutcome) {
        let marker = Marker::new(t(at), format!("note at {at}"));
        store.insert_marker(marker.clone()).await.unwrap();
        let outcome = cascade.on_marker_inserted(marker.id).await.unwrap();
        (marker, outcome)
    }

    #[tokio::test]
    async fn test_two_marker_scenario() {
        let (store, cascade) = setup();
        store
            .append_measurements(vec![Measurement::new(t(10), 120.0), Measurement::new(t(150), 140.0)])
            .await
            .unwrap();

        let (first, outcome) = insert(&store, &cascade, 0).await;
        assert_eq!(outcome.recomputed, 1);
        assert_eq!(outcome.candidates[0].reason, EnrichmentReason::Initial);
        let window = store.get_window(first.id).await.unwrap().unwrap();
        assert_eq!(window.period(), Period::new(t(-180), t(240)));

        let (second, outcome) = insert(&store, &cascade, 120).await;
        let first_window = store.get_window(first.id).await.unwrap().unwrap();
        let second_window = store.get_window(second.id).await.unwrap().unwrap();
        assert_eq!(first_window.period(), Period::new(t(-180), t(180)));
        assert_eq!(second_window.period(), Period::new(t(0), t(360)));

        let forced: Vec<_> = outcome.candidates.iter().filter(|c| c.forced).collect();
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].window.marker_id, first.id);
        assert_eq!(forced[0].reason, EnrichmentReason::BoundaryChanged);
    }

    #[tokio::test]
    async fn test_insert_between_only_moves_previous_end() {
        let (store, cascade) = setup();
        let (earliest, _) = insert(&store, &cascade, -600).await;
        let (before, _) = insert(&store, &cascade, 0).await;
        let (after, _) = insert(&store, &cascade, 600).await;

        let earliest_window = store.get_window(earliest.id).await.unwrap().unwrap();
        let after_window = store.get_window(after.id).await.unwrap().unwrap();

        let (between, _) = insert(&store, &cascade, 300).await;

        assert_eq!(
            store.get_window(earliest.id).await.unwrap().unwrap(),
            earliest_window
        );
        assert_eq!(store.get_window(after.id).await.unwrap().unwrap(), after_window);

        let before_window = store.get_window(before.id).await.unwrap().unwrap();
        assert_eq!(before_window.period(), Period::new(t(-600), t(300)));

        let between_window = store.get_window(between.id).await.unwrap().unwrap();
        assert_eq!(between_window.period(), Period::new(t(0), t(600)));
    }

    #[tokio::test]
    async fn test_empty_window_is_not_a_candidate() {
        let (store, cascade) = setup();
        let (_, outcome) = insert(&store, &cascade, 0).await;
        assert_eq!(outcome.recomputed, 1);
        assert!(outcome.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_measurements_only_touch_overlapping_windows() {
        let (store, cascade) = setup();
        let (early, _) = insert(&store, &cascade, 0).await;
        let (late, _) = insert(&store, &cascade, 1000).await;

        store
            .append_measurements(vec![Measurement::new(t(1100), 150.0)])
            .await
            .unwrap();
        let outcome = cascade.on_measurements_arrived(t(1100), t(1100)).await.unwrap();

        assert_eq!(outcome.recomputed, 1);
        assert_eq!(outcome.candidates[0].window.marker_id, late.id);
        assert!(!outcome.candidates[0].forced);
        assert_eq!(outcome.candidates[0].reason, EnrichmentReason::NewData);
        assert_eq!(
            store.get_window(early.id).await.unwrap().unwrap().stats.count,
            0
        );

        // Same data again: nothing changed.
        let outcome = cascade.on_measurements_arrived(t(1100), t(1100)).await.unwrap();
        assert_eq!(outcome.recomputed, 0);
    }

    #[tokio::test]
    async fn test_rebuild_repairs_later_start() {
        let (store, cascade) = setup();
        insert(&store, &cascade, 0).await;
        let (after, _) = insert(&store, &cascade, 600).await;
        insert(&store, &cascade, 300).await;

        let stale = store.get_window(after.id).await.unwrap().unwrap();
        assert_eq!(stale.period_start, t(0));

        let outcome = cascade.rebuild_all().await.unwrap();
        let repaired = store.get_window(after.id).await.unwrap().unwrap();
        assert_eq!(repaired.period_start, t(300));
        assert!(outcome
            .candidates
            .iter()
            .any(|c| c.window.marker_id == after.id && c.forced));

        let again = cascade.rebuild_all().await.unwrap();
        assert_eq!(again.recomputed, 0);
    }

    #[tokio::test]
    async fn test_rebuild_rejects_orphan_window() {
        let (store, cascade) = setup();
        let ghost = Marker::new(t(0), "never stored");
        store
            .upsert_window(Window::new(&ghost, Period::new(t(-180), t(240)), WindowStats::empty()))
            .await
            .unwrap();

        let err = cascade.rebuild_all().await.unwrap_err();
        assert!(err.is_fatal());
    }
}
