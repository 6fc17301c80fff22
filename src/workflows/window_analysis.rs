//! Window analysis: the core enrichment of a marker window.

use super::{Enrichment, EnrichmentWorkflow};
use crate::analyzer::AnalysisContext;
use crate::cascade::WindowLock;
use crate::core::types::{EnrichmentHistoryEntry, Window};
use crate::error::{EngineError, Result};
use crate::queue::{truncate_error, Job, JobKind};
use crate::store::{HistoryRepository, MarkerRepository, SharedStore, WindowRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

pub struct WindowAnalysis {
    store: SharedStore,
    windows: WindowLock,
}

impl WindowAnalysis {
    /// `windows` must be the lock the engine's cascades hold.
    pub fn new(store: SharedStore, windows: WindowLock) -> Self {
        Self { store, windows }
    }
}

#[async_trait]
impl EnrichmentWorkflow for WindowAnalysis {
    type Subject = Window;

    fn kind(&self) -> JobKind {
        JobKind::WindowAnalysis
    }

    async fn prepare(&self, job: &Job) -> Result<(Window, AnalysisContext)> {
        let window = self
            .store
            .get_window(job.subject_id)
            .await?
            .ok_or_else(|| EngineError::not_found("window", job.subject_id))?;
        let marker = self
            .store
            .get_marker(window.marker_id)
            .await?
            .ok_or_else(|| {
                EngineError::Invariant(format!("window {} has no marker", window.marker_id))
            })?;

        let context = AnalysisContext {
            kind: JobKind::WindowAnalysis,
            subject_id: window.id(),
            prompt: format!(
                "Describe how readings responded around the note \"{}\" ({}).",
                marker.payload, job.reason
            ),
            data: json!({
                "marker": {
                    "timestamp": marker.timestamp,
                    "note": marker.payload,
                },
                "period": window.period(),
                "stats": window.stats,
                "previous_result": window.enrichment_result,
                "reason": job.reason,
            }),
        };
        Ok((window, context))
    }

    /// Append the history entry first, then re-project it onto the window as
    /// it is now. If the stats moved while the analyzer was busy, the window
    /// keeps the new result but stays unenriched.
    async fn apply(&self, job: &Job, subject: Window, enrichment: Enrichment) -> Result<()> {
        let entry = EnrichmentHistoryEntry {
            id: Uuid::new_v4(),
            window_id: subject.id(),
            stats_at_time: subject.stats.clone(),
            result: enrichment.result,
            classification: enrichment.classification,
            reason: job.reason,
            model: enrichment.model,
            analyzed_at: enrichment.analyzed_at,
        };
        self.store.append_history(entry.clone()).await?;

        let _guard = self.windows.acquire().await;
        let current = self
            .store
            .get_window(subject.id())
            .await?
            .ok_or_else(|| EngineError::not_found("window", subject.id()))?;
        let projected = current.with_enrichment(&entry);
        if !projected.enriched {
            tracing::debug!(window = %projected.id(), "stats moved during analysis; window stays stale");
        }
        self.store.upsert_window(projected).await
    }

    /// Keep the error on the window next to its last good result.
    async fn record_failure(&self, job: &Job, error: &EngineError, now: DateTime<Utc>) -> Result<()> {
        let _guard = self.windows.acquire().await;
        let Some(window) = self.store.get_window(job.subject_id).await? else {
            return Ok(());
        };
        self.store
            .upsert_window(window.with_failure(truncate_error(&error.to_string()), now))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::OfflineAnalyzer;
    use crate::clock::{Clock, ManualClock, SharedClock};
    use crate::core::types::{EnrichmentReason, Marker, Period, WindowStats};
    use crate::queue::JobProcessor;
    use crate::store::MemoryStore;
    use crate::workflows::WorkflowProcessor;
    use crate::analyzer::{Analyzer, AnalyzerResponse};
    use crate::error::AnalyzerError;
    use chrono::Duration;
    use std::sync::Arc;

    struct Failing;

    #[async_trait]
    impl Analyzer for Failing {
        async fn enrich(
            &self,
            _context: &AnalysisContext,
            _model_hint: Option<&str>,
        ) -> std::result::Result<AnalyzerResponse, AnalyzerError> {
            Err(AnalyzerError::Server {
                status: 503,
                message: "overloaded".into(),
            })
        }
    }

    fn stats(count: usize, spike: f64) -> WindowStats {
        WindowStats {
            count,
            avg: Some(120.0),
            spike: Some(spike),
            ..WindowStats::default()
        }
    }

    #[tokio::test]
    async fn test_history_is_append_only() {
        let store = Arc::new(MemoryStore::new());
        let shared: SharedStore = store.clone();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let shared_clock: SharedClock = clock.clone();
        let processor = WorkflowProcessor::new(
            WindowAnalysis::new(shared.clone(), WindowLock::new()),
            Arc::new(OfflineAnalyzer::new()),
            shared,
            shared_clock,
        );

        let marker = Marker::new(clock.now(), "pasta");
        store.insert_marker(marker.clone()).await.unwrap();
        let period = Period::new(marker.timestamp - Duration::hours(3), marker.timestamp + Duration::hours(4));
        store
            .upsert_window(Window::new(&marker, period, stats(10, 70.0)))
            .await
            .unwrap();

        for (i, spike) in [70.0, 35.0, 5.0].into_iter().enumerate() {
            let mut window = store.get_window(marker.id).await.unwrap().unwrap();
            window = window.recomputed(period, stats(10 + i, spike));
            store.upsert_window(window).await.unwrap();

            let job = Job::new(
                JobKind::WindowAnalysis,
                marker.id,
                EnrichmentReason::NewData,
                None,
                clock.now(),
            );
            processor.process(&job).await.unwrap();
            clock.advance(Duration::minutes(45));
        }

        let history = store.list_history(marker.id).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].classification.as_deref(), Some("sharp_rise"));
        assert_eq!(history[2].classification.as_deref(), Some("steady"));

        let window = store.get_window(marker.id).await.unwrap().unwrap();
        assert!(window.enriched);
        assert_eq!(window.enrichment_result.as_deref(), Some(history[2].result.as_str()));
        assert_eq!(window.last_enriched_at, Some(history[2].analyzed_at));
    }

    #[tokio::test]
    async fn test_failure_is_recorded_on_window() {
        let store = Arc::new(MemoryStore::new());
        let shared: SharedStore = store.clone();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let processor = WorkflowProcessor::new(
            WindowAnalysis::new(shared.clone(), WindowLock::new()),
            Arc::new(Failing),
            shared,
            clock.clone(),
        );

        let marker = Marker::new(clock.now(), "curry");
        store.insert_marker(marker.clone()).await.unwrap();
        let period = Period::new(marker.timestamp, marker.timestamp + Duration::hours(4));
        store
            .upsert_window(Window::new(&marker, period, stats(6, 40.0)))
            .await
            .unwrap();

        let job = Job::new(
            JobKind::WindowAnalysis,
            marker.id,
            EnrichmentReason::Initial,
            None,
            clock.now(),
        );
        assert!(processor.process(&job).await.is_err());

        let window = store.get_window(marker.id).await.unwrap().unwrap();
        assert!(window.failed());
        assert!(!window.enriched);
        assert_eq!(window.last_failed_at, Some(clock.now()));
        assert!(window.last_error.as_deref().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_missing_marker_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        let shared: SharedStore = store.clone();
        let orphan = Marker::new(Utc::now(), "ghost");
        store
            .upsert_window(Window::new(
                &orphan,
                Period::new(orphan.timestamp, orphan.timestamp),
                WindowStats::empty(),
            ))
            .await
            .unwrap();

        let workflow = WindowAnalysis::new(shared, WindowLock::new());
        let job = Job::new(
            JobKind::WindowAnalysis,
            orphan.id,
            EnrichmentReason::Initial,
            None,
            Utc::now(),
        );
        let err = workflow.prepare(&job).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
