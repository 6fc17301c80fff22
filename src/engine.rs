//! Engine facade.
//!
//! Everything that changes the data set goes through [`Engine`]: it stores
//! the new readings or marker, runs the matching cascade, applies the
//! cooldown and hands the survivors to the window-analysis queue. User
//! requests are created and queued here too.
//!
//! Cascades run under the shared [`WindowLock`]. Readings are recomputed
//! from the store's pending range rather than from the batch at hand, so a
//! cascade that fails after its readings were stored is redone by the next
//! ingest or catch-up cycle.

use crate::activity::{NotificationKind, SharedSink};
use crate::cascade::{Candidate, CascadeOutcome, CascadeSettings, RecomputeCascade, WindowLock};
use crate::clock::SharedClock;
use crate::config::Config;
use crate::core::change::may_reanalyze;
use crate::core::types::{EnrichmentReason, Marker, Measurement, Period};
use crate::error::{ConfigError, EngineError, Result};
use crate::queue::{EnqueueRequest, JobKind, JobStatus, QueueHandle};
use crate::store::{
    HistoryRepository, JobRepository, MarkerRepository, MeasurementRepository, RequestRepository,
    SharedStore, WindowRepository,
};
use crate::workflows::{AnalysisRequest, RequestPayload};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use uuid::Uuid;

/// Engine knobs that may change between cycles.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub cascade: CascadeSettings,
    pub cooldown: Duration,
    /// Skip scheduling; data is still stored and recomputed
    pub paused: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            cascade: CascadeSettings::default(),
            cooldown: Duration::minutes(30),
            paused: false,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            cascade: CascadeSettings {
                segmentation: config.segmentation_params(),
                band: config.target_band,
                epsilon: config.change_epsilon,
            },
            cooldown: config.cooldown(),
            paused: config.paused,
        })
    }
}

/// Queue handles, one per job kind.
#[derive(Clone)]
pub struct QueueHandles {
    pub window_analysis: QueueHandle,
    pub chat: QueueHandle,
    pub comparison: QueueHandle,
    pub summary: QueueHandle,
}

impl QueueHandles {
    pub fn for_kind(&self, kind: JobKind) -> &QueueHandle {
        match kind {
            JobKind::WindowAnalysis => &self.window_analysis,
            JobKind::ChatTurn => &self.chat,
            JobKind::PeriodComparison => &self.comparison,
            JobKind::PeriodSummary => &self.summary,
        }
    }
}

/// What one engine call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Readings or markers actually stored
    pub accepted: usize,
    pub recomputed: usize,
    pub candidates: usize,
    /// Jobs enqueued after the cooldown
    pub scheduled: usize,
}

pub struct Engine {
    store: SharedStore,
    clock: SharedClock,
    sink: SharedSink,
    queues: QueueHandles,
    settings: RwLock<EngineSettings>,
    windows: WindowLock,
}

impl Engine {
    /// `windows` must be the lock the window-analysis workflow holds.
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        sink: SharedSink,
        queues: QueueHandles,
        settings: EngineSettings,
        windows: WindowLock,
    ) -> Self {
        Self {
            store,
            clock,
            sink,
            queues,
            settings: RwLock::new(settings),
            windows,
        }
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn update_settings(&self, settings: EngineSettings) {
        let mut current = self.settings.write().unwrap_or_else(|e| e.into_inner());
        if *current != settings {
            tracing::info!(paused = settings.paused, "engine settings reloaded");
            *current = settings;
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    fn cascade(&self, settings: &EngineSettings) -> RecomputeCascade {
        RecomputeCascade::new(self.store.clone(), settings.cascade)
    }

    /// Store a batch of readings and recompute the windows it touches.
    ///
    /// Windows left stale by an earlier failed run are recomputed too, even
    /// when every reading in `batch` is already known.
    pub async fn ingest_measurements(&self, batch: Vec<Measurement>) -> Result<CycleReport> {
        let settings = self.settings();
        let (finite, dropped): (Vec<_>, Vec<_>) =
            batch.into_iter().partition(|m| m.value.is_finite());
        if !dropped.is_empty() {
            tracing::warn!(count = dropped.len(), "dropping non-finite readings");
        }

        let (accepted, outcome) = {
            let _guard = self.windows.acquire().await;
            let accepted = self.store.append_measurements(finite).await?;
            if !accepted.is_empty() {
                self.sink
                    .publish(NotificationKind::MeasurementsIngested, accepted.len());
            }
            let outcome = self.recompute_pending(&self.cascade(&settings)).await?;
            (accepted.len(), outcome)
        };

        self.publish_recomputed(outcome.recomputed);
        let candidates = outcome.candidates.len();
        let scheduled = self.schedule(&settings, outcome.candidates).await?;
        Ok(CycleReport {
            accepted,
            recomputed: outcome.recomputed,
            candidates,
            scheduled,
        })
    }

    /// Run the measurement cascade over the store's pending range, then
    /// clear it. The caller holds the window lock.
    async fn recompute_pending(&self, cascade: &RecomputeCascade) -> Result<CascadeOutcome> {
        let Some(range) = self.store.pending_range().await? else {
            return Ok(CascadeOutcome::default());
        };
        let outcome = cascade.on_measurements_arrived(range.start, range.end).await?;
        self.store.clear_pending_range(range).await?;
        Ok(outcome)
    }

    /// Store a marker and run the insertion cascade.
    ///
    /// A marker whose id is already known is ignored.
    pub async fn insert_marker(&self, marker: Marker) -> Result<CycleReport> {
        let settings = self.settings();
        let marker_id = marker.id;

        let outcome = {
            let _guard = self.windows.acquire().await;
            if !self.store.insert_marker(marker).await? {
                tracing::debug!(marker = %marker_id, "marker already known");
                return Ok(CycleReport::default());
            }
            self.sink.publish(NotificationKind::MarkersInserted, 1);
            self.cascade(&settings).on_marker_inserted(marker_id).await?
        };

        self.publish_recomputed(outcome.recomputed);
        let candidates = outcome.candidates.len();
        let scheduled = self.schedule(&settings, outcome.candidates).await?;
        Ok(CycleReport {
            accepted: 1,
            recomputed: outcome.recomputed,
            candidates,
            scheduled,
        })
    }

    /// Recompute everything from the full marker list.
    pub async fn rebuild(&self) -> Result<CycleReport> {
        let settings = self.settings();
        let outcome = {
            let _guard = self.windows.acquire().await;
            let cascade = self.cascade(&settings);
            let outcome = cascade.rebuild_all().await?;
            // Every window was just recomputed from scratch.
            if let Some(range) = self.store.pending_range().await? {
                self.store.clear_pending_range(range).await?;
            }
            outcome
        };
        self.publish_recomputed(outcome.recomputed);
        let candidates = outcome.candidates.len();
        let scheduled = self.schedule(&settings, outcome.candidates).await?;
        Ok(CycleReport {
            accepted: 0,
            recomputed: outcome.recomputed,
            candidates,
            scheduled,
        })
    }

    /// Finish interrupted recomputes, create missing windows, then re-offer
    /// unenriched windows with data.
    ///
    /// Windows with an open job are skipped. A window whose last analysis
    /// attempt failed less than one cooldown ago is left alone so soft
    /// failures do not loop.
    pub async fn catch_up(&self) -> Result<CycleReport> {
        let settings = self.settings();
        let mut report = CycleReport::default();
        let mut candidates = Vec::new();

        {
            let _guard = self.windows.acquire().await;
            let cascade = self.cascade(&settings);
            let pending = self.recompute_pending(&cascade).await?;
            report.recomputed += pending.recomputed;
            candidates.extend(pending.candidates);

            for marker in self.store.list_without_window().await? {
                let outcome = cascade.on_marker_inserted(marker.id).await?;
                report.recomputed += outcome.recomputed;
                candidates.extend(outcome.candidates);
            }
        }
        self.publish_recomputed(report.recomputed);

        let now = self.clock.now();
        let recent_failures = self.recent_failures(now, settings.cooldown).await?;
        let mut offered: HashSet<Uuid> = candidates.iter().map(|c| c.window.id()).collect();
        offered.extend(
            self.store
                .list_jobs(
                    JobKind::WindowAnalysis,
                    &[JobStatus::Pending, JobStatus::Processing],
                )
                .await?
                .into_iter()
                .map(|job| job.subject_id),
        );

        for window in self.store.list_unenriched().await? {
            if !window.stats.has_data()
                || offered.contains(&window.id())
                || recent_failures.contains(&window.id())
            {
                continue;
            }
            let reason = if self.store.latest_history(window.id()).await?.is_some() {
                EnrichmentReason::NewData
            } else {
                EnrichmentReason::Initial
            };
            offered.insert(window.id());
            candidates.push(Candidate {
                window,
                forced: false,
                reason,
            });
        }

        report.candidates = candidates.len();
        report.scheduled = self.schedule(&settings, candidates).await?;
        if report.recomputed > 0 || report.scheduled > 0 {
            tracing::info!(
                recomputed = report.recomputed,
                scheduled = report.scheduled,
                "catch-up cycle finished"
            );
        }
        Ok(report)
    }

    async fn recent_failures(&self, now: DateTime<Utc>, cooldown: Duration) -> Result<HashSet<Uuid>> {
        let mut latest: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
        for job in self
            .store
            .list_jobs(JobKind::WindowAnalysis, &[JobStatus::Failed])
            .await?
        {
            if let Some(finished) = job.finished_at {
                let entry = latest.entry(job.subject_id).or_insert(finished);
                *entry = (*entry).max(finished);
            }
        }
        Ok(latest
            .into_iter()
            .filter(|(_, finished)| now - *finished < cooldown)
            .map(|(id, _)| id)
            .collect())
    }

    /// Apply the cooldown and enqueue what is left. Returns the number of
    /// enqueued jobs.
    async fn schedule(&self, settings: &EngineSettings, candidates: Vec<Candidate>) -> Result<usize> {
        if settings.paused {
            if !candidates.is_empty() {
                tracing::info!(count = candidates.len(), "paused; not scheduling enrichment");
            }
            return Ok(0);
        }

        let now = self.clock.now();
        let mut scheduled = 0;
        for candidate in candidates {
            let window_id = candidate.window.id();
            let history = self.store.list_history(window_id).await?;
            if !may_reanalyze(
                &candidate.window,
                &history,
                settings.cooldown,
                candidate.forced,
                now,
            ) {
                tracing::debug!(window = %window_id, "cooldown active; skipping");
                continue;
            }

            self.queues
                .window_analysis
                .enqueue(EnqueueRequest::new(window_id, candidate.reason))
                .await?;
            scheduled += 1;
        }
        Ok(scheduled)
    }

    /// Queue a window for analysis regardless of cooldown.
    pub async fn request_window_analysis(
        &self,
        window_id: Uuid,
        model_override: Option<String>,
    ) -> Result<Uuid> {
        if self.store.get_window(window_id).await?.is_none() {
            return Err(EngineError::not_found("window", window_id));
        }
        let mut request = EnqueueRequest::new(window_id, EnrichmentReason::Requested);
        request.model_override = model_override;
        self.queues.window_analysis.enqueue(request).await
    }

    /// Create a request and queue its job.
    pub async fn submit_request(&self, payload: RequestPayload) -> Result<AnalysisRequest> {
        let request = AnalysisRequest::new(payload, self.clock.now());
        self.store.create_request(request.clone()).await?;
        self.queues
            .for_kind(request.kind())
            .enqueue(EnqueueRequest::new(request.id, EnrichmentReason::Requested))
            .await?;
        tracing::info!(kind = %request.kind(), request = %request.id, "request submitted");
        Ok(request)
    }

    pub async fn request_chat(
        &self,
        conversation_id: Uuid,
        message: impl Into<String>,
    ) -> Result<AnalysisRequest> {
        self.submit_request(RequestPayload::Chat {
            conversation_id,
            message: message.into(),
        })
        .await
    }

    pub async fn request_comparison(&self, first: Period, second: Period) -> Result<AnalysisRequest> {
        self.submit_request(RequestPayload::Comparison { first, second })
            .await
    }

    pub async fn request_summary(&self, period: Period) -> Result<AnalysisRequest> {
        self.submit_request(RequestPayload::Summary { period }).await
    }

    fn publish_recomputed(&self, count: usize) {
        if count > 0 {
            self.sink.publish(NotificationKind::WindowsRecomputed, count);
        }
    }
}
