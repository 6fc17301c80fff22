//! Period summaries with a per-day breakdown.

use super::{complete_request, fail_request, start_request, Enrichment, EnrichmentWorkflow};
use super::{AnalysisRequest, LiveSettings, RequestPayload};
use crate::analyzer::AnalysisContext;
use crate::core::stats::{compute_daily_stats, compute_range_stats};
use crate::error::{EngineError, Result};
use crate::queue::{Job, JobKind};
use crate::store::{MeasurementRepository, SharedStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

pub struct PeriodSummary {
    store: SharedStore,
    settings: LiveSettings,
}

impl PeriodSummary {
    pub fn new(store: SharedStore, settings: LiveSettings) -> Self {
        Self { store, settings }
    }
}

#[async_trait]
impl EnrichmentWorkflow for PeriodSummary {
    type Subject = AnalysisRequest;

    fn kind(&self) -> JobKind {
        JobKind::PeriodSummary
    }

    async fn prepare(&self, job: &Job) -> Result<(AnalysisRequest, AnalysisContext)> {
        let request = start_request(&self.store, job, JobKind::PeriodSummary).await?;
        let RequestPayload::Summary { period } = request.payload else {
            return Err(EngineError::Invariant(format!(
                "request {} has no summary payload",
                request.id
            )));
        };

        let settings = self.settings.get();
        let readings = self.store.query_range(period.start, period.end).await?;
        let context = AnalysisContext {
            kind: JobKind::PeriodSummary,
            subject_id: request.id,
            prompt: "Summarize this period.".into(),
            data: json!({
                "period": period,
                "timezone": settings.timezone.name(),
                "stats": compute_range_stats(&readings, &settings.band),
                "daily": compute_daily_stats(&readings, &settings.band, settings.timezone),
            }),
        };
        Ok((request, context))
    }

    async fn apply(&self, _job: &Job, request: AnalysisRequest, enrichment: Enrichment) -> Result<()> {
        complete_request(&self.store, request, enrichment).await
    }

    async fn record_failure(&self, job: &Job, error: &EngineError, now: DateTime<Utc>) -> Result<()> {
        fail_request(&self.store, job, error, now).await
    }
}
