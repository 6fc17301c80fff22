//! Side-by-side comparison of two periods.

use super::{complete_request, fail_request, start_request, Enrichment, EnrichmentWorkflow};
use super::{AnalysisRequest, LiveSettings, RequestPayload};
use crate::analyzer::AnalysisContext;
use crate::core::stats::compute_range_stats;
use crate::core::types::{Period, RangeStats, TargetBand};
use crate::error::{EngineError, Result};
use crate::queue::{Job, JobKind};
use crate::store::{MeasurementRepository, SharedStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

pub struct PeriodComparison {
    store: SharedStore,
    settings: LiveSettings,
}

impl PeriodComparison {
    pub fn new(store: SharedStore, settings: LiveSettings) -> Self {
        Self { store, settings }
    }

    async fn range_stats(&self, period: Period, band: &TargetBand) -> Result<RangeStats> {
        let readings = self.store.query_range(period.start, period.end).await?;
        Ok(compute_range_stats(&readings, band))
    }
}

fn delta(first: Option<f64>, second: Option<f64>) -> Option<f64> {
    Some(second? - first?)
}

#[async_trait]
impl EnrichmentWorkflow for PeriodComparison {
    type Subject = AnalysisRequest;

    fn kind(&self) -> JobKind {
        JobKind::PeriodComparison
    }

    async fn prepare(&self, job: &Job) -> Result<(AnalysisRequest, AnalysisContext)> {
        let request = start_request(&self.store, job, JobKind::PeriodComparison).await?;
        let RequestPayload::Comparison { first, second } = request.payload else {
            return Err(EngineError::Invariant(format!(
                "request {} has no comparison payload",
                request.id
            )));
        };

        let band = self.settings.get().band;
        let a = self.range_stats(first, &band).await?;
        let b = self.range_stats(second, &band).await?;

        let context = AnalysisContext {
            kind: JobKind::PeriodComparison,
            subject_id: request.id,
            prompt: "Compare the two periods and explain what changed.".into(),
            data: json!({
                "first": a,
                "second": b,
                "periods": { "first": first, "second": second },
                "delta": {
                    "avg": delta(a.avg, b.avg),
                    "time_in_range_pct": delta(a.time_in_range_pct, b.time_in_range_pct),
                },
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
