//! Enrichment workflows.
//!
//! Each workflow says how to load its subject, what the analyzer should see
//! and where the answer goes. [`WorkflowProcessor`] wraps any of them into a
//! [`JobProcessor`] so the four queues share one calling convention: model
//! resolution, usage accounting and soft-failure handling live here once.

pub mod chat;
pub mod comparison;
pub mod request;
pub mod summary;
pub mod window_analysis;

use crate::analyzer::{AnalysisContext, SharedAnalyzer};
use crate::clock::SharedClock;
use crate::config::Config;
use crate::core::types::TargetBand;
use crate::error::{ConfigError, EngineError, Result};
use crate::queue::{truncate_error, Job, JobKind, JobProcessor, JobStatus};
use crate::store::{RequestRepository, SharedStore, UsageRecord, UsageRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::{Arc, RwLock};

pub use chat::ChatTurn;
pub use comparison::PeriodComparison;
pub use request::{AnalysisRequest, RequestPayload};
pub use summary::PeriodSummary;
pub use window_analysis::WindowAnalysis;

/// Analysis parameters, read at the start of every job.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisSettings {
    pub band: TargetBand,
    /// Day boundaries for summaries
    pub timezone: Tz,
    pub default_model: Option<String>,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            band: TargetBand::default(),
            timezone: chrono_tz::UTC,
            default_model: None,
        }
    }
}

impl AnalysisSettings {
    pub fn from_config(config: &Config) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            band: config.target_band,
            timezone: config.tz()?,
            default_model: config.analyzer.default_model.clone(),
        })
    }
}

/// Shared [`AnalysisSettings`]; the agent replaces them on config reload.
#[derive(Debug, Clone, Default)]
pub struct LiveSettings(Arc<RwLock<AnalysisSettings>>);

impl LiveSettings {
    pub fn new(settings: AnalysisSettings) -> Self {
        Self(Arc::new(RwLock::new(settings)))
    }

    pub fn get(&self) -> AnalysisSettings {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Returns true if anything changed.
    pub fn replace(&self, settings: AnalysisSettings) -> bool {
        let mut current = self.0.write().unwrap_or_else(|e| e.into_inner());
        if *current == settings {
            return false;
        }
        *current = settings;
        true
    }
}

/// A usable analyzer answer, ready to be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrichment {
    pub result: String,
    pub classification: Option<String>,
    pub model: Option<String>,
    pub analyzed_at: DateTime<Utc>,
}

#[async_trait]
pub trait EnrichmentWorkflow: Send + Sync + 'static {
    /// What the job's `subject_id` refers to.
    type Subject: Send + Sync;

    fn kind(&self) -> JobKind;

    /// Load the subject and build the analyzer context.
    async fn prepare(&self, job: &Job) -> Result<(Self::Subject, AnalysisContext)>;

    /// Persist a usable answer.
    async fn apply(&self, job: &Job, subject: Self::Subject, enrichment: Enrichment) -> Result<()>;

    /// Surface a failure on the subject. The job itself is marked by the queue.
    async fn record_failure(
        &self,
        _job: &Job,
        _error: &EngineError,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Adapts an [`EnrichmentWorkflow`] to the queue.
pub struct WorkflowProcessor<W> {
    workflow: W,
    analyzer: SharedAnalyzer,
    store: SharedStore,
    clock: SharedClock,
    settings: LiveSettings,
}

impl<W: EnrichmentWorkflow> WorkflowProcessor<W> {
    pub fn new(workflow: W, analyzer: SharedAnalyzer, store: SharedStore, clock: SharedClock) -> Self {
        Self {
            workflow,
            analyzer,
            store,
            clock,
            settings: LiveSettings::default(),
        }
    }

    /// Read the default model from `settings` on every job.
    pub fn with_settings(mut self, settings: LiveSettings) -> Self {
        self.settings = settings;
        self
    }

    async fn run(&self, job: &Job) -> Result<()> {
        let (subject, context) = self.workflow.prepare(job).await?;
        let default_model = self.settings.get().default_model;
        let model = job.model_override.as_deref().or(default_model.as_deref());

        let response = self.analyzer.enrich(&context, model).await?;
        let text = response.usable_text().map(str::to_string);

        self.store
            .record_usage(UsageRecord {
                job_id: job.id,
                kind: job.kind,
                subject_id: job.subject_id,
                usage: response.usage.clone(),
                succeeded: text.is_some(),
                recorded_at: self.clock.now(),
            })
            .await?;

        let Some(result) = text else {
            return Err(EngineError::EmptyResponse);
        };

        let enrichment = Enrichment {
            result,
            classification: response.label(),
            model: response.usage.model.clone().or_else(|| model.map(str::to_string)),
            analyzed_at: self.clock.now(),
        };
        self.workflow.apply(job, subject, enrichment).await
    }
}

#[async_trait]
impl<W: EnrichmentWorkflow> JobProcessor for WorkflowProcessor<W> {
    fn kind(&self) -> JobKind {
        self.workflow.kind()
    }

    async fn process(&self, job: &Job) -> Result<()> {
        let result = self.run(job).await;
        if let Err(ref error) = result {
            let recorded = self
                .workflow
                .record_failure(job, error, self.clock.now())
                .await;
            if let Err(e) = recorded {
                tracing::warn!(kind = %job.kind, job_id = %job.id, "could not record failure: {e}");
            }
        }
        result
    }
}

/// Load a request and mark it processing.
pub(crate) async fn start_request(
    store: &SharedStore,
    job: &Job,
    expected: JobKind,
) -> Result<AnalysisRequest> {
    let mut request = store
        .get_request(job.subject_id)
        .await?
        .ok_or_else(|| EngineError::not_found("request", job.subject_id))?;

    if request.kind() != expected {
        return Err(EngineError::Invariant(format!(
            "request {} is a {} but was queued as {}",
            request.id,
            request.kind(),
            expected
        )));
    }

    request.status = JobStatus::Processing;
    request.error = None;
    store.update_request(request.clone()).await?;
    Ok(request)
}

pub(crate) async fn complete_request(
    store: &SharedStore,
    mut request: AnalysisRequest,
    enrichment: Enrichment,
) -> Result<()> {
    request.status = JobStatus::Completed;
    request.result = Some(enrichment.result);
    request.classification = enrichment.classification;
    request.completed_at = Some(enrichment.analyzed_at);
    store.update_request(request).await
}

pub(crate) async fn fail_request(
    store: &SharedStore,
    job: &Job,
    error: &EngineError,
    now: DateTime<Utc>,
) -> Result<()> {
    let Some(mut request) = store.get_request(job.subject_id).await? else {
        return Ok(());
    };
    request.status = JobStatus::Failed;
    request.error = Some(truncate_error(&error.to_string()));
    request.completed_at = Some(now);
    store.update_request(request).await
}
