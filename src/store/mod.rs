//! Repository ports.
//!
//! Each trait is a capability the engine needs from persistence; every call
//! is one all-or-nothing transition. [`MemoryStore`] implements all of them.

pub mod memory;

use crate::analyzer::UsageMetrics;
use crate::core::types::{EnrichmentHistoryEntry, Marker, Measurement, Period, Window};
use crate::error::Result;
use crate::queue::{Job, JobKind, JobStatus};
use crate::workflows::AnalysisRequest;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub use memory::MemoryStore;

#[async_trait]
pub trait MeasurementRepository: Send + Sync {
    /// Store a batch, dropping readings whose timestamp is already known.
    /// Returns the accepted readings. Their span joins the pending range in
    /// the same call.
    async fn append_measurements(&self, batch: Vec<Measurement>) -> Result<Vec<Measurement>>;

    /// Span of stored readings no window recompute has covered yet.
    async fn pending_range(&self) -> Result<Option<Period>>;

    /// Clear the pending range if `covered` contains all of it.
    async fn clear_pending_range(&self, covered: Period) -> Result<()>;

    /// Readings in `[start, end]`, ordered by timestamp.
    async fn query_range(&self, start: DateTime<Utc>, end: DateTime<Utc>)
        -> Result<Vec<Measurement>>;
}

#[async_trait]
pub trait MarkerRepository: Send + Sync {
    /// Insert a marker. Returns false if the id is already known.
    async fn insert_marker(&self, marker: Marker) -> Result<bool>;

    async fn get_marker(&self, id: Uuid) -> Result<Option<Marker>>;

    /// All markers ordered by timestamp.
    async fn list_markers(&self) -> Result<Vec<Marker>>;

    /// Markers that do not own a window yet, ordered by timestamp.
    async fn list_without_window(&self) -> Result<Vec<Marker>>;
}

#[async_trait]
pub trait WindowRepository: Send + Sync {
    async fn get_window(&self, marker_id: Uuid) -> Result<Option<Window>>;

    async fn upsert_window(&self, window: Window) -> Result<()>;

    /// Windows not (or no longer) enriched, ordered by anchor.
    async fn list_unenriched(&self) -> Result<Vec<Window>>;

    /// Windows whose boundaries intersect `[start, end]`, ordered by anchor.
    async fn list_overlapping(&self, start: DateTime<Utc>, end: DateTime<Utc>)
        -> Result<Vec<Window>>;

    async fn list_windows(&self) -> Result<Vec<Window>>;
}

/// Append-only enrichment history.
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    async fn append_history(&self, entry: EnrichmentHistoryEntry) -> Result<()>;

    /// Entries for one window, oldest first.
    async fn list_history(&self, window_id: Uuid) -> Result<Vec<EnrichmentHistoryEntry>>;

    async fn latest_history(&self, window_id: Uuid) -> Result<Option<EnrichmentHistoryEntry>> {
        Ok(self.list_history(window_id).await?.into_iter().last())
    }
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create_job(&self, job: Job) -> Result<()>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    async fn update_job(&self, job: Job) -> Result<()>;

    /// Jobs of `kind` in any of `statuses`, oldest first.
    async fn list_jobs(&self, kind: JobKind, statuses: &[JobStatus]) -> Result<Vec<Job>>;
}

#[async_trait]
pub trait RequestRepository: Send + Sync {
    async fn create_request(&self, request: AnalysisRequest) -> Result<()>;

    async fn get_request(&self, id: Uuid) -> Result<Option<AnalysisRequest>>;

    async fn update_request(&self, request: AnalysisRequest) -> Result<()>;

    /// Chat turns of one conversation, oldest first.
    async fn list_conversation(&self, conversation_id: Uuid) -> Result<Vec<AnalysisRequest>>;
}

/// One analyzer call as recorded for accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub subject_id: Uuid,
    pub usage: UsageMetrics,
    /// False when the analyzer answered with nothing usable
    pub succeeded: bool,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait UsageRepository: Send + Sync {
    async fn record_usage(&self, record: UsageRecord) -> Result<()>;

    async fn list_usage(&self) -> Result<Vec<UsageRecord>>;
}

/// Everything the engine needs from persistence.
pub trait Store:
    MeasurementRepository
    + MarkerRepository
    + WindowRepository
    + HistoryRepository
    + JobRepository
    + RequestRepository
    + UsageRepository
{
}

impl<T> Store for T where
    T: MeasurementRepository
        + MarkerRepository
        + WindowRepository
        + HistoryRepository
        + JobRepository
        + RequestRepository
        + UsageRepository
{
}

/// Shared store handle.
pub type SharedStore = Arc<dyn Store>;
