//! In-process store with optional file durability.
//!
//! Durable stores keep two files. Readings go to an append-only JSON-lines
//! log next to the snapshot. Everything else lives in a JSON snapshot that
//! is rewritten (temp file + rename) on every mutating call. Mutations are
//! applied to a copy of the state, and the copy replaces the live state only
//! once it is on disk, so a failed write changes nothing.

use super::{
    HistoryRepository, JobRepository, MarkerRepository, MeasurementRepository, RequestRepository,
    UsageRecord, UsageRepository, WindowRepository,
};
use crate::core::segmentation::sort_markers;
use crate::core::types::{EnrichmentHistoryEntry, Marker, Measurement, Period, Window};
use crate::error::{EngineError, Result};
use crate::queue::{Job, JobKind, JobStatus};
use crate::workflows::AnalysisRequest;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Everything but the readings, in its on-disk shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    /// Sorted by timestamp
    markers: Vec<Marker>,
    windows: HashMap<Uuid, Window>,
    history: Vec<EnrichmentHistoryEntry>,
    jobs: HashMap<Uuid, Job>,
    requests: HashMap<Uuid, AnalysisRequest>,
    usage: Vec<UsageRecord>,
    #[serde(default)]
    pending_range: Option<Period>,
}

/// Store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
    /// Sorted by timestamp, unique timestamps
    readings: RwLock<Vec<Measurement>>,
    persist_path: Option<PathBuf>,
}

impl MemoryStore {
    /// Create an empty, non-durable store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a durable store at `path`, loading the existing snapshot and
    /// reading log if any.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state: StoreState = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&content)?
        } else {
            StoreState::default()
        };
        let readings = load_readings(&readings_path(&path)).await?;

        tracing::debug!(
            "Opened store at {:?} ({} readings, {} markers, {} jobs)",
            path,
            readings.len(),
            state.markers.len(),
            state.jobs.len()
        );

        Ok(Self {
            state: RwLock::new(state),
            readings: RwLock::new(readings),
            persist_path: Some(path),
        })
    }

    pub fn persist_path(&self) -> Option<&Path> {
        self.persist_path.as_deref()
    }

    /// Apply `change` to a copy of the state; keep the copy only if it was
    /// written.
    async fn commit<T, F>(&self, change: F) -> Result<T>
    where
        F: FnOnce(&mut StoreState) -> Result<T> + Send,
        T: Send,
    {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let out = change(&mut next)?;
        self.persist(&next).await?;
        *state = next;
        Ok(out)
    }

    async fn persist(&self, state: &StoreState) -> Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec(state)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| EngineError::Store(format!("failed to replace {path:?}: {e}")))
    }

    async fn append_log(&self, batch: &[Measurement]) -> Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        let log = readings_path(path);

        let mut lines = Vec::new();
        for m in batch {
            serde_json::to_writer(&mut lines, m)?;
            lines.push(b'\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log)
            .await?;
        file.write_all(&lines).await?;
        file.sync_data().await?;
        Ok(())
    }
}

fn readings_path(snapshot: &Path) -> PathBuf {
    snapshot.with_extension("readings.jsonl")
}

/// Load the reading log. A torn line from an interrupted write is skipped.
async fn load_readings(path: &Path) -> Result<Vec<Measurement>> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(Vec::new());
    }
    let content = tokio::fs::read_to_string(path).await?;
    let mut readings = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Measurement>(line) {
            Ok(m) => readings.push(m),
            Err(e) => tracing::warn!("Skipping unreadable reading at {:?}:{}: {e}", path, n + 1),
        }
    }
    // Stable sort: the first copy of a timestamp wins.
    readings.sort_by_key(|m| m.timestamp);
    readings.dedup_by_key(|m| m.timestamp);
    Ok(readings)
}

fn by_anchor(mut windows: Vec<Window>) -> Vec<Window> {
    windows.sort_by(|a, b| a.anchor.cmp(&b.anchor).then(a.marker_id.cmp(&b.marker_id)));
    windows
}

#[async_trait]
impl MeasurementRepository for MemoryStore {
    async fn append_measurements(&self, batch: Vec<Measurement>) -> Result<Vec<Measurement>> {
        let mut readings = self.readings.write().await;
        let mut fresh: BTreeMap<DateTime<Utc>, Measurement> = BTreeMap::new();
        for m in batch {
            let known = readings
                .binary_search_by(|r| r.timestamp.cmp(&m.timestamp))
                .is_ok();
            if !known {
                fresh.entry(m.timestamp).or_insert(m);
            }
        }
        let accepted: Vec<Measurement> = fresh.into_values().collect();
        let (Some(first), Some(last)) = (accepted.first(), accepted.last()) else {
            return Ok(accepted);
        };

        // The pending range is widened before the log is written, so a
        // crash in between only costs a redundant recompute.
        let span = Period::new(first.timestamp, last.timestamp);
        self.commit(|state| {
            state.pending_range = Some(state.pending_range.map_or(span, |p| p.span(span)));
            Ok(())
        })
        .await?;
        self.append_log(&accepted).await?;

        for m in &accepted {
            if let Err(pos) = readings.binary_search_by(|r| r.timestamp.cmp(&m.timestamp)) {
                readings.insert(pos, *m);
            }
        }
        Ok(accepted)
    }

    async fn query_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Measurement>> {
        let readings = self.readings.read().await;
        let from = readings.partition_point(|m| m.timestamp < start);
        let to = readings.partition_point(|m| m.timestamp <= end);
        Ok(readings.get(from..to.max(from)).unwrap_or_default().to_vec())
    }

    async fn pending_range(&self) -> Result<Option<Period>> {
        Ok(self.state.read().await.pending_range)
    }

    async fn clear_pending_range(&self, covered: Period) -> Result<()> {
        self.commit(|state| {
            if let Some(p) = state.pending_range {
                if covered.start <= p.start && p.end <= covered.end {
                    state.pending_range = None;
                }
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl MarkerRepository for MemoryStore {
    async fn insert_marker(&self, marker: Marker) -> Result<bool> {
        if self.get_marker(marker.id).await?.is_some() {
            return Ok(false);
        }
        self.commit(|state| {
            if state.markers.iter().any(|m| m.id == marker.id) {
                return Ok(false);
            }
            state.markers.push(marker);
            sort_markers(&mut state.markers);
            Ok(true)
        })
        .await
    }

    async fn get_marker(&self, id: Uuid) -> Result<Option<Marker>> {
        let state = self.state.read().await;
        Ok(state.markers.iter().find(|m| m.id == id).cloned())
    }

    async fn list_markers(&self) -> Result<Vec<Marker>> {
        Ok(self.state.read().await.markers.clone())
    }

    async fn list_without_window(&self) -> Result<Vec<Marker>> {
        let state = self.state.read().await;
        Ok(state
            .markers
            .iter()
            .filter(|m| !state.windows.contains_key(&m.id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WindowRepository for MemoryStore {
    async fn get_window(&self, marker_id: Uuid) -> Result<Option<Window>> {
        Ok(self.state.read().await.windows.get(&marker_id).cloned())
    }

    async fn upsert_window(&self, window: Window) -> Result<()> {
        self.commit(|state| {
            state.windows.insert(window.marker_id, window);
            Ok(())
        })
        .await
    }

    async fn list_unenriched(&self) -> Result<Vec<Window>> {
        let state = self.state.read().await;
        Ok(by_anchor(
            state.windows.values().filter(|w| !w.enriched).cloned().collect(),
        ))
    }

    async fn list_overlapping(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Window>> {
        let state = self.state.read().await;
        Ok(by_anchor(
            state
                .windows
                .values()
                .filter(|w| w.period().overlaps(start, end))
                .cloned()
                .collect(),
        ))
    }

    async fn list_windows(&self) -> Result<Vec<Window>> {
        let state = self.state.read().await;
        Ok(by_anchor(state.windows.values().cloned().collect()))
    }
}

#[async_trait]
impl HistoryRepository for MemoryStore {
    async fn append_history(&self, entry: EnrichmentHistoryEntry) -> Result<()> {
        self.commit(|state| {
            state.history.push(entry);
            Ok(())
        })
        .await
    }

    async fn list_history(&self, window_id: Uuid) -> Result<Vec<EnrichmentHistoryEntry>> {
        let state = self.state.read().await;
        Ok(state
            .history
            .iter()
            .filter(|e| e.window_id == window_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn create_job(&self, job: Job) -> Result<()> {
        self.commit(|state| {
            state.jobs.insert(job.id, job);
            Ok(())
        })
        .await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn update_job(&self, job: Job) -> Result<()> {
        self.commit(|state| {
            if !state.jobs.contains_key(&job.id) {
                return Err(EngineError::not_found("job", job.id));
            }
            state.jobs.insert(job.id, job);
            Ok(())
        })
        .await
    }

    async fn list_jobs(&self, kind: JobKind, statuses: &[JobStatus]) -> Result<Vec<Job>> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.kind == kind && statuses.contains(&j.status))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }
}

#[async_trait]
impl RequestRepository for MemoryStore {
    async fn create_request(&self, request: AnalysisRequest) -> Result<()> {
        self.commit(|state| {
            state.requests.insert(request.id, request);
            Ok(())
        })
        .await
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<AnalysisRequest>> {
        Ok(self.state.read().await.requests.get(&id).cloned())
    }

    async fn update_request(&self, request: AnalysisRequest) -> Result<()> {
        self.commit(|state| {
            if !state.requests.contains_key(&request.id) {
                return Err(EngineError::not_found("request", request.id));
            }
            state.requests.insert(request.id, request);
            Ok(())
        })
        .await
    }

    async fn list_conversation(&self, conversation_id: Uuid) -> Result<Vec<AnalysisRequest>> {
        let state = self.state.read().await;
        let mut turns: Vec<AnalysisRequest> = state
            .requests
            .values()
            .filter(|r| r.conversation_id() == Some(conversation_id))
            .cloned()
            .collect();
        turns.sort_by_key(|r| r.created_at);
        Ok(turns)
    }
}

#[async_trait]
impl UsageRepository for MemoryStore {
    async fn record_usage(&self, record: UsageRecord) -> Result<()> {
        self.commit(|state| {
            state.usage.push(record);
            Ok(())
        })
        .await
    }

    async fn list_usage(&self) -> Result<Vec<UsageRecord>> {
        Ok(self.state.read().await.usage.clone())
    }
}
