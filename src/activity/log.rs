//! Activity log.
//!
//! Counts what the agent did (readings ingested, windows recomputed, jobs
//! finished or failed) so operators can tell "nothing happened yet" from
//! "it was attempted and failed".

use super::{NotificationKind, NotificationSink};
use crate::queue::JobKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-kind job outcome counters.
#[derive(Debug, Default)]
struct JobCounters {
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Activity statistics for the current process.
#[derive(Debug)]
pub struct ActivityLog {
    measurements_ingested: AtomicU64,
    markers_inserted: AtomicU64,
    windows_recomputed: AtomicU64,
    jobs: [JobCounters; 4],
    /// Process start time
    session_start: DateTime<Utc>,
    /// Path for persisting stats
    persist_path: Option<PathBuf>,
}

fn slot(kind: JobKind) -> usize {
    match kind {
        JobKind::WindowAnalysis => 0,
        JobKind::ChatTurn => 1,
        JobKind::PeriodComparison => 2,
        JobKind::PeriodSummary => 3,
    }
}

impl ActivityLog {
    /// Create a new activity log.
    pub fn new() -> Self {
        Self {
            measurements_ingested: AtomicU64::new(0),
            markers_inserted: AtomicU64::new(0),
            windows_recomputed: AtomicU64::new(0),
            jobs: Default::default(),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create an activity log that continues the counters stored at `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            tracing::warn!("Could not load previous activity stats: {e}");
        }

        log
    }

    /// Get the current statistics.
    pub fn stats(&self) -> ActivityStats {
        let job_stats = |kind: JobKind| JobOutcomeStats {
            kind,
            completed: self.jobs[slot(kind)].completed.load(Ordering::Relaxed),
            failed: self.jobs[slot(kind)].failed.load(Ordering::Relaxed),
        };

        ActivityStats {
            measurements_ingested: self.measurements_ingested.load(Ordering::Relaxed),
            markers_inserted: self.markers_inserted.load(Ordering::Relaxed),
            windows_recomputed: self.windows_recomputed.load(Ordering::Relaxed),
            jobs: JobKind::ALL.into_iter().map(job_stats).collect(),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        let mut out = format!(
            "Activity:\n\
             - Measurements ingested: {}\n\
             - Markers inserted: {}\n\
             - Windows recomputed: {}\n",
            stats.measurements_ingested, stats.markers_inserted, stats.windows_recomputed
        );
        for job in &stats.jobs {
            out.push_str(&format!(
                "- {}: {} completed, {} failed\n",
                job.kind, job.completed, job.failed
            ));
        }
        out.push_str(&format!(
            "- Session duration: {} seconds",
            stats.session_duration_secs
        ));
        out
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedStats {
                measurements_ingested: stats.measurements_ingested,
                markers_inserted: stats.markers_inserted,
                windows_recomputed: stats.windows_recomputed,
                jobs: stats.jobs,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    /// Save every `interval` until `cancel` fires, so `status` sees
    /// current counters while the agent runs.
    pub async fn autosave(&self, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return,
            }
            if let Err(e) = self.save() {
                tracing::warn!("Could not save activity stats: {e}");
            }
        }
    }

    /// Load stats from disk.
    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.measurements_ingested
                    .store(persisted.measurements_ingested, Ordering::Relaxed);
                self.markers_inserted
                    .store(persisted.markers_inserted, Ordering::Relaxed);
                self.windows_recomputed
                    .store(persisted.windows_recomputed, Ordering::Relaxed);
                for job in persisted.jobs {
                    let counters = &self.jobs[slot(job.kind)];
                    counters.completed.store(job.completed, Ordering::Relaxed);
                    counters.failed.store(job.failed, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    /// Reset all counters.
    pub fn reset(&self) {
        self.measurements_ingested.store(0, Ordering::Relaxed);
        self.markers_inserted.store(0, Ordering::Relaxed);
        self.windows_recomputed.store(0, Ordering::Relaxed);
        for counters in &self.jobs {
            counters.completed.store(0, Ordering::Relaxed);
            counters.failed.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationSink for ActivityLog {
    fn publish(&self, kind: NotificationKind, count: usize) {
        let count = count as u64;
        match kind {
            NotificationKind::MeasurementsIngested => {
                self.measurements_ingested.fetch_add(count, Ordering::Relaxed);
            }
            NotificationKind::MarkersInserted => {
                self.markers_inserted.fetch_add(count, Ordering::Relaxed);
            }
            NotificationKind::WindowsRecomputed => {
                self.windows_recomputed.fetch_add(count, Ordering::Relaxed);
            }
            NotificationKind::JobCompleted(job_kind) => {
                self.jobs[slot(job_kind)]
                    .completed
                    .fetch_add(count, Ordering::Relaxed);
            }
            NotificationKind::JobFailed(job_kind) => {
                self.jobs[slot(job_kind)]
                    .failed
                    .fetch_add(count, Ordering::Relaxed);
            }
        }
    }
}

/// Outcome counters for one job kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcomeStats {
    pub kind: JobKind,
    pub completed: u64,
    pub failed: u64,
}

/// Snapshot of activity statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityStats {
    pub measurements_ingested: u64,
    pub markers_inserted: u64,
    pub windows_recomputed: u64,
    pub jobs: Vec<JobOutcomeStats>,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    measurements_ingested: u64,
    markers_inserted: u64,
    windows_recomputed: u64,
    jobs: Vec<JobOutcomeStats>,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared activity log.
pub type SharedActivityLog = Arc<ActivityLog>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_log_counting() {
        let log = ActivityLog::new();

        log.publish(NotificationKind::MeasurementsIngested, 12);
        log.publish(NotificationKind::JobCompleted(JobKind::WindowAnalysis), 1);
        log.publish(NotificationKind::JobFailed(JobKind::WindowAnalysis), 1);
        log.publish(NotificationKind::JobFailed(JobKind::ChatTurn), 2);

        let stats = log.stats();
        assert_eq!(stats.measurements_ingested, 12);
        assert_eq!(stats.jobs[0].completed, 1);
        assert_eq!(stats.jobs[0].failed, 1);
        assert_eq!(stats.jobs[1].failed, 2);
    }

    #[test]
    fn test_activity_log_reset() {
        let log = ActivityLog::new();
        log.publish(NotificationKind::WindowsRecomputed, 3);
        log.reset();
        assert_eq!(log.stats().windows_recomputed, 0);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.json");

        let log = ActivityLog::with_persistence(path.clone());
        log.publish(NotificationKind::MarkersInserted, 4);
        log.publish(NotificationKind::JobCompleted(JobKind::PeriodSummary), 2);
        log.save().unwrap();

        let reloaded = ActivityLog::with_persistence(path);
        let stats = reloaded.stats();
        assert_eq!(stats.markers_inserted, 4);
        assert_eq!(stats.jobs[3].completed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_autosave_writes_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.json");
        let log = Arc::new(ActivityLog::with_persistence(path.clone()));
        let cancel = CancellationToken::new();

        let saver = {
            let log = log.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { log.autosave(Duration::from_secs(5), cancel).await })
        };
        log.publish(NotificationKind::MeasurementsIngested, 7);
        assert!(!path.exists());

        tokio::time::sleep(Duration::from_secs(6)).await;
        let saved = ActivityLog::with_persistence(path.clone());
        assert_eq!(saved.stats().measurements_ingested, 7);

        cancel.cancel();
        saver.await.unwrap();
    }

    #[test]
    fn test_summary_format() {
        let summary = ActivityLog::new().summary();
        assert!(summary.contains("Measurements ingested"));
        assert!(summary.contains("window_analysis"));
    }
}
