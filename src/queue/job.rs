//! Persisted job records.

use crate::core::types::EnrichmentReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest error message kept on a failed job.
pub const MAX_ERROR_CHARS: usize = 500;

/// The enrichment workflows that own a queue each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    WindowAnalysis,
    ChatTurn,
    PeriodComparison,
    PeriodSummary,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::WindowAnalysis,
        JobKind::ChatTurn,
        JobKind::PeriodComparison,
        JobKind::PeriodSummary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::WindowAnalysis => "window_analysis",
            JobKind::ChatTurn => "chat_turn",
            JobKind::PeriodComparison => "period_comparison",
            JobKind::PeriodSummary => "period_summary",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle. Only `Processing -> Pending` on crash recovery ever moves
/// backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One unit of enrichment work for a subject (window or request).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub subject_id: Uuid,
    pub status: JobStatus,
    pub reason: EnrichmentReason,
    pub model_override: Option<String>,
    pub error: Option<String>,
    /// Number of times a worker picked this job up
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        kind: JobKind,
        subject_id: Uuid,
        reason: EnrichmentReason,
        model_override: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            subject_id,
            status: JobStatus::Pending,
            reason,
            model_override,
            error: None,
            attempts: 0,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.attempts += 1;
        self.started_at = Some(now);
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.error = None;
        self.finished_at = Some(now);
    }

    pub fn fail(&mut self, error: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error = Some(truncate_error(error));
        self.finished_at = Some(now);
    }

    /// Put an interrupted job back in line.
    pub fn requeue(&mut self) {
        self.status = JobStatus::Pending;
        self.started_at = None;
    }
}

/// Cut an error message to [`MAX_ERROR_CHARS`] characters.
pub fn truncate_error(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_CHARS {
        return message.to_string();
    }
    let mut cut: String = message.chars().take(MAX_ERROR_CHARS - 3).collect();
    cut.push_str("...");
    cut
}
