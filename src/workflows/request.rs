//! User-initiated analysis requests (chat turns, comparisons, summaries).

use crate::core::types::Period;
use crate::queue::{JobKind, JobStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestPayload {
    Chat {
        conversation_id: Uuid,
        message: String,
    },
    Comparison {
        first: Period,
        second: Period,
    },
    Summary {
        period: Period,
    },
}

impl RequestPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            RequestPayload::Chat { .. } => JobKind::ChatTurn,
            RequestPayload::Comparison { .. } => JobKind::PeriodComparison,
            RequestPayload::Summary { .. } => JobKind::PeriodSummary,
        }
    }
}

/// A request and, once processed, its answer. Status follows the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub id: Uuid,
    pub payload: RequestPayload,
    pub status: JobStatus,
    pub result: Option<String>,
    pub classification: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AnalysisRequest {
    pub fn new(payload: RequestPayload, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            status: JobStatus::Pending,
            result: None,
            classification: None,
            error: None,
            created_at: now,
            completed_at: None,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    pub fn conversation_id(&self) -> Option<Uuid> {
        match &self.payload {
            RequestPayload::Chat {
                conversation_id, ..
            } => Some(*conversation_id),
            _ => None,
        }
    }
}
