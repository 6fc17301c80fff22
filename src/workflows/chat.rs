//! Chat replies grounded in recent windows.

use super::{complete_request, fail_request, start_request, Enrichment, EnrichmentWorkflow};
use super::{AnalysisRequest, RequestPayload};
use crate::analyzer::AnalysisContext;
use crate::error::{EngineError, Result};
use crate::queue::{Job, JobKind, JobStatus};
use crate::store::{RequestRepository, SharedStore, WindowRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

/// Completed turns of the same conversation handed to the analyzer.
const MAX_PREVIOUS_TURNS: usize = 10;

/// Most recent enriched windows handed to the analyzer.
const MAX_RECENT_WINDOWS: usize = 5;

pub struct ChatTurn {
    store: SharedStore,
}

impl ChatTurn {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }
}

fn tail<T>(mut items: Vec<T>, n: usize) -> Vec<T> {
    let skip = items.len().saturating_sub(n);
    items.drain(..skip);
    items
}

#[async_trait]
impl EnrichmentWorkflow for ChatTurn {
    type Subject = AnalysisRequest;

    fn kind(&self) -> JobKind {
        JobKind::ChatTurn
    }

    async fn prepare(&self, job: &Job) -> Result<(AnalysisRequest, AnalysisContext)> {
        let request = start_request(&self.store, job, JobKind::ChatTurn).await?;
        let RequestPayload::Chat {
            conversation_id,
            ref message,
        } = request.payload
        else {
            return Err(EngineError::Invariant(format!(
                "request {} has no chat payload",
                request.id
            )));
        };

        let turns: Vec<_> = self
            .store
            .list_conversation(conversation_id)
            .await?
            .into_iter()
            .filter(|turn| turn.id != request.id && turn.status == JobStatus::Completed)
            .map(|turn| {
                let question = match turn.payload {
                    RequestPayload::Chat { message, .. } => message,
                    _ => String::new(),
                };
                json!({ "question": question, "answer": turn.result })
            })
            .collect();

        let windows: Vec<_> = self
            .store
            .list_windows()
            .await?
            .into_iter()
            .filter(|w| w.enriched)
            .map(|w| {
                json!({
                    "anchor": w.anchor,
                    "stats": w.stats,
                    "classification": w.classification,
                    "result": w.enrichment_result,
                })
            })
            .collect();

        let context = AnalysisContext {
            kind: JobKind::ChatTurn,
            subject_id: request.id,
            prompt: message.clone(),
            data: json!({
                "conversation_id": conversation_id,
                "previous_turns": tail(turns, MAX_PREVIOUS_TURNS),
                "recent_windows": tail(windows, MAX_RECENT_WINDOWS),
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
