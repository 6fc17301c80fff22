//! Notifications and the activity log.
//!
//! Observers learn about ingestion, recomputation and job outcomes through
//! [`NotificationSink`]. Publishing is fire-and-forget: a sink must never
//! fail or block the operation that publishes.

pub mod log;

use crate::queue::JobKind;
use std::sync::Arc;

pub use self::log::{ActivityLog, ActivityStats, JobOutcomeStats, SharedActivityLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    MeasurementsIngested,
    MarkersInserted,
    WindowsRecomputed,
    JobCompleted(JobKind),
    JobFailed(JobKind),
}

pub trait NotificationSink: Send + Sync {
    fn publish(&self, kind: NotificationKind, count: usize);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn publish(&self, _kind: NotificationKind, _count: usize) {}
}

/// Sink that writes each notification to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn publish(&self, kind: NotificationKind, count: usize) {
        match kind {
            NotificationKind::JobFailed(job_kind) => {
                tracing::warn!(kind = %job_kind, count, "enrichment failed")
            }
            NotificationKind::JobCompleted(job_kind) => {
                tracing::info!(kind = %job_kind, count, "enrichment completed")
            }
            other => tracing::debug!(?other, count, "activity"),
        }
    }
}

/// Fans one notification out to several sinks.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

impl NotificationSink for FanoutSink {
    fn publish(&self, kind: NotificationKind, count: usize) {
        for sink in &self.sinks {
            sink.publish(kind, count);
        }
    }
}

pub type SharedSink = Arc<dyn NotificationSink>;
