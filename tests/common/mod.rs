//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use marker_window_agent::activity::{ActivityLog, SharedSink};
use marker_window_agent::analyzer::{AnalysisContext, Analyzer, AnalyzerResponse, UsageMetrics};
use marker_window_agent::clock::ManualClock;
use marker_window_agent::core::EnrichmentHistoryEntry;
use marker_window_agent::store::{
    HistoryRepository, JobRepository, MarkerRepository, MeasurementRepository, RequestRepository,
    UsageRecord, UsageRepository, WindowRepository,
};
use marker_window_agent::workflows::{
    AnalysisRequest, ChatTurn, EnrichmentWorkflow, PeriodComparison, PeriodSummary, WindowAnalysis,
    WorkflowProcessor,
};
use marker_window_agent::{
    AnalyzerError, Engine, EngineError, EngineSettings, Job, JobKind, JobQueue, JobStatus,
    LiveSettings, Marker, Measurement, MemoryStore, Period, QueueHandles, Window, WindowLock,
};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 2024-05-01 08:00 UTC plus `minutes`.
pub fn t(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + Duration::minutes(minutes)
}

/// Analyzer that replays queued answers, then falls back to "steady".
#[derive(Default)]
pub struct ScriptedAnalyzer {
    script: Mutex<VecDeque<Result<AnalyzerResponse, AnalyzerError>>>,
    calls: Mutex<Vec<(AnalysisContext, Option<String>, tokio::time::Instant)>>,
}

impl ScriptedAnalyzer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answer(&self, text: &str, classification: &str) {
        self.script.lock().unwrap().push_back(Ok(AnalyzerResponse {
            result_text: text.to_string(),
            classification: Some(classification.to_string()),
            usage: UsageMetrics::default(),
        }));
    }

    pub fn blank(&self) {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(AnalyzerResponse::default()));
    }

    pub fn fail(&self, error: AnalyzerError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    pub fn contexts(&self) -> Vec<AnalysisContext> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(c, _, _)| c.clone())
            .collect()
    }

    pub fn models(&self) -> Vec<Option<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m, _)| m.clone())
            .collect()
    }

    pub fn call_times(&self) -> Vec<tokio::time::Instant> {
        self.calls.lock().unwrap().iter().map(|(_, _, at)| *at).collect()
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    async fn enrich(
        &self,
        context: &AnalysisContext,
        model_hint: Option<&str>,
    ) -> Result<AnalyzerResponse, AnalyzerError> {
        self.calls.lock().unwrap().push((
            context.clone(),
            model_hint.map(str::to_string),
            tokio::time::Instant::now(),
        ));
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Ok(AnalyzerResponse {
                result_text: "Readings stayed level.".to_string(),
                classification: Some("steady".to_string()),
                usage: UsageMetrics::default(),
            })
        })
    }
}

type Hook = Box<dyn FnOnce() + Send>;

/// [`MemoryStore`] with injectable faults and interleavings.
#[derive(Default)]
pub struct HookedStore {
    inner: Arc<MemoryStore>,
    /// Runs inside the next `query_range`, before it reads
    on_query: Mutex<Option<Hook>>,
    /// `query_range` calls to fail
    failing_queries: AtomicUsize,
    /// Markers whose next insert fails
    rejected_markers: Mutex<HashSet<Uuid>>,
}

impl HookedStore {
    pub fn wrap(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            ..Self::default()
        })
    }

    pub fn on_next_query(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_query.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn fail_queries(&self, count: usize) {
        self.failing_queries.store(count, Ordering::SeqCst);
    }

    pub fn reject_marker_once(&self, id: Uuid) {
        self.rejected_markers.lock().unwrap().insert(id);
    }

    fn injected(what: &str) -> EngineError {
        EngineError::Store(format!("injected {what} failure"))
    }
}

#[async_trait]
impl MeasurementRepository for HookedStore {
    async fn append_measurements(
        &self,
        batch: Vec<Measurement>,
    ) -> marker_window_agent::Result<Vec<Measurement>> {
        self.inner.append_measurements(batch).await
    }

    async fn query_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> marker_window_agent::Result<Vec<Measurement>> {
        let hook = self.on_query.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
            // Let whatever the hook spawned run up to its first wait.
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        }
        let failing = self
            .failing_queries
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Self::injected("query"));
        }
        self.inner.query_range(start, end).await
    }

    async fn pending_range(&self) -> marker_window_agent::Result<Option<Period>> {
        self.inner.pending_range().await
    }

    async fn clear_pending_range(&self, covered: Period) -> marker_window_agent::Result<()> {
        self.inner.clear_pending_range(covered).await
    }
}

#[async_trait]
impl MarkerRepository for HookedStore {
    async fn insert_marker(&self, marker: Marker) -> marker_window_agent::Result<bool> {
        if self.rejected_markers.lock().unwrap().remove(&marker.id) {
            return Err(Self::injected("marker insert"));
        }
        self.inner.insert_marker(marker).await
    }

    async fn get_marker(&self, id: Uuid) -> marker_window_agent::Result<Option<Marker>> {
        self.inner.get_marker(id).await
    }

    async fn list_markers(&self) -> marker_window_agent::Result<Vec<Marker>> {
        self.inner.list_markers().await
    }

    async fn list_without_window(&self) -> marker_window_agent::Result<Vec<Marker>> {
        self.inner.list_without_window().await
    }
}

#[async_trait]
impl WindowRepository for HookedStore {
    async fn get_window(&self, marker_id: Uuid) -> marker_window_agent::Result<Option<Window>> {
        self.inner.get_window(marker_id).await
    }

    async fn upsert_window(&self, window: Window) -> marker_window_agent::Result<()> {
        self.inner.upsert_window(window).await
    }

    async fn list_unenriched(&self) -> marker_window_agent::Result<Vec<Window>> {
        self.inner.list_unenriched().await
    }

    async fn list_overlapping(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> marker_window_agent::Result<Vec<Window>> {
        self.inner.list_overlapping(start, end).await
    }

    async fn list_windows(&self) -> marker_window_agent::Result<Vec<Window>> {
        self.inner.list_windows().await
    }
}

#[async_trait]
impl HistoryRepository for HookedStore {
    async fn append_history(&self, entry: EnrichmentHistoryEntry) -> marker_window_agent::Result<()> {
        self.inner.append_history(entry).await
    }

    async fn list_history(
        &self,
        window_id: Uuid,
    ) -> marker_window_agent::Result<Vec<EnrichmentHistoryEntry>> {
        self.inner.list_history(window_id).await
    }
}

#[async_trait]
impl JobRepository for HookedStore {
    async fn create_job(&self, job: Job) -> marker_window_agent::Result<()> {
        self.inner.create_job(job).await
    }

    async fn get_job(&self, id: Uuid) -> marker_window_agent::Result<Option<Job>> {
        self.inner.get_job(id).await
    }

    async fn update_job(&self, job: Job) -> marker_window_agent::Result<()> {
        self.inner.update_job(job).await
    }

    async fn list_jobs(
        &self,
        kind: JobKind,
        statuses: &[JobStatus],
    ) -> marker_window_agent::Result<Vec<Job>> {
        self.inner.list_jobs(kind, statuses).await
    }
}

#[async_trait]
impl RequestRepository for HookedStore {
    async fn create_request(&self, request: AnalysisRequest) -> marker_window_agent::Result<()> {
        self.inner.create_request(request).await
    }

    async fn get_request(&self, id: Uuid) -> marker_window_agent::Result<Option<AnalysisRequest>> {
        self.inner.get_request(id).await
    }

    async fn update_request(&self, request: AnalysisRequest) -> marker_window_agent::Result<()> {
        self.inner.update_request(request).await
    }

    async fn list_conversation(
        &self,
        conversation_id: Uuid,
    ) -> marker_window_agent::Result<Vec<AnalysisRequest>> {
        self.inner.list_conversation(conversation_id).await
    }
}

#[async_trait]
impl UsageRepository for HookedStore {
    async fn record_usage(&self, record: UsageRecord) -> marker_window_agent::Result<()> {
        self.inner.record_usage(record).await
    }

    async fn list_usage(&self) -> marker_window_agent::Result<Vec<UsageRecord>> {
        self.inner.list_usage().await
    }
}

fn queue<W: EnrichmentWorkflow>(
    workflow: W,
    analyzer: &Arc<ScriptedAnalyzer>,
    store: &Arc<HookedStore>,
    clock: &Arc<ManualClock>,
    sink: &SharedSink,
) -> JobQueue<WorkflowProcessor<W>> {
    let processor = WorkflowProcessor::new(workflow, analyzer.clone(), store.clone(), clock.clone());
    JobQueue::new(processor, store.clone(), clock.clone(), sink.clone())
}

type Workers = (
    JobQueue<WorkflowProcessor<WindowAnalysis>>,
    JobQueue<WorkflowProcessor<ChatTurn>>,
    JobQueue<WorkflowProcessor<PeriodComparison>>,
    JobQueue<WorkflowProcessor<PeriodSummary>>,
);

/// Engine plus the four queues, wired against one store.
pub struct Harness {
    pub store: Arc<HookedStore>,
    pub clock: Arc<ManualClock>,
    pub analyzer: Arc<ScriptedAnalyzer>,
    pub activity: Arc<ActivityLog>,
    pub engine: Arc<Engine>,
    workers: Option<Workers>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), EngineSettings::default())
    }

    pub fn with_store(store: Arc<MemoryStore>, settings: EngineSettings) -> Self {
        let store = HookedStore::wrap(store);
        let clock = Arc::new(ManualClock::new(t(0)));
        let analyzer = ScriptedAnalyzer::new();
        let activity = Arc::new(ActivityLog::new());
        let sink: SharedSink = activity.clone();
        let analysis = LiveSettings::default();
        let lock = WindowLock::new();

        let windows = queue(
            WindowAnalysis::new(store.clone(), lock.clone()),
            &analyzer,
            &store,
            &clock,
            &sink,
        );
        let chat = queue(ChatTurn::new(store.clone()), &analyzer, &store, &clock, &sink);
        let comparison = queue(
            PeriodComparison::new(store.clone(), analysis.clone()),
            &analyzer,
            &store,
            &clock,
            &sink,
        );
        let summary = queue(
            PeriodSummary::new(store.clone(), analysis),
            &analyzer,
            &store,
            &clock,
            &sink,
        );

        let queues = QueueHandles {
            window_analysis: windows.handle(),
            chat: chat.handle(),
            comparison: comparison.handle(),
            summary: summary.handle(),
        };
        let engine = Arc::new(Engine::new(
            store.clone(),
            clock.clone(),
            sink,
            queues,
            settings,
            lock,
        ));

        Self {
            store,
            clock,
            analyzer,
            activity,
            engine,
            workers: Some((windows, chat, comparison, summary)),
        }
    }

    /// Spawn the four workers. Can be called once.
    pub fn start(&mut self, cancel: &CancellationToken) -> Vec<JoinHandle<marker_window_agent::Result<()>>> {
        let (windows, chat, comparison, summary) =
            self.workers.take().expect("workers already started");
        vec![
            tokio::spawn(windows.run(cancel.clone())),
            tokio::spawn(chat.run(cancel.clone())),
            tokio::spawn(comparison.run(cancel.clone())),
            tokio::spawn(summary.run(cancel.clone())),
        ]
    }

    /// Wait until no job of `kind` is pending or in flight.
    pub async fn settle(&self, kind: JobKind) {
        for _ in 0..600 {
            let open = self
                .store
                .list_jobs(kind, &[JobStatus::Pending, JobStatus::Processing])
                .await
                .unwrap();
            if open.is_empty() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
        panic!("{kind} jobs did not settle");
    }
}
