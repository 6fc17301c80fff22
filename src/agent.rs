//! The running agent: polling loops plus one worker per job kind.
//!
//! Three loops poll on timers (readings, markers and requests, catch-up).
//! Each re-reads the configuration at the top of its cycle, so intervals,
//! cooldown, `paused`, the target band, the timezone and the default model
//! can change without a restart. A failed cycle is logged and retried on the
//! next tick; only fatal errors stop the agent. Source items are
//! acknowledged only once applied, so a failed cycle redelivers the rest.

use crate::activity::SharedSink;
use crate::analyzer::SharedAnalyzer;
use crate::cascade::WindowLock;
use crate::clock::SharedClock;
use crate::config::{Config, IntervalConfig};
use crate::engine::{Engine, EngineSettings, QueueHandles};
use crate::error::{ConfigError, EngineError, Result};
use crate::queue::{JobKind, JobQueue, QueueHandle};
use crate::sources::{MarkerSource, MeasurementSource, RequestSource};
use crate::store::SharedStore;
use crate::workflows::{
    AnalysisSettings, ChatTurn, EnrichmentWorkflow, LiveSettings, PeriodComparison, PeriodSummary,
    WindowAnalysis, WorkflowProcessor,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Re-reads the configuration; called once per loop cycle.
pub type ConfigLoader = Arc<dyn Fn() -> std::result::Result<Config, ConfigError> + Send + Sync>;

type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

struct Worker {
    kind: JobKind,
    run: Box<dyn FnOnce(CancellationToken) -> TaskFuture + Send>,
}

/// Dependencies every worker shares.
struct WorkerDeps {
    store: SharedStore,
    clock: SharedClock,
    analyzer: SharedAnalyzer,
    sink: SharedSink,
    settings: LiveSettings,
}

impl WorkerDeps {
    fn build<W: EnrichmentWorkflow>(&self, workflow: W) -> (QueueHandle, Worker) {
        let kind = workflow.kind();
        let processor = WorkflowProcessor::new(
            workflow,
            self.analyzer.clone(),
            self.store.clone(),
            self.clock.clone(),
        )
        .with_settings(self.settings.clone());
        let queue = JobQueue::new(processor, self.store.clone(), self.clock.clone(), self.sink.clone());
        let handle = queue.handle();
        let worker = Worker {
            kind,
            run: Box::new(move |cancel| -> TaskFuture { Box::pin(queue.run(cancel)) }),
        };
        (handle, worker)
    }
}

#[derive(Clone)]
struct Sources {
    measurements: Arc<dyn MeasurementSource>,
    markers: Arc<dyn MarkerSource>,
    requests: Arc<dyn RequestSource>,
}

pub struct Agent {
    engine: Arc<Engine>,
    analysis: LiveSettings,
    workers: Vec<Worker>,
    sources: Option<Sources>,
    loader: ConfigLoader,
    intervals: IntervalConfig,
}

impl Agent {
    /// Wire the engine and the four workers from `config`.
    pub fn new(
        config: &Config,
        store: SharedStore,
        clock: SharedClock,
        analyzer: SharedAnalyzer,
        sink: SharedSink,
    ) -> std::result::Result<Self, ConfigError> {
        let settings = EngineSettings::from_config(config)?;
        let analysis = LiveSettings::new(AnalysisSettings::from_config(config)?);
        let windows = WindowLock::new();

        let deps = WorkerDeps {
            store: store.clone(),
            clock: clock.clone(),
            analyzer,
            sink: sink.clone(),
            settings: analysis.clone(),
        };
        let (window_analysis, w1) =
            deps.build(WindowAnalysis::new(store.clone(), windows.clone()));
        let (chat, w2) = deps.build(ChatTurn::new(store.clone()));
        let (comparison, w3) =
            deps.build(PeriodComparison::new(store.clone(), analysis.clone()));
        let (summary, w4) = deps.build(PeriodSummary::new(store.clone(), analysis.clone()));

        let queues = QueueHandles {
            window_analysis,
            chat,
            comparison,
            summary,
        };
        let engine = Arc::new(Engine::new(store, clock, sink, queues, settings, windows));
        let fixed = config.clone();

        Ok(Self {
            engine,
            analysis,
            workers: vec![w1, w2, w3, w4],
            sources: None,
            loader: Arc::new(move || Ok(fixed.clone())),
            intervals: config.intervals.clone(),
        })
    }

    /// Poll one source for readings, markers and requests.
    pub fn with_source<S>(mut self, source: Arc<S>) -> Self
    where
        S: MeasurementSource + MarkerSource + RequestSource + 'static,
    {
        self.sources = Some(Sources {
            measurements: source.clone(),
            markers: source.clone(),
            requests: source,
        });
        self
    }

    pub fn with_config_loader(mut self, loader: ConfigLoader) -> Self {
        self.loader = loader;
        self
    }

    pub fn engine(&self) -> Arc<Engine> {
        self.engine.clone()
    }

    /// Band, timezone and default model the workers read; follows reloads.
    pub fn analysis_settings(&self) -> LiveSettings {
        self.analysis.clone()
    }

    /// Run until `cancel` fires or a task hits a fatal error.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut tasks: JoinSet<(&'static str, Result<()>)> = JoinSet::new();

        for worker in self.workers {
            let name = worker.kind.as_str();
            let future = (worker.run)(cancel.clone());
            tasks.spawn(async move { (name, future.await) });
        }

        let ctx = LoopContext {
            engine: self.engine.clone(),
            analysis: self.analysis.clone(),
            loader: self.loader.clone(),
            cancel: cancel.clone(),
        };

        if let Some(sources) = self.sources {
            let c = ctx.clone();
            let measurements = sources.measurements.clone();
            let initial = self.intervals.clone();
            tasks.spawn(async move { ("ingestion", ingestion_loop(c, measurements, initial).await) });

            let c = ctx.clone();
            let initial = self.intervals.clone();
            tasks.spawn(async move { ("markers", marker_loop(c, sources, initial).await) });
        }

        let initial = self.intervals.clone();
        tasks.spawn(async move { ("cascade", cascade_loop(ctx, initial).await) });
        tracing::info!(tasks = tasks.len(), "agent started");

        let mut outcome = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok((name, Ok(()))) => {
                    tracing::debug!(task = name, "task stopped");
                    None
                }
                Ok((name, Err(e))) => {
                    tracing::error!(task = name, "stopping agent: {e}");
                    Some(e)
                }
                Err(e) => {
                    tracing::error!("background task aborted: {e}");
                    Some(EngineError::Invariant(format!("background task aborted: {e}")))
                }
            };
            if let Some(e) = failure {
                cancel.cancel();
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        tracing::info!("agent stopped");
        outcome
    }
}

#[derive(Clone)]
struct LoopContext {
    engine: Arc<Engine>,
    analysis: LiveSettings,
    loader: ConfigLoader,
    cancel: CancellationToken,
}

impl LoopContext {
    /// Reload configuration into the engine and return the current intervals.
    fn reload(&self, last: &mut IntervalConfig) -> IntervalConfig {
        let loaded = (self.loader)().and_then(|config| {
            Ok((
                EngineSettings::from_config(&config)?,
                AnalysisSettings::from_config(&config)?,
                config.intervals,
            ))
        });
        match loaded {
            Ok((settings, analysis, intervals)) => {
                self.engine.update_settings(settings);
                if self.analysis.replace(analysis) {
                    tracing::info!("analysis settings reloaded");
                }
                *last = intervals;
            }
            Err(e) => tracing::warn!("keeping previous settings: {e}"),
        }
        last.clone()
    }

    /// Sleep for `interval`. Returns false if cancelled first.
    async fn wait(&self, interval: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(interval) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    /// Run one cycle; `None` means cancelled mid-cycle.
    async fn cycle<T, F>(&self, name: &'static str, work: F) -> Result<Option<T>>
    where
        F: Future<Output = Result<T>>,
    {
        let result = tokio::select! {
            r = work => r,
            _ = self.cancel.cancelled() => return Ok(None),
        };
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(task = name, "cycle failed: {e}");
                Ok(None)
            }
        }
    }
}

async fn ingestion_loop(
    ctx: LoopContext,
    source: Arc<dyn MeasurementSource>,
    mut intervals: IntervalConfig,
) -> Result<()> {
    loop {
        let interval = ctx.reload(&mut intervals).ingestion;
        let work = async {
            let batch = source.poll_measurements().await?;
            if batch.is_empty() {
                return Ok::<_, EngineError>(None);
            }
            let count = batch.len();
            let report = ctx.engine.ingest_measurements(batch).await?;
            source.ack_measurements(count).await?;
            Ok(Some(report))
        };
        if let Some(Some(report)) = ctx.cycle("ingestion", work).await? {
            tracing::info!(
                accepted = report.accepted,
                recomputed = report.recomputed,
                scheduled = report.scheduled,
                "readings ingested"
            );
        }
        if !ctx.wait(interval).await {
            return Ok(());
        }
    }
}

async fn marker_loop(ctx: LoopContext, sources: Sources, mut intervals: IntervalConfig) -> Result<()> {
    loop {
        let interval = ctx.reload(&mut intervals).markers;
        let work = async {
            // Markers come in timestamp order within each inbox drain. The
            // applied prefix is acknowledged even when a later one fails.
            let markers = sources.markers.poll_markers().await?;
            let (mut applied, mut inserted, mut failure) = (0, 0, None);
            for marker in markers {
                match ctx.engine.insert_marker(marker).await {
                    Ok(report) => {
                        applied += 1;
                        inserted += report.accepted;
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            if applied > 0 {
                sources.markers.ack_markers(applied).await?;
            }
            if let Some(e) = failure {
                return Err(e);
            }

            let requests = sources.requests.poll_requests().await?;
            let mut submitted = 0;
            for payload in requests {
                match ctx.engine.submit_request(payload).await {
                    Ok(_) => submitted += 1,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            if submitted > 0 {
                sources.requests.ack_requests(submitted).await?;
            }
            if let Some(e) = failure {
                return Err(e);
            }
            Ok::<_, EngineError>((inserted, submitted))
        };
        if let Some((inserted, submitted)) = ctx.cycle("markers", work).await? {
            if inserted > 0 || submitted > 0 {
                tracing::info!(inserted, submitted, "markers and requests polled");
            }
        }
        if !ctx.wait(interval).await {
            return Ok(());
        }
    }
}

async fn cascade_loop(ctx: LoopContext, mut intervals: IntervalConfig) -> Result<()> {
    loop {
        let interval = ctx.reload(&mut intervals).cascade;
        ctx.cycle("cascade", ctx.engine.catch_up()).await?;
        if !ctx.wait(interval).await {
            return Ok(());
        }
    }
}
