//! Marker Window Agent CLI
//!
//! Marker-anchored window segmentation and enrichment for sensor streams.

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use marker_window_agent::{
    activity::{ActivityLog, FanoutSink, NullSink, SharedSink, TracingSink},
    analyzer::{OfflineAnalyzer, SharedAnalyzer},
    clock::SystemClock,
    store::{HistoryRepository, JobRepository, WindowRepository},
    Agent, Config, JobKind, JobStatus, JsonInbox, MemoryStore, VERSION,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[cfg(feature = "gateway")]
use marker_window_agent::analyzer::GatewayAnalyzer;

#[derive(Parser)]
#[command(name = "marker-window")]
#[command(version = VERSION)]
#[command(about = "Marker-anchored window segmentation and enrichment", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent in the foreground until Ctrl+C
    Start,

    /// Show windows, jobs and activity counters
    Status,

    /// Print a marker's window and its enrichment history as JSON
    History {
        /// Marker id
        marker_id: Uuid,
    },

    /// Validate an envelope file and copy it into the inbox
    Ingest {
        /// JSON file with measurements, markers and/or requests
        file: PathBuf,
    },

    /// Recompute every window from scratch (run while the agent is stopped)
    Rebuild,

    /// Stop scheduling new enrichment jobs
    Pause,

    /// Resume scheduling enrichment jobs
    Resume,

    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Start => cmd_start().await,
        Commands::Status => cmd_status().await,
        Commands::History { marker_id } => cmd_history(marker_id).await,
        Commands::Ingest { file } => cmd_ingest(file).await,
        Commands::Rebuild => cmd_rebuild().await,
        Commands::Pause => cmd_pause(),
        Commands::Resume => cmd_resume(),
        Commands::Config => cmd_config(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn cmd_start() -> anyhow::Result<()> {
    println!("Marker Window Agent v{VERSION}");
    println!();

    let config = Config::load().context("loading configuration")?;
    config.validate()?;
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }

    let store = Arc::new(
        MemoryStore::open(config.store_path())
            .await
            .context("opening store")?,
    );
    let activity = Arc::new(ActivityLog::with_persistence(config.activity_path()));
    let sinks: Vec<SharedSink> = vec![activity.clone(), Arc::new(TracingSink)];
    let sink: SharedSink = Arc::new(FanoutSink::new(sinks));
    let inbox = Arc::new(JsonInbox::new(config.inbox_path.clone()));

    println!("Starting agent...");
    println!("  Store: {:?}", config.store_path());
    println!("  Inbox: {:?}", config.inbox_path);
    println!("  Cooldown: {}s", config.cooldown.as_secs());
    println!(
        "  Target band: {} - {}",
        config.target_band.low, config.target_band.high
    );
    println!("  Timezone: {}", config.timezone);
    if config.paused {
        println!("  Scheduling is paused. Use 'marker-window resume' to continue.");
    }

    let analyzer = build_analyzer(&config).await;
    let agent = Agent::new(&config, store, Arc::new(SystemClock), analyzer, sink)?
        .with_source(inbox)
        .with_config_loader(Arc::new(Config::load));

    let cancel = CancellationToken::new();
    let saver = {
        let activity = activity.clone();
        let cancel = cancel.clone();
        let every = config.intervals.cascade;
        tokio::spawn(async move { activity.autosave(every, cancel).await })
    };
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!();
            println!("Stopping agent...");
            shutdown.cancel();
        }
    });

    println!();
    println!("Press Ctrl+C to stop.");
    println!();

    let result = agent.run(cancel.clone()).await;
    cancel.cancel();
    let _ = saver.await;

    if let Err(e) = activity.save() {
        eprintln!("Warning: Could not save activity stats: {e}");
    }
    println!();
    println!("{}", activity.summary());

    result.context("agent stopped on a fatal error")
}

/// Gateway analyzer when configured and compiled in, offline otherwise.
#[allow(unused_variables)]
async fn build_analyzer(config: &Config) -> SharedAnalyzer {
    #[cfg(feature = "gateway")]
    if let Some(gateway) = config.analyzer.gateway() {
        let url = gateway.url();
        match GatewayAnalyzer::new(gateway) {
            Ok(analyzer) => {
                match analyzer.test_connection().await {
                    Ok(true) => println!("  Analyzer: gateway at {url}"),
                    _ => println!("  Analyzer: gateway at {url} (not reachable yet)"),
                }
                return Arc::new(analyzer);
            }
            Err(e) => {
                eprintln!("Warning: Could not create gateway client: {e}");
                eprintln!("Falling back to the offline analyzer.");
            }
        }
    }

    println!("  Analyzer: offline");
    Arc::new(OfflineAnalyzer::new())
}

async fn cmd_status() -> anyhow::Result<()> {
    let config = Config::load().unwrap_or_default();

    println!("Marker Window Agent Status");
    println!("==========================");
    println!();

    println!("Configuration:");
    println!("  Paused: {}", config.paused);
    println!("  Cooldown: {}s", config.cooldown.as_secs());
    println!(
        "  Target band: {} - {}",
        config.target_band.low, config.target_band.high
    );
    println!("  Timezone: {}", config.timezone);
    println!();

    let store = MemoryStore::open(config.store_path()).await?;
    let windows = store.list_windows().await?;
    let unenriched = store.list_unenriched().await?;
    println!(
        "Windows: {} ({} awaiting enrichment)",
        windows.len(),
        unenriched.len()
    );
    println!();

    println!("Jobs:");
    let statuses = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];
    for kind in JobKind::ALL {
        let mut counts = Vec::with_capacity(statuses.len());
        for status in statuses {
            let n = store.list_jobs(kind, &[status]).await?.len();
            counts.push(format!("{n} {status}"));
        }
        println!("  {kind}: {}", counts.join(", "));
    }
    println!();

    let stats_path = config.activity_path();
    if stats_path.exists() {
        if let Ok(content) = std::fs::read_to_string(&stats_path) {
            if let Ok(stats) = serde_json::from_str::<serde_json::Value>(&content) {
                println!("Cumulative Activity:");
                if let Some(n) = stats.get("measurements_ingested") {
                    println!("  Measurements ingested: {n}");
                }
                if let Some(n) = stats.get("markers_inserted") {
                    println!("  Markers inserted: {n}");
                }
                if let Some(n) = stats.get("windows_recomputed") {
                    println!("  Windows recomputed: {n}");
                }
                if let Some(updated) = stats.get("last_updated") {
                    println!("  Last updated: {updated}");
                }
            }
        }
    } else {
        println!("No previous session data found.");
    }

    Ok(())
}

async fn cmd_history(marker_id: Uuid) -> anyhow::Result<()> {
    let config = Config::load().unwrap_or_default();
    let store = MemoryStore::open(config.store_path()).await?;

    let window = store
        .get_window(marker_id)
        .await?
        .ok_or_else(|| anyhow!("no window for marker {marker_id}"))?;
    let history = store.list_history(window.id()).await?;

    let out = serde_json::json!({
        "window": window,
        "history": history,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn cmd_ingest(file: PathBuf) -> anyhow::Result<()> {
    let config = Config::load().unwrap_or_default();
    let inbox = JsonInbox::new(config.inbox_path.clone());

    let stored = inbox
        .submit(&file)
        .await
        .with_context(|| format!("ingesting {file:?}"))?;
    println!("Queued {file:?} as {stored:?}");
    println!("The running agent picks it up on its next poll.");
    Ok(())
}

async fn cmd_rebuild() -> anyhow::Result<()> {
    let config = Config::load().unwrap_or_default();
    config.validate()?;
    let store = Arc::new(MemoryStore::open(config.store_path()).await?);

    let agent = Agent::new(
        &config,
        store,
        Arc::new(SystemClock),
        Arc::new(OfflineAnalyzer::new()),
        Arc::new(NullSink),
    )?;
    let report = agent.engine().rebuild().await?;

    println!("Rebuild complete.");
    println!("  Windows recomputed: {}", report.recomputed);
    println!("  Enrichment candidates: {}", report.candidates);
    println!("  Jobs scheduled: {}", report.scheduled);
    if report.scheduled > 0 {
        println!("Scheduled jobs run on the next 'marker-window start'.");
    }
    Ok(())
}

fn cmd_pause() -> anyhow::Result<()> {
    let mut config = Config::load().unwrap_or_default();
    config.paused = true;
    config.save().context("saving config")?;
    println!("Scheduling paused. Use 'marker-window resume' to continue.");
    Ok(())
}

fn cmd_resume() -> anyhow::Result<()> {
    let mut config = Config::load().unwrap_or_default();
    config.paused = false;
    config.save().context("saving config")?;
    println!("Scheduling resumed.");
    Ok(())
}

fn cmd_config() -> anyhow::Result<()> {
    let config = Config::load().unwrap_or_default();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
