//! Marker Window Agent - marker-anchored segmentation of sensor streams.
//!
//! This library cuts a stream of timestamped readings into windows anchored
//! on event markers (meals, doses, workouts), keeps each window's statistics
//! current as late data and late markers arrive, and enriches windows with an
//! external analyzer through durable, single-flight job queues.
//!
//! # Guarantees
//!
//! - **Deterministic boundaries**: windows depend only on marker order and timing
//! - **Incremental recompute**: new data touches only the windows it overlaps
//! - **Append-only history**: every enrichment is kept; the window shows the latest
//! - **Single flight**: at most one analyzer call in flight per job kind
//! - **Durable jobs**: pending and in-flight jobs survive a restart
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Marker Window Agent                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │   Sources   │──▶│   Engine    │──▶│  Recompute  │         │
//! │  │   (inbox)   │   │ (cooldown)  │   │   Cascade   │         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! │                           │                  │                │
//! │                           ▼                  ▼                │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │  Activity   │◀──│  Job Queues │──▶│  Analyzer   │         │
//! │  │    Log      │   │ (per kind)  │   │  (gateway)  │         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use marker_window_agent::{
//!     activity::ActivityLog, analyzer::OfflineAnalyzer, clock::SystemClock, Agent, Config,
//!     MemoryStore,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let store = Arc::new(MemoryStore::open(config.store_path()).await?);
//! let agent = Agent::new(
//!     &config,
//!     store,
//!     Arc::new(SystemClock),
//!     Arc::new(OfflineAnalyzer::new()),
//!     Arc::new(ActivityLog::new()),
//! )?;
//! agent.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod activity;
pub mod agent;
pub mod analyzer;
pub mod cascade;
pub mod clock;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod queue;
pub mod sources;
pub mod store;
pub mod workflows;

// Re-export key types at crate root for convenience
pub use agent::{Agent, ConfigLoader};
pub use cascade::{Candidate, CascadeOutcome, CascadeSettings, RecomputeCascade, WindowLock};
pub use config::Config;
pub use core::{Marker, Measurement, Period, TargetBand, Window, WindowStats};
pub use engine::{CycleReport, Engine, EngineSettings, QueueHandles};
pub use error::{AnalyzerError, ConfigError, EngineError, Result};
pub use queue::{Job, JobKind, JobQueue, JobStatus, QueueHandle};
pub use sources::JsonInbox;
pub use store::{MemoryStore, SharedStore};
pub use workflows::{AnalysisSettings, LiveSettings};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
