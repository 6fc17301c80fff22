//! Directory inbox of JSON envelope files.
//!
//! Every `*.json` file in the inbox is one [`Envelope`]. A poll stages the
//! contents of every file not staged yet, in name order; files that do not
//! parse or fail validation move to `rejected/` right away. Each of the three
//! source traits serves and acknowledges its own part of the staged data, so
//! the three polling loops run independently. A file moves to `processed/`
//! once every item in it has been acknowledged; until then it stays in the
//! inbox and is read again after a restart.

use super::{MarkerSource, MeasurementSource, RequestSource};
use crate::core::types::{Marker, Measurement};
use crate::error::{EngineError, Result};
use crate::workflows::RequestPayload;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

/// A marker as written by producers. The id is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerInput {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: String,
}

impl From<MarkerInput> for Marker {
    fn from(input: MarkerInput) -> Self {
        Marker {
            id: input.id.unwrap_or_else(Uuid::new_v4),
            timestamp: input.timestamp,
            payload: input.payload,
        }
    }
}

/// Contents of one inbox file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub measurements: Vec<Measurement>,
    #[serde(default)]
    pub markers: Vec<MarkerInput>,
    #[serde(default)]
    pub requests: Vec<RequestPayload>,
}

impl Envelope {
    /// Parse and validate an envelope.
    pub fn from_json(content: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(content)?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(bad) = self.measurements.iter().find(|m| !m.value.is_finite()) {
            return Err(EngineError::InvalidInput(format!(
                "reading at {} is not a finite number",
                bad.timestamp
            )));
        }
        for request in &self.requests {
            let periods = match request {
                RequestPayload::Comparison { first, second } => vec![*first, *second],
                RequestPayload::Summary { period } => vec![*period],
                RequestPayload::Chat { .. } => Vec::new(),
            };
            if let Some(p) = periods.iter().find(|p| p.start > p.end) {
                return Err(EngineError::InvalidInput(format!(
                    "period {} .. {} ends before it starts",
                    p.start, p.end
                )));
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty() && self.markers.is_empty() && self.requests.is_empty()
    }
}

/// One staged item and the file it came from.
#[derive(Debug)]
struct Staged<T> {
    file: PathBuf,
    item: T,
}

/// Items read from inbox files but not acknowledged yet.
#[derive(Debug, Default)]
struct Staging {
    measurements: VecDeque<Staged<Measurement>>,
    /// Sorted by timestamp within each drain
    markers: VecDeque<Staged<Marker>>,
    requests: VecDeque<Staged<RequestPayload>>,
    /// Unacknowledged items per staged file
    open: HashMap<PathBuf, usize>,
}

/// Drop the first `count` items; returns the files that have nothing left.
fn release<T>(
    queue: &mut VecDeque<Staged<T>>,
    open: &mut HashMap<PathBuf, usize>,
    count: usize,
) -> Vec<PathBuf> {
    let mut finished = Vec::new();
    for staged in queue.drain(..count.min(queue.len())) {
        if let Some(left) = open.get_mut(&staged.file) {
            *left = left.saturating_sub(1);
            if *left == 0 {
                open.remove(&staged.file);
                finished.push(staged.file);
            }
        }
    }
    finished
}

pub struct JsonInbox {
    dir: PathBuf,
    staging: Mutex<Staging>,
}

impl JsonInbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            staging: Mutex::new(Staging::default()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy a validated envelope file into the inbox.
    pub async fn submit(&self, source: &Path) -> Result<PathBuf> {
        let content = tokio::fs::read_to_string(source).await?;
        if Envelope::from_json(&content)?.is_empty() {
            return Err(EngineError::InvalidInput(format!("{source:?} holds nothing to ingest")));
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let name = format!(
            "{}-{}.json",
            Utc::now().format("%Y%m%d%H%M%S"),
            &Uuid::new_v4().to_string()[..8]
        );
        let target = self.dir.join(name);
        tokio::fs::write(&target, content).await?;
        Ok(target)
    }

    /// Stage every inbox file not staged yet.
    ///
    /// Markers without an id get one here, so a redelivered marker keeps
    /// its identity.
    async fn drain(&self, staging: &mut Staging) -> Result<()> {
        let files = match self.pending_files().await {
            Ok(files) => files,
            Err(EngineError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut markers = Vec::new();
        for path in files {
            if staging.open.contains_key(&path) {
                continue;
            }
            let parsed = match tokio::fs::read_to_string(&path).await {
                Ok(content) => Envelope::from_json(&content),
                Err(e) => Err(e.into()),
            };

            let envelope = match parsed {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!("Rejecting inbox file {:?}: {e}", path);
                    self.move_to(&path, "rejected").await?;
                    continue;
                }
            };
            tracing::debug!(
                "Inbox file {:?}: {} readings, {} markers, {} requests",
                path,
                envelope.measurements.len(),
                envelope.markers.len(),
                envelope.requests.len()
            );

            let items =
                envelope.measurements.len() + envelope.markers.len() + envelope.requests.len();
            if items == 0 {
                self.move_to(&path, "processed").await?;
                continue;
            }
            staging.open.insert(path.clone(), items);
            staging
                .measurements
                .extend(envelope.measurements.into_iter().map(|item| Staged {
                    file: path.clone(),
                    item,
                }));
            markers.extend(envelope.markers.into_iter().map(|input| Staged {
                file: path.clone(),
                item: Marker::from(input),
            }));
            staging
                .requests
                .extend(envelope.requests.into_iter().map(|item| Staged {
                    file: path.clone(),
                    item,
                }));
        }

        markers.sort_by(|a, b| {
            a.item
                .timestamp
                .cmp(&b.item.timestamp)
                .then(a.item.id.cmp(&b.item.id))
        });
        staging.markers.extend(markers);
        Ok(())
    }

    /// Archive files whose items are all acknowledged. Runs under the
    /// staging lock so a concurrent drain cannot stage them again.
    async fn archive(&self, files: Vec<PathBuf>) -> Result<()> {
        for file in files {
            tracing::debug!("Inbox file {:?} fully applied", file);
            self.move_to(&file, "processed").await?;
        }
        Ok(())
    }

    async fn pending_files(&self) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_file() && path.extension().map(|e| e == "json").unwrap_or(false) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn move_to(&self, path: &Path, folder: &str) -> Result<()> {
        let target_dir = self.dir.join(folder);
        tokio::fs::create_dir_all(&target_dir).await?;
        if let Some(name) = path.file_name() {
            tokio::fs::rename(path, target_dir.join(name)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MeasurementSource for JsonInbox {
    async fn poll_measurements(&self) -> Result<Vec<Measurement>> {
        let mut staging = self.staging.lock().await;
        self.drain(&mut staging).await?;
        Ok(staging.measurements.iter().map(|s| s.item).collect())
    }

    async fn ack_measurements(&self, count: usize) -> Result<()> {
        let mut staging = self.staging.lock().await;
        let Staging {
            measurements, open, ..
        } = &mut *staging;
        let finished = release(measurements, open, count);
        self.archive(finished).await
    }
}

#[async_trait]
impl MarkerSource for JsonInbox {
    async fn poll_markers(&self) -> Result<Vec<Marker>> {
        let mut staging = self.staging.lock().await;
        self.drain(&mut staging).await?;
        Ok(staging.markers.iter().map(|s| s.item.clone()).collect())
    }

    async fn ack_markers(&self, count: usize) -> Result<()> {
        let mut staging = self.staging.lock().await;
        let Staging { markers, open, .. } = &mut *staging;
        let finished = release(markers, open, count);
        self.archive(finished).await
    }
}

#[async_trait]
impl RequestSource for JsonInbox {
    async fn poll_requests(&self) -> Result<Vec<RequestPayload>> {
        let mut staging = self.staging.lock().await;
        self.drain(&mut staging).await?;
        Ok(staging.requests.iter().map(|s| s.item.clone()).collect())
    }

    async fn ack_requests(&self, count: usize) -> Result<()> {
        let mut staging = self.staging.lock().await;
        let Staging { requests, open, .. } = &mut *staging;
        let finished = release(requests, open, count);
        self.archive(finished).await
    }
}
