//! Data model shared by the segmentation, statistics and enrichment layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single timestamped sensor reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Measurement {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// A discrete anchor derived from an external note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Note text the marker was created from
    pub payload: String,
}

impl Marker {
    pub fn new(timestamp: DateTime<Utc>, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            payload: payload.into(),
        }
    }
}

/// An inclusive time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Inclusive-inclusive overlap test.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start <= end && start <= self.end
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }

    /// Smallest period covering both.
    pub fn span(&self, other: Period) -> Period {
        Period::new(self.start.min(other.start), self.end.max(other.end))
    }
}

/// Target band used for the time-in-range family of statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetBand {
    pub low: f64,
    pub high: f64,
}

impl Default for TargetBand {
    fn default() -> Self {
        Self {
            low: 70.0,
            high: 180.0,
        }
    }
}

/// Where a reading falls relative to a [`TargetBand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandPosition {
    Below,
    Within,
    Above,
}

impl TargetBand {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    /// Both ends of the band count as in range.
    pub fn classify(&self, value: f64) -> BandPosition {
        if value < self.low {
            BandPosition::Below
        } else if value > self.high {
            BandPosition::Above
        } else {
            BandPosition::Within
        }
    }
}

/// Statistics for one marker window. Every field except `count` is absent
/// when the window holds no readings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub count: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub std_dev: Option<f64>,
    /// Reading closest to the marker timestamp
    pub value_at_anchor: Option<f64>,
    /// Peak value at or after the anchor minus `value_at_anchor`
    pub spike: Option<f64>,
    pub peak_time: Option<DateTime<Utc>>,
    pub time_in_range_pct: Option<f64>,
    pub time_above_range_pct: Option<f64>,
    pub time_below_range_pct: Option<f64>,
}

impl WindowStats {
    /// The "no data" snapshot.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn has_data(&self) -> bool {
        self.count > 0
    }
}

/// Statistics for an arbitrary period (days, comparisons, summaries).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeStats {
    pub count: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    /// Population standard deviation
    pub std_dev: Option<f64>,
    pub time_in_range_pct: Option<f64>,
    pub time_above_range_pct: Option<f64>,
    pub time_below_range_pct: Option<f64>,
}

/// Why a window is being (re-)enriched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentReason {
    Initial,
    BoundaryChanged,
    NewData,
    Requested,
}

impl EnrichmentReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentReason::Initial => "initial analysis",
            EnrichmentReason::BoundaryChanged => "boundary changed",
            EnrichmentReason::NewData => "new data received",
            EnrichmentReason::Requested => "requested",
        }
    }

    /// Ordering used when two pending requests for one subject are merged.
    fn rank(&self) -> u8 {
        match self {
            EnrichmentReason::NewData => 0,
            EnrichmentReason::Requested => 1,
            EnrichmentReason::Initial => 2,
            EnrichmentReason::BoundaryChanged => 3,
        }
    }

    pub fn strongest(self, other: Self) -> Self {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for EnrichmentReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable audit record of one successful window enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentHistoryEntry {
    pub id: Uuid,
    pub window_id: Uuid,
    pub stats_at_time: WindowStats,
    pub result: String,
    pub classification: Option<String>,
    pub reason: EnrichmentReason,
    pub model: Option<String>,
    pub analyzed_at: DateTime<Utc>,
}

/// The analysis window owned by one marker. Windows share their marker's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub marker_id: Uuid,
    /// Timestamp of the owning marker
    pub anchor: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub stats: WindowStats,
    /// False until the first enrichment, and again whenever the stats move
    /// away from the ones the current result was computed from.
    pub enriched: bool,
    pub enrichment_result: Option<String>,
    pub classification: Option<String>,
    pub last_enriched_at: Option<DateTime<Utc>>,
    /// Error of the latest analysis attempt, cleared by the next success
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_failed_at: Option<DateTime<Utc>>,
}

impl Window {
    pub fn new(marker: &Marker, period: Period, stats: WindowStats) -> Self {
        Self {
            marker_id: marker.id,
            anchor: marker.timestamp,
            period_start: period.start,
            period_end: period.end,
            stats,
            enriched: false,
            enrichment_result: None,
            classification: None,
            last_enriched_at: None,
            last_error: None,
            last_failed_at: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.marker_id
    }

    pub fn period(&self) -> Period {
        Period::new(self.period_start, self.period_end)
    }

    /// Replace boundaries and stats wholesale. Prior enrichment output is kept.
    pub fn recomputed(&self, period: Period, stats: WindowStats) -> Self {
        let stale = stats != self.stats;
        Self {
            period_start: period.start,
            period_end: period.end,
            stats,
            enriched: self.enriched && !stale,
            ..self.clone()
        }
    }

    /// Project the latest history entry onto the window.
    pub fn with_enrichment(&self, entry: &EnrichmentHistoryEntry) -> Self {
        Self {
            enriched: entry.stats_at_time == self.stats,
            enrichment_result: Some(entry.result.clone()),
            classification: entry.classification.clone(),
            last_enriched_at: Some(entry.analyzed_at),
            last_error: None,
            last_failed_at: None,
            ..self.clone()
        }
    }

    /// Record a failed analysis attempt. Earlier results stay in place.
    pub fn with_failure(&self, error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            last_error: Some(error.into()),
            last_failed_at: Some(at),
            ..self.clone()
        }
    }

    pub fn failed(&self) -> bool {
        self.last_error.is_some()
    }
}
