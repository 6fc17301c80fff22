//! Pure computation for the marker window agent.
//!
//! This module contains:
//! - The data model (measurements, markers, windows, history)
//! - Window and period statistics
//! - Marker-anchored window segmentation
//! - Change detection and the enrichment cooldown

pub mod change;
pub mod segmentation;
pub mod stats;
pub mod types;

// Re-export commonly used types
pub use change::{has_changed, may_reanalyze};
pub use segmentation::{boundaries_at, compute_boundaries, sort_markers, SegmentationParams};
pub use stats::{compute_daily_stats, compute_range_stats, compute_window_stats, DailyStats};
pub use types::{
    BandPosition, EnrichmentHistoryEntry, EnrichmentReason, Marker, Measurement, Period,
    RangeStats, TargetBand, Window, WindowStats,
};
