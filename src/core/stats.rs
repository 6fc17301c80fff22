//! Window and period statistics.
//!
//! Everything here is a pure function of its inputs. Time-in-range figures
//! are shares of readings, not of wall-clock time: every reading counts once
//! no matter how far it sits from its neighbours.

use crate::core::types::{BandPosition, Measurement, RangeStats, TargetBand, WindowStats};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;

/// Stats for one local calendar day of a period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub stats: RangeStats,
}

/// Shared distribution figures.
struct Distribution {
    count: usize,
    min: f64,
    max: f64,
    avg: f64,
    below_pct: f64,
    within_pct: f64,
    above_pct: f64,
}

fn distribution(values: &[f64], band: &TargetBand) -> Option<Distribution> {
    if values.is_empty() {
        return None;
    }

    let (mut below, mut within, mut above) = (0usize, 0usize, 0usize);
    for &v in values {
        match band.classify(v) {
            BandPosition::Below => below += 1,
            BandPosition::Within => within += 1,
            BandPosition::Above => above += 1,
        }
    }

    let n = values.len() as f64;
    Some(Distribution {
        count: values.len(),
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        avg: values.iter().sum::<f64>() / n,
        below_pct: below as f64 * 100.0 / n,
        within_pct: within as f64 * 100.0 / n,
        above_pct: above as f64 * 100.0 / n,
    })
}

fn finite_values(measurements: &[Measurement]) -> Vec<f64> {
    measurements
        .iter()
        .map(|m| m.value)
        .filter(|v| v.is_finite())
        .collect()
}

/// Reading closest to `anchor`; on equal distance the earlier one wins.
fn nearest_to(measurements: &[Measurement], anchor: DateTime<Utc>) -> Option<&Measurement> {
    measurements
        .iter()
        .filter(|m| m.value.is_finite())
        .min_by_key(|m| {
            let distance = if m.timestamp >= anchor {
                m.timestamp - anchor
            } else {
                anchor - m.timestamp
            };
            (distance, m.timestamp)
        })
}

/// Highest reading at or after `anchor`; the earliest one wins a tie.
fn peak_after(measurements: &[Measurement], anchor: DateTime<Utc>) -> Option<&Measurement> {
    measurements
        .iter()
        .filter(|m| m.timestamp >= anchor && m.value.is_finite())
        .fold(None, |best: Option<&Measurement>, m| match best {
            Some(b) if b.value > m.value => Some(b),
            Some(b) if b.value == m.value && b.timestamp <= m.timestamp => Some(b),
            _ => Some(m),
        })
}

/// Compute statistics for a marker window.
///
/// `measurements` must already be restricted to the window boundaries and
/// `anchor` is the marker timestamp. An empty input yields the "no data"
/// snapshot rather than an error.
pub fn compute_window_stats(
    measurements: &[Measurement],
    anchor: DateTime<Utc>,
    band: &TargetBand,
) -> WindowStats {
    let values = finite_values(measurements);
    let Some(dist) = distribution(&values, band) else {
        return WindowStats::empty();
    };

    let value_at_anchor = nearest_to(measurements, anchor).map(|m| m.value);
    let peak = peak_after(measurements, anchor);
    let spike = match (peak, value_at_anchor) {
        (Some(p), Some(v)) => Some(p.value - v),
        _ => None,
    };

    // Sample deviation needs two readings.
    let std_dev = (values.len() > 1).then(|| values.iter().std_dev());

    WindowStats {
        count: dist.count,
        min: Some(dist.min),
        max: Some(dist.max),
        avg: Some(dist.avg),
        std_dev,
        value_at_anchor,
        spike,
        peak_time: peak.map(|p| p.timestamp),
        time_in_range_pct: Some(dist.within_pct),
        time_above_range_pct: Some(dist.above_pct),
        time_below_range_pct: Some(dist.below_pct),
    }
}

/// Compute statistics for a day or an arbitrary period. Same algorithm as
/// [`compute_window_stats`] without the anchor fields, with a population
/// standard deviation.
pub fn compute_range_stats(measurements: &[Measurement], band: &TargetBand) -> RangeStats {
    let values = finite_values(measurements);
    let Some(dist) = distribution(&values, band) else {
        return RangeStats::default();
    };

    RangeStats {
        count: dist.count,
        min: Some(dist.min),
        max: Some(dist.max),
        avg: Some(dist.avg),
        std_dev: Some(values.iter().population_std_dev()),
        time_in_range_pct: Some(dist.within_pct),
        time_above_range_pct: Some(dist.above_pct),
        time_below_range_pct: Some(dist.below_pct),
    }
}

/// Split readings into local calendar days of `tz` and compute range stats
/// for each day that has data, oldest first.
pub fn compute_daily_stats(
    measurements: &[Measurement],
    band: &TargetBand,
    tz: Tz,
) -> Vec<DailyStats> {
    let mut days: BTreeMap<NaiveDate, Vec<Measurement>> = BTreeMap::new();
    for m in measurements {
        days.entry(m.timestamp.with_timezone(&tz).date_naive())
            .or_default()
            .push(*m);
    }

    days.into_iter()
        .map(|(date, readings)| DailyStats {
            date,
            stats: compute_range_stats(&readings, band),
        })
        .collect()
}
