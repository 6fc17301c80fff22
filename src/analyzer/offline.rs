//! Local rule-based analyzer.
//!
//! Used when no gateway is configured so the agent still produces window
//! labels. It never fails and never talks to the network.

use super::{estimate_tokens, AnalysisContext, Analyzer, AnalyzerResponse, UsageMetrics};
use crate::error::AnalyzerError;
use crate::queue::JobKind;
use async_trait::async_trait;
use serde_json::Value;

/// Spike (in reading units) above which a rise counts as sharp.
const SHARP_RISE_THRESHOLD: f64 = 60.0;

/// Spike above which a rise counts as moderate.
const MODERATE_RISE_THRESHOLD: f64 = 30.0;

pub const OFFLINE_MODEL: &str = "offline-rules";

#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineAnalyzer;

impl OfflineAnalyzer {
    pub fn new() -> Self {
        Self
    }

    fn classify_window(stats: &Value) -> (String, String) {
        let count = stats.get("count").and_then(Value::as_u64).unwrap_or(0);
        if count == 0 {
            return ("no_data".into(), "No readings in this window.".into());
        }

        let spike = stats.get("spike").and_then(Value::as_f64);
        let in_range = stats.get("time_in_range_pct").and_then(Value::as_f64);

        let label = match spike {
            Some(s) if s >= SHARP_RISE_THRESHOLD => "sharp_rise",
            Some(s) if s >= MODERATE_RISE_THRESHOLD => "moderate_rise",
            Some(_) => "steady",
            None => "no_post_marker_data",
        };

        let mut text = format!("{count} readings");
        if let Some(s) = spike {
            text.push_str(&format!(", spike of {s:.1} after the marker"));
        }
        if let Some(pct) = in_range {
            text.push_str(&format!(", {pct:.0}% in range"));
        }
        text.push('.');

        (label.into(), text)
    }

    fn digest(data: &Value) -> String {
        let count = |v: &Value| v.get("count").and_then(Value::as_u64).unwrap_or(0);
        let avg = |v: &Value| v.get("avg").and_then(Value::as_f64);

        match (data.get("first"), data.get("second"), data.get("stats")) {
            (Some(a), Some(b), _) => match (avg(a), avg(b)) {
                (Some(x), Some(y)) => format!(
                    "Average moved from {x:.1} to {y:.1} ({:+.1}) across {} and {} readings.",
                    y - x,
                    count(a),
                    count(b)
                ),
                _ => "Not enough readings to compare these periods.".into(),
            },
            (_, _, Some(stats)) => match avg(stats) {
                Some(x) => format!("{} readings averaging {x:.1}.", count(stats)),
                None => "No readings in this period.".into(),
            },
            _ => "Noted.".into(),
        }
    }
}

#[async_trait]
impl Analyzer for OfflineAnalyzer {
    async fn enrich(
        &self,
        context: &AnalysisContext,
        _model_hint: Option<&str>,
    ) -> Result<AnalyzerResponse, AnalyzerError> {
        let (classification, result_text) = match context.kind {
            JobKind::WindowAnalysis => {
                let stats = context.data.get("stats").cloned().unwrap_or(Value::Null);
                let (label, text) = Self::classify_window(&stats);
                (Some(label), text)
            }
            _ => (None, Self::digest(&context.data)),
        };

        Ok(AnalyzerResponse {
            usage: UsageMetrics {
                model: Some(OFFLINE_MODEL.to_string()),
                input_tokens: estimate_tokens(&context.prompt),
                output_tokens: estimate_tokens(&result_text),
                duration_ms: 0,
            },
            result_text,
            classification,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn context(kind: JobKind, data: Value) -> AnalysisContext {
        AnalysisContext {
            kind,
            subject_id: Uuid::new_v4(),
            prompt: "describe".into(),
            data,
        }
    }

    #[tokio::test]
    async fn test_window_labels() {
        let analyzer = OfflineAnalyzer::new();

        let sharp = context(
            JobKind::WindowAnalysis,
            json!({"stats": {"count": 12, "spike": 75.0, "time_in_range_pct": 50.0}}),
        );
        let response = analyzer.enrich(&sharp, None).await.unwrap();
        assert_eq!(response.classification.as_deref(), Some("sharp_rise"));
        assert!(response.result_text.contains("75.0"));

        let empty = context(JobKind::WindowAnalysis, json!({"stats": {"count": 0}}));
        let response = analyzer.enrich(&empty, None).await.unwrap();
        assert_eq!(response.classification.as_deref(), Some("no_data"));
    }

    #[tokio::test]
    async fn test_comparison_digest() {
        let analyzer = OfflineAnalyzer::new();
        let ctx = context(
            JobKind::PeriodComparison,
            json!({"first": {"count": 10, "avg": 100.0}, "second": {"count": 8, "avg": 110.0}}),
        );
        let response = analyzer.enrich(&ctx, None).await.unwrap();
        assert!(response.result_text.contains("+10.0"));
        assert_eq!(response.usage.model.as_deref(), Some(OFFLINE_MODEL));
    }
}
