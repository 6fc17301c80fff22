//! Analyzer port.
//!
//! The analyzer is the external classifier that turns a window's (or a
//! period's) numbers into text. It is slow, may be rate limited and may
//! answer with nothing useful, so callers treat every response with
//! suspicion.

pub mod offline;

#[cfg(feature = "gateway")]
pub mod gateway;

use crate::error::AnalyzerError;
use crate::queue::JobKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub use offline::OfflineAnalyzer;

#[cfg(feature = "gateway")]
pub use gateway::{GatewayAnalyzer, GatewayConfig};

/// Everything the analyzer gets to see for one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisContext {
    pub kind: JobKind,
    pub subject_id: Uuid,
    pub prompt: String,
    /// Structured data the prompt refers to
    pub data: serde_json::Value,
}

/// Token and latency accounting for one analyzer call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub model: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
}

/// Raw analyzer answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerResponse {
    pub result_text: String,
    pub classification: Option<String>,
    pub usage: UsageMetrics,
}

impl AnalyzerResponse {
    /// The result text, or `None` if the analyzer said nothing.
    pub fn usable_text(&self) -> Option<&str> {
        let text = self.result_text.trim();
        (!text.is_empty()).then_some(text)
    }

    /// The classification label if it survives [`parse_classification`].
    pub fn label(&self) -> Option<String> {
        self.classification.as_deref().and_then(parse_classification)
    }
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn enrich(
        &self,
        context: &AnalysisContext,
        model_hint: Option<&str>,
    ) -> Result<AnalyzerResponse, AnalyzerError>;
}

pub type SharedAnalyzer = Arc<dyn Analyzer>;

const MAX_LABEL_CHARS: usize = 40;

/// Normalize a classification label to `snake_case`.
///
/// Returns `None` for empty or garbled labels (anything but letters,
/// digits, spaces, `-` and `_`, or overly long).
pub fn parse_classification(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches(|c| c == '"' || c == '\'' || c == '.');
    if trimmed.is_empty() || trimmed.chars().count() > MAX_LABEL_CHARS {
        return None;
    }

    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '-' || c == '_')
    {
        return None;
    }

    Some(
        trimmed
            .split(|c: char| c == ' ' || c == '-' || c == '_')
            .filter(|part| !part.is_empty())
            .map(|part| part.to_ascii_lowercase())
            .collect::<Vec<_>>()
            .join("_"),
    )
}

/// Rough token estimate for analyzers that do not report usage.
pub(crate) fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_classification() {
        assert_eq!(parse_classification("Sharp Rise"), Some("sharp_rise".into()));
        assert_eq!(parse_classification(" \"steady\". "), Some("steady".into()));
        assert_eq!(parse_classification("moderate-rise"), Some("moderate_rise".into()));
        assert_eq!(parse_classification(""), None);
        assert_eq!(parse_classification("{\"oops\": true}"), None);
        assert_eq!(parse_classification(&"a".repeat(80)), None);
    }

    #[test]
    fn test_usable_text() {
        let mut response = AnalyzerResponse {
            result_text: "   \n".into(),
            ..Default::default()
        };
        assert_eq!(response.usable_text(), None);

        response.result_text = "  Glucose rose sharply.  ".into();
        assert_eq!(response.usable_text(), Some("Glucose rose sharply."));
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
