//! HTTP analyzer client.
//!
//! Posts analysis contexts to a local analysis gateway and maps its answers
//! onto [`AnalyzerResponse`]. Bodies the gateway garbles come back as empty
//! responses, which the workflows treat as soft failures.

use super::{AnalysisContext, Analyzer, AnalyzerResponse, UsageMetrics};
use crate::error::AnalyzerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway host (default: 127.0.0.1)
    pub host: String,
    /// Gateway port
    pub port: u16,
    /// Bearer authentication token
    pub token: String,
}

impl GatewayConfig {
    /// Create a new gateway configuration.
    pub fn new(host: impl Into<String>, port: u16, token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            token: token.into(),
        }
    }

    /// Get the full gateway URL.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Get the analysis endpoint URL.
    pub fn analyze_url(&self) -> String {
        format!("{}/v1/analyze", self.url())
    }

    /// Get the health check endpoint URL.
    pub fn health_url(&self) -> String {
        format!("{}/health", self.url())
    }
}

/// Request body for the analysis endpoint.
#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    client_id: &'a str,
    kind: &'a str,
    subject_id: Uuid,
    prompt: &'a str,
    data: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

/// Response body from the analysis endpoint.
#[derive(Debug, Deserialize)]
struct AnalyzeResponseBody {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    classification: Option<String>,
    #[serde(default)]
    usage: Option<UsageBody>,
}

#[derive(Debug, Default, Deserialize)]
struct UsageBody {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Analyzer backed by the analysis gateway.
pub struct GatewayAnalyzer {
    config: GatewayConfig,
    client: reqwest::Client,
    client_id: String,
}

impl GatewayAnalyzer {
    /// Create a new gateway analyzer.
    pub fn new(config: GatewayConfig) -> Result<Self, AnalyzerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AnalyzerError::Network(e.to_string()))?;

        // Client ID from hostname + instance
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let client_id = format!(
            "marker-window-{}-{}",
            hostname,
            &Uuid::new_v4().to_string()[..8]
        );

        Ok(Self {
            config,
            client,
            client_id,
        })
    }

    /// Test connection to the gateway.
    pub async fn test_connection(&self) -> Result<bool, AnalyzerError> {
        let response = self
            .client
            .get(self.config.health_url())
            .send()
            .await
            .map_err(map_transport_error)?;

        Ok(response.status().is_success())
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

fn map_transport_error(e: reqwest::Error) -> AnalyzerError {
    if e.is_timeout() {
        AnalyzerError::Timeout
    } else {
        AnalyzerError::Network(e.to_string())
    }
}

/// Interpret a 2xx body. Anything unparseable is an empty answer.
fn parse_body(body: &str, duration_ms: u64, model_hint: Option<&str>) -> AnalyzerResponse {
    let parsed: Option<AnalyzeResponseBody> = serde_json::from_str(body).ok();
    let Some(parsed) = parsed else {
        tracing::warn!("Analyzer gateway returned a non-JSON body ({} bytes)", body.len());
        return AnalyzerResponse {
            usage: UsageMetrics {
                model: model_hint.map(str::to_string),
                duration_ms,
                ..Default::default()
            },
            ..Default::default()
        };
    };

    let usage = parsed.usage.unwrap_or_default();
    AnalyzerResponse {
        result_text: parsed.result.unwrap_or_default(),
        classification: parsed.classification,
        usage: UsageMetrics {
            model: usage.model.or_else(|| model_hint.map(str::to_string)),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            duration_ms,
        },
    }
}

#[async_trait]
impl Analyzer for GatewayAnalyzer {
    async fn enrich(
        &self,
        context: &AnalysisContext,
        model_hint: Option<&str>,
    ) -> Result<AnalyzerResponse, AnalyzerError> {
        let request = AnalyzeRequest {
            client_id: &self.client_id,
            kind: context.kind.as_str(),
            subject_id: context.subject_id,
            prompt: &context.prompt,
            data: &context.data,
            model: model_hint,
        };

        let started = Instant::now();
        let response = self
            .client
            .post(self.config.analyze_url())
            .header("Authorization", format!("Bearer {}", self.config.token))
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(AnalyzerError::RateLimited);
        }
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AnalyzerError::Server {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await.map_err(map_transport_error)?;
        let duration_ms = started.elapsed().as_millis() as u64;
        Ok(parse_body(&body, duration_ms, model_hint))
    }
}
