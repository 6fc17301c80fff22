//! Configuration for the marker window agent.

use crate::core::segmentation::SegmentationParams;
use crate::core::types::TargetBand;
use crate::error::ConfigError;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Window boundary rules
    pub segmentation: SegmentationConfig,

    /// Inclusive band for the time-in-range figures
    pub target_band: TargetBand,

    /// Stats differences at or below this are treated as noise
    pub change_epsilon: f64,

    /// Minimum time between two non-forced enrichments of one window
    #[serde(with = "duration_serde")]
    pub cooldown: Duration,

    /// Polling loop intervals, re-read every cycle
    pub intervals: IntervalConfig,

    /// IANA timezone used for day buckets in summaries
    pub timezone: String,

    pub analyzer: AnalyzerConfig,

    /// Path for the store, activity stats and other state
    pub data_path: PathBuf,

    /// Directory polled for envelope files
    pub inbox_path: PathBuf,

    /// Whether scheduling of new enrichment jobs is paused
    pub paused: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("marker-window-agent");

        Self {
            segmentation: SegmentationConfig::default(),
            target_band: TargetBand::default(),
            change_epsilon: 0.001,
            cooldown: Duration::from_secs(30 * 60),
            intervals: IntervalConfig::default(),
            timezone: "UTC".to_string(),
            analyzer: AnalyzerConfig::default(),
            inbox_path: data_dir.join("inbox"),
            data_path: data_dir,
            paused: false,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if absent.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
            let config: Config = serde_json::from_str(&content)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("marker-window-agent")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        std::fs::create_dir_all(&self.inbox_path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segmentation.minimum_lookahead_mins == 0 {
            return Err(ConfigError::Invalid(
                "minimum lookahead must be greater than zero".into(),
            ));
        }
        let band = &self.target_band;
        if !band.low.is_finite() || !band.high.is_finite() || band.low > band.high {
            return Err(ConfigError::Invalid(format!(
                "target band [{}, {}] is not a valid range",
                band.low, band.high
            )));
        }
        if !self.change_epsilon.is_finite() || self.change_epsilon < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "change epsilon {} must be a non-negative number",
                self.change_epsilon
            )));
        }
        if self.intervals.ingestion.is_zero()
            || self.intervals.markers.is_zero()
            || self.intervals.cascade.is_zero()
        {
            return Err(ConfigError::Invalid("loop intervals must be non-zero".into()));
        }
        self.tz()?;
        Ok(())
    }

    pub fn segmentation_params(&self) -> SegmentationParams {
        let mins = |m: u32| chrono::Duration::minutes(i64::from(m));
        SegmentationParams {
            default_lookback: mins(self.segmentation.default_lookback_mins),
            default_lookahead: mins(self.segmentation.default_lookahead_mins),
            minimum_lookahead: mins(self.segmentation.minimum_lookahead_mins),
        }
    }

    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::Invalid(format!("unknown timezone {:?}", self.timezone)))
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.cooldown).unwrap_or(chrono::Duration::MAX)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_path.join("store.json")
    }

    pub fn activity_path(&self) -> PathBuf {
        self.data_path.join("activity.json")
    }
}

/// Window boundary rules, in minutes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentationConfig {
    pub default_lookback_mins: u32,
    pub default_lookahead_mins: u32,
    pub minimum_lookahead_mins: u32,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            default_lookback_mins: 180,
            default_lookahead_mins: 240,
            minimum_lookahead_mins: 180,
        }
    }
}

/// How often each polling loop runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalConfig {
    #[serde(with = "duration_serde")]
    pub ingestion: Duration,
    #[serde(with = "duration_serde")]
    pub markers: Duration,
    #[serde(with = "duration_serde")]
    pub cascade: Duration,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            ingestion: Duration::from_secs(60),
            markers: Duration::from_secs(60),
            cascade: Duration::from_secs(300),
        }
    }
}

/// Analyzer selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Model hint used when a job carries no override
    pub default_model: Option<String>,
    pub gateway_host: Option<String>,
    pub gateway_port: Option<u16>,
    pub gateway_token: Option<String>,
}

impl AnalyzerConfig {
    /// Gateway settings, if port and token are both configured.
    #[cfg(feature = "gateway")]
    pub fn gateway(&self) -> Option<crate::analyzer::GatewayConfig> {
        let port = self.gateway_port?;
        let token = self.gateway_token.clone()?;
        let host = self
            .gateway_host
            .clone()
            .unwrap_or_else(|| "127.0.0.1".to_string());
        Some(crate::analyzer::GatewayConfig::new(host, port, token))
    }
}

/// Serde support for Duration.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
