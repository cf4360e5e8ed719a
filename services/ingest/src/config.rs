//! Configuration management for the ingest passes.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, Environment, File};
use medgram_storage::config::with_db_env_overrides;
use medgram_storage::{ConfigError, DatabaseConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the ingest service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct IngestConfig {
    /// Raw capture locations
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Message loading pass
    #[serde(default)]
    pub loading: LoadingConfig,

    /// Image enrichment pass
    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    /// Object detector
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Warehouse connection
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the raw captures live.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Root of the per-day message batch directories
    #[serde(default = "default_messages_dir")]
    pub messages_dir: PathBuf,

    /// Root of the per-channel image directories
    #[serde(default = "default_images_dir")]
    pub images_dir: PathBuf,

    /// Image file extensions picked up by the enricher (lowercase, no dot)
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

/// Message loading configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadingConfig {
    /// Records inserted concurrently within one batch
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Upper bound for one record insert in seconds
    #[serde(default = "default_record_timeout_secs")]
    pub record_timeout_secs: u64,

    /// Rejections kept in full in the run report
    #[serde(default = "default_max_reported_rejections")]
    pub max_reported_rejections: usize,
}

/// Image enrichment configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EnrichmentConfig {
    /// Images processed concurrently
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Upper bound for one detector call in seconds
    #[serde(default = "default_image_timeout_secs")]
    pub image_timeout_secs: u64,

    /// Failures kept in full in the run report
    #[serde(default = "default_max_reported_rejections")]
    pub max_reported_failures: usize,
}

/// Object detector configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Path to the ONNX model file
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,

    /// Square model input size in pixels
    #[serde(default = "default_input_size")]
    pub input_size: u32,

    /// Detections below this confidence are dropped
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// IoU above which overlapping boxes of one class are merged
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,

    /// Class labels by index; empty keeps the numeric class code
    #[serde(default)]
    pub class_names: Vec<String>,

    /// Intra-op threads for the runtime session
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions

fn default_messages_dir() -> PathBuf {
    PathBuf::from("data/raw/telegram_messages")
}

fn default_images_dir() -> PathBuf {
    PathBuf::from("data/raw/images")
}

fn default_image_extensions() -> Vec<String> {
    vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()]
}

fn default_concurrency() -> usize {
    4
}

fn default_record_timeout_secs() -> u64 {
    90
}

fn default_image_timeout_secs() -> u64 {
    60
}

fn default_max_reported_rejections() -> usize {
    100
}

fn default_model_path() -> PathBuf {
    PathBuf::from("models/yolov8n.onnx")
}

fn default_input_size() -> u32 {
    640
}

fn default_confidence_threshold() -> f32 {
    0.25
}

fn default_iou_threshold() -> f32 {
    0.45
}

fn default_intra_threads() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            messages_dir: default_messages_dir(),
            images_dir: default_images_dir(),
            image_extensions: default_image_extensions(),
        }
    }
}

impl Default for LoadingConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            record_timeout_secs: default_record_timeout_secs(),
            max_reported_rejections: default_max_reported_rejections(),
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            image_timeout_secs: default_image_timeout_secs(),
            max_reported_failures: default_max_reported_rejections(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            input_size: default_input_size(),
            confidence_threshold: default_confidence_threshold(),
            iou_threshold: default_iou_threshold(),
            class_names: Vec::new(),
            intra_threads: default_intra_threads(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from files and environment variables.
    ///
    /// Sources, lowest precedence first: `config/ingest`, `/etc/medgram/ingest`,
    /// an explicit file, `MEDGRAM_INGEST__*` variables, then the plain `DB_*`
    /// variables.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::with_name("config/ingest").required(false))
            .add_source(File::with_name("/etc/medgram/ingest").required(false));

        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path).required(true));
        }

        // MEDGRAM_INGEST__LOADING__CONCURRENCY -> loading.concurrency
        builder = builder.add_source(
            Environment::with_prefix("MEDGRAM_INGEST")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = with_db_env_overrides(builder)?.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loading.concurrency == 0 {
            return Err(invalid("loading.concurrency", "must be at least 1"));
        }

        if self.enrichment.concurrency == 0 {
            return Err(invalid("enrichment.concurrency", "must be at least 1"));
        }

        if self.loading.record_timeout_secs == 0 {
            return Err(invalid("loading.record_timeout_secs", "must be greater than zero"));
        }

        if self.loading.record_timeout() <= self.database.operation_budget() {
            return Err(invalid(
                "loading.record_timeout_secs",
                "must exceed twice database.statement_timeout_secs plus database.retry_delay_ms",
            ));
        }

        if self.enrichment.image_timeout_secs == 0 {
            return Err(invalid("enrichment.image_timeout_secs", "must be greater than zero"));
        }

        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            return Err(invalid("detector.confidence_threshold", "must be within [0, 1]"));
        }

        if !(0.0..=1.0).contains(&self.detector.iou_threshold) {
            return Err(invalid("detector.iou_threshold", "must be within [0, 1]"));
        }

        if self.detector.input_size == 0 {
            return Err(invalid("detector.input_size", "must be greater than zero"));
        }

        if self.capture.image_extensions.is_empty() {
            return Err(ConfigError::MissingRequired(
                "capture.image_extensions".to_string(),
            ));
        }

        self.database.validate()
    }
}

impl LoadingConfig {
    /// Get record timeout as Duration.
    pub fn record_timeout(&self) -> Duration {
        Duration::from_secs(self.record_timeout_secs)
    }
}

impl EnrichmentConfig {
    /// Get image timeout as Duration.
    pub fn image_timeout(&self) -> Duration {
        Duration::from_secs(self.image_timeout_secs)
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
