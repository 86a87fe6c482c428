//! Configuration management for the presence tracker.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the tracker.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Service-level settings (logging, metrics)
    #[serde(default)]
    pub service: ServiceConfig,

    /// Camera feeds to observe
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,

    /// Site snapshot files (catalog, regions, camera status)
    #[serde(default)]
    pub site: SiteConfig,

    /// Recognition and sampling settings
    #[serde(default)]
    pub recognition: RecognitionConfig,

    /// Durable storage locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// Remote collector delivery settings
    pub delivery: DeliveryConfig,
}

/// Service-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Port for the Prometheus exporter; disabled when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// A single camera feed.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Stream or snapshot URL (rtsp://, http://, https://)
    pub url: String,

    /// Source identifier override; derived from the URL host when absent
    #[serde(default)]
    pub source_id: Option<String>,
}

/// Locations of the site snapshot files loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Identity key -> embedding vector
    #[serde(default = "default_features_file")]
    pub features_file: PathBuf,

    /// Identity key -> display name
    #[serde(default = "default_names_file")]
    pub names_file: PathBuf,

    /// Source id -> list of polygonal block zones
    #[serde(default = "default_block_regions_file")]
    pub block_regions_file: PathBuf,

    /// Source id -> list of rectangular seat zones
    #[serde(default = "default_seat_regions_file")]
    pub seat_regions_file: PathBuf,

    /// Source id -> operational status ("Working" or anything else)
    #[serde(default = "default_camera_status_file")]
    pub camera_status_file: PathBuf,
}

/// Recognition, sampling and feed retry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionConfig {
    /// Minimum cosine similarity for a detection to count as an identity
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Per-identity cooldown between events on the same source, in seconds
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Frames skipped before each read on a working camera
    #[serde(default = "default_skip_frames")]
    pub skip_frames_working: u32,

    /// Frames skipped before each read on an idle camera
    #[serde(default = "default_skip_frames")]
    pub skip_frames_idle: u32,

    /// Delay before reopening a feed that failed or ended, in seconds
    #[serde(default = "default_feed_retry_delay_secs")]
    pub feed_retry_delay_secs: u64,

    /// Inference service endpoint
    #[serde(default = "default_inference_endpoint")]
    pub inference_endpoint: String,

    /// Inference request timeout in seconds
    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,

    /// Polling interval for snapshot feeds in milliseconds
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,

    /// RTSP transport protocol (tcp, udp, or udp-mcast)
    #[serde(default = "default_transport")]
    pub transport: String,

    /// RTSP jitter buffer in milliseconds
    #[serde(default = "default_buffer_ms")]
    pub buffer_ms: u32,
}

/// Durable storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the pending outbox log and the audit journal
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory for per-identity daily history records
    #[serde(default = "default_history_dir")]
    pub history_dir: PathBuf,
}

/// Remote collector configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Collector endpoint receiving batched records
    pub api_url: String,

    /// Static credential sent as the `ApiKey` header
    #[serde(default)]
    pub api_key: String,

    /// Delivery cycle period in seconds
    #[serde(default = "default_delivery_interval_secs")]
    pub interval_secs: u64,

    /// Request timeout in seconds
    #[serde(default = "default_delivery_timeout_secs")]
    pub timeout_secs: u64,

    /// Send attempts per cycle
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff unit in milliseconds; attempt i waits base * 2^i
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Maximum records per collector request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

// Default value functions
fn default_service_name() -> String {
    "presence-tracker".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_features_file() -> PathBuf {
    PathBuf::from("site/features.json")
}
fn default_names_file() -> PathBuf {
    PathBuf::from("site/names.json")
}
fn default_block_regions_file() -> PathBuf {
    PathBuf::from("site/block_regions.json")
}
fn default_seat_regions_file() -> PathBuf {
    PathBuf::from("site/seat_regions.json")
}
fn default_camera_status_file() -> PathBuf {
    PathBuf::from("site/camera_status.json")
}
fn default_similarity_threshold() -> f32 {
    0.5
}
fn default_cooldown_secs() -> u64 {
    60
}
fn default_skip_frames() -> u32 {
    5
}
fn default_feed_retry_delay_secs() -> u64 {
    10
}
fn default_inference_endpoint() -> String {
    "http://localhost:8500/v1/detect".to_string()
}
fn default_inference_timeout_secs() -> u64 {
    5
}
fn default_snapshot_interval_ms() -> u64 {
    200
}
fn default_transport() -> String {
    "tcp".to_string()
}
fn default_buffer_ms() -> u32 {
    200
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("track_data")
}
fn default_history_dir() -> PathBuf {
    PathBuf::from("track_records")
}
fn default_delivery_interval_secs() -> u64 {
    10
}
fn default_delivery_timeout_secs() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    50
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            features_file: default_features_file(),
            names_file: default_names_file(),
            block_regions_file: default_block_regions_file(),
            seat_regions_file: default_seat_regions_file(),
            camera_status_file: default_camera_status_file(),
        }
    }
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            cooldown_secs: default_cooldown_secs(),
            skip_frames_working: default_skip_frames(),
            skip_frames_idle: default_skip_frames(),
            feed_retry_delay_secs: default_feed_retry_delay_secs(),
            inference_endpoint: default_inference_endpoint(),
            inference_timeout_secs: default_inference_timeout_secs(),
            snapshot_interval_ms: default_snapshot_interval_ms(),
            transport: default_transport(),
            buffer_ms: default_buffer_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            history_dir: default_history_dir(),
        }
    }
}

impl DeliveryConfig {
    /// Create a delivery configuration for the given collector URL.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: String::new(),
            interval_secs: default_delivery_interval_secs(),
            timeout_secs: default_delivery_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            batch_size: default_batch_size(),
        }
    }

    /// Get the delivery cycle period as Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Get the request timeout as Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Get the backoff unit as Duration.
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

impl RecognitionConfig {
    /// Get the cooldown window as Duration.
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Get the feed reopen delay as Duration.
    pub fn feed_retry_delay(&self) -> Duration {
        Duration::from_secs(self.feed_retry_delay_secs)
    }

    /// Get the inference timeout as Duration.
    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    /// Get the snapshot polling interval as Duration.
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }
}

impl TrackerConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with TRACKER_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. TRACKER_DELIVERY__API_KEY
            .add_source(
                Environment::with_prefix("TRACKER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.feeds.is_empty() {
            return Err(ConfigValidationError::MissingField("feeds".to_string()));
        }

        for (index, feed) in self.feeds.iter().enumerate() {
            if feed.url.is_empty() {
                return Err(ConfigValidationError::MissingField(format!(
                    "feeds[{}].url",
                    index
                )));
            }
        }

        if self.delivery.api_url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "delivery.api_url".to_string(),
            ));
        }
        if url::Url::parse(&self.delivery.api_url).is_err() {
            return Err(ConfigValidationError::InvalidValue {
                field: "delivery.api_url".to_string(),
                message: "URL is not well formed".to_string(),
            });
        }

        if self.delivery.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "delivery.max_attempts".to_string(),
                message: "At least one attempt is required".to_string(),
            });
        }

        if self.delivery.batch_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "delivery.batch_size".to_string(),
                message: "Batch size must be greater than 0".to_string(),
            });
        }

        if self.delivery.interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "delivery.interval_secs".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.recognition.similarity_threshold) {
            return Err(ConfigValidationError::InvalidValue {
                field: "recognition.similarity_threshold".to_string(),
                message: "Threshold must be within [0, 1]".to_string(),
            });
        }

        if self.recognition.snapshot_interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "recognition.snapshot_interval_ms".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
