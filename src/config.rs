use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::Validate;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";

const DEFAULT_DEDUP_WINDOW_MINS: i64 = 5;
const DEFAULT_CHANGE_EPSILON: f64 = 0.01;
const DEFAULT_INITIAL_SCAN_HOURS: i64 = 24;
const DEFAULT_PASS_BUDGET_SECS: u64 = 300;
const DEFAULT_METRIC_RETENTION_DAYS: i64 = 90;
const DEFAULT_ALERT_RETENTION_DAYS: i64 = 90;

const DEFAULT_MAX_ARTIFACT_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_MAX_STORE_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_KEEP_VERSIONS: usize = 3;
const DEFAULT_LOAD_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_INACTIVE_RETENTION_DAYS: i64 = 30;

const DEFAULT_FALLBACK_ALERT_RATIO: f64 = 0.5;
const DEFAULT_FALLBACK_WARN_RATIO: f64 = 0.2;
const DEFAULT_FALLBACK_MIN_ATTEMPTS: u64 = 10;
const DEFAULT_FALLBACK_ALERT_DEDUP_HOURS: i64 = 1;

const DEFAULT_MIN_TRAINING_POINTS: usize = 100;

/// Data-collection tuning.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    /// Candidates within this many minutes of an existing row are duplicates.
    #[serde(default = "default_dedup_window_mins")]
    pub dedup_window_mins: i64,

    /// Slow-moving signals are re-sampled only when the value moves by more
    /// than this epsilon.
    #[serde(default = "default_change_epsilon")]
    pub change_epsilon: f64,

    /// Lookback for the very first incremental transaction scan.
    #[serde(default = "default_initial_scan_hours")]
    pub initial_scan_hours: i64,

    /// Metric rows older than this are purged by the cleanup pass.
    #[serde(default = "default_metric_retention_days")]
    pub metric_retention_days: i64,

    /// Soft wall-clock budget per collection pass, seconds. On expiry the
    /// pass completes the current entity and stops cleanly.
    #[serde(default = "default_pass_budget_secs")]
    pub pass_budget_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            dedup_window_mins: DEFAULT_DEDUP_WINDOW_MINS,
            change_epsilon: DEFAULT_CHANGE_EPSILON,
            initial_scan_hours: DEFAULT_INITIAL_SCAN_HOURS,
            metric_retention_days: DEFAULT_METRIC_RETENTION_DAYS,
            pass_budget_secs: DEFAULT_PASS_BUDGET_SECS,
        }
    }
}

/// Per-category detection profile. The defaults come from the operational
/// deployments this subsystem was tuned on; every value is overridable.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub lookback_days: i64,
    /// Z-score threshold for the statistical strategy.
    pub threshold: f64,
    /// Window inside which a repeat (alert_type, entity) is suppressed.
    pub dedup_hours: i64,
    /// Deviations below this percentage never raise an alert (0 disables).
    #[serde(default)]
    pub min_deviation_percent: f64,
    /// Only flag deviations above the mean ("above"), below it ("below"),
    /// or in either direction ("both").
    #[serde(default = "default_direction")]
    pub direction: String,
}

fn default_direction() -> String {
    "both".to_string()
}

impl ProfileConfig {
    fn new(
        lookback_days: i64,
        threshold: f64,
        dedup_hours: i64,
        min_deviation_percent: f64,
        direction: &str,
    ) -> Self {
        Self {
            lookback_days,
            threshold,
            dedup_hours,
            min_deviation_percent,
            direction: direction.to_string(),
        }
    }
}

/// Detection tuning: profiles per category plus fallback escalation rules.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DetectionConfig {
    #[serde(default = "default_stock_profile")]
    pub stock: ProfileConfig,
    #[serde(default = "default_consumption_profile")]
    pub consumption: ProfileConfig,
    #[serde(default = "default_task_duration_profile")]
    pub task_duration: ProfileConfig,
    #[serde(default = "default_custody_shrinkage_profile")]
    pub custody_shrinkage: ProfileConfig,
    #[serde(default = "default_occupancy_mismatch_profile")]
    pub occupancy_mismatch: ProfileConfig,
    #[serde(default = "default_request_latency_profile")]
    pub request_latency: ProfileConfig,
    #[serde(default = "default_scan_frequency_profile")]
    pub scan_frequency: ProfileConfig,

    /// Fallback ratio that escalates to a critical system alert.
    #[serde(default = "default_fallback_alert_ratio")]
    pub fallback_alert_ratio: f64,

    /// Fallback ratio that degrades health to `warning`.
    #[serde(default = "default_fallback_warn_ratio")]
    pub fallback_warn_ratio: f64,

    /// Minimum detection attempts before the ratio is meaningful.
    #[serde(default = "default_fallback_min_attempts")]
    pub fallback_min_attempts: u64,

    /// At most one fallback-degraded alert inside this window.
    #[serde(default = "default_fallback_alert_dedup_hours")]
    pub fallback_alert_dedup_hours: i64,

    /// Soft wall-clock budget per scheduled pass, seconds. On expiry the
    /// pass completes the current entity and stops cleanly.
    #[serde(default = "default_pass_budget_secs")]
    pub pass_budget_secs: u64,
}

fn default_stock_profile() -> ProfileConfig {
    ProfileConfig::new(30, 3.0, 1, 0.0, "both")
}
fn default_consumption_profile() -> ProfileConfig {
    ProfileConfig::new(7, 2.5, 6, 40.0, "both")
}
fn default_task_duration_profile() -> ProfileConfig {
    ProfileConfig::new(7, 2.0, 12, 50.0, "above")
}
fn default_custody_shrinkage_profile() -> ProfileConfig {
    ProfileConfig::new(14, 2.5, 12, 30.0, "above")
}
fn default_occupancy_mismatch_profile() -> ProfileConfig {
    ProfileConfig::new(7, 2.0, 24, 0.0, "above")
}
fn default_request_latency_profile() -> ProfileConfig {
    ProfileConfig::new(7, 2.5, 6, 40.0, "above")
}
fn default_scan_frequency_profile() -> ProfileConfig {
    ProfileConfig::new(14, 2.5, 24, 30.0, "both")
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            stock: default_stock_profile(),
            consumption: default_consumption_profile(),
            task_duration: default_task_duration_profile(),
            custody_shrinkage: default_custody_shrinkage_profile(),
            occupancy_mismatch: default_occupancy_mismatch_profile(),
            request_latency: default_request_latency_profile(),
            scan_frequency: default_scan_frequency_profile(),
            fallback_alert_ratio: DEFAULT_FALLBACK_ALERT_RATIO,
            fallback_warn_ratio: DEFAULT_FALLBACK_WARN_RATIO,
            fallback_min_attempts: DEFAULT_FALLBACK_MIN_ATTEMPTS,
            fallback_alert_dedup_hours: DEFAULT_FALLBACK_ALERT_DEDUP_HOURS,
            pass_budget_secs: DEFAULT_PASS_BUDGET_SECS,
        }
    }
}

/// Model store layout and guardrails.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ModelStoreConfig {
    /// Directory holding one `.bin` file per artifact version.
    #[serde(default = "default_store_root")]
    pub root: String,

    /// Integrity ceiling for a single artifact file.
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: u64,

    /// Quota for the whole store directory; crossing 90% of it triggers an
    /// emergency single-version cleanup before a save proceeds.
    #[serde(default = "default_max_store_bytes")]
    pub max_store_bytes: u64,

    /// Versions retained per (model_type, metric_type) by routine cleanup.
    #[serde(default = "default_keep_versions")]
    pub keep_versions: usize,

    /// Bounded retry attempts on corrupt/missing artifact loads.
    #[serde(default = "default_load_retries")]
    pub load_retries: u32,

    /// Base of the exponential backoff between load retries, milliseconds.
    /// Tests inject 0 to avoid sleeping.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Inactive artifacts older than this are purged with their files.
    #[serde(default = "default_inactive_retention_days")]
    pub inactive_retention_days: i64,
}

fn default_store_root() -> String {
    env::var("STOCKWATCH_MODELS_DIR").unwrap_or_else(|_| "./model_store".to_string())
}

impl Default for ModelStoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
            max_artifact_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
            max_store_bytes: DEFAULT_MAX_STORE_BYTES,
            keep_versions: DEFAULT_KEEP_VERSIONS,
            load_retries: DEFAULT_LOAD_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            inactive_retention_days: DEFAULT_INACTIVE_RETENTION_DAYS,
        }
    }
}

/// Alert notification routing. Critical and high alerts fan out to both
/// recipient groups; low and medium reach operations only.
#[derive(Clone, Debug, Default, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct NotificationConfig {
    #[serde(default)]
    pub operations_recipients: Vec<String>,
    #[serde(default)]
    pub inventory_recipients: Vec<String>,
}

/// Model training tuning.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct TrainingConfig {
    /// Minimum pooled series points before a model is trained.
    #[serde(default = "default_min_training_points")]
    pub min_training_points: usize,

    /// Training lookback window, days.
    #[serde(default = "default_training_lookback_days")]
    pub lookback_days: i64,
}

fn default_training_lookback_days() -> i64 {
    30
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            min_training_points: DEFAULT_MIN_TRAINING_POINTS,
            lookback_days: default_training_lookback_days(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Application environment
    #[serde(default = "default_env")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// Alert rows (read only) older than this are purged by cleanup.
    #[serde(default = "default_alert_retention_days")]
    pub alert_retention_days: i64,

    #[serde(default)]
    #[validate]
    pub collector: CollectorConfig,

    #[serde(default)]
    #[validate]
    pub detection: DetectionConfig,

    #[serde(default)]
    #[validate]
    pub model_store: ModelStoreConfig,

    #[serde(default)]
    #[validate]
    pub notifications: NotificationConfig,

    #[serde(default)]
    #[validate]
    pub training: TrainingConfig,
}

fn default_env() -> String {
    DEFAULT_ENV.to_string()
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_alert_retention_days() -> i64 {
    DEFAULT_ALERT_RETENTION_DAYS
}
fn default_dedup_window_mins() -> i64 {
    DEFAULT_DEDUP_WINDOW_MINS
}
fn default_change_epsilon() -> f64 {
    DEFAULT_CHANGE_EPSILON
}
fn default_initial_scan_hours() -> i64 {
    DEFAULT_INITIAL_SCAN_HOURS
}
fn default_metric_retention_days() -> i64 {
    DEFAULT_METRIC_RETENTION_DAYS
}
fn default_fallback_alert_ratio() -> f64 {
    DEFAULT_FALLBACK_ALERT_RATIO
}
fn default_fallback_warn_ratio() -> f64 {
    DEFAULT_FALLBACK_WARN_RATIO
}
fn default_fallback_min_attempts() -> u64 {
    DEFAULT_FALLBACK_MIN_ATTEMPTS
}
fn default_fallback_alert_dedup_hours() -> i64 {
    DEFAULT_FALLBACK_ALERT_DEDUP_HOURS
}
fn default_pass_budget_secs() -> u64 {
    DEFAULT_PASS_BUDGET_SECS
}
fn default_max_artifact_bytes() -> u64 {
    DEFAULT_MAX_ARTIFACT_BYTES
}
fn default_max_store_bytes() -> u64 {
    DEFAULT_MAX_STORE_BYTES
}
fn default_keep_versions() -> usize {
    DEFAULT_KEEP_VERSIONS
}
fn default_load_retries() -> u32 {
    DEFAULT_LOAD_RETRIES
}
fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}
fn default_inactive_retention_days() -> i64 {
    DEFAULT_INACTIVE_RETENTION_DAYS
}
fn default_min_training_points() -> usize {
    DEFAULT_MIN_TRAINING_POINTS
}

impl AppConfig {
    /// Minimal constructor used by tests and the CLI when no config file is
    /// present.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            environment: default_env(),
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            alert_retention_days: default_alert_retention_days(),
            collector: CollectorConfig::default(),
            detection: DetectionConfig::default(),
            model_store: ModelStoreConfig::default(),
            notifications: NotificationConfig::default(),
            training: TrainingConfig::default(),
        }
    }

    fn validate_additional_constraints(&self) -> Result<(), AppConfigError> {
        if !(0.0..=1.0).contains(&self.detection.fallback_alert_ratio) {
            return Err(AppConfigError::Invalid(
                "detection.fallback_alert_ratio must be within [0, 1]".into(),
            ));
        }
        if self.detection.fallback_warn_ratio > self.detection.fallback_alert_ratio {
            return Err(AppConfigError::Invalid(
                "detection.fallback_warn_ratio must not exceed fallback_alert_ratio".into(),
            ));
        }
        if self.model_store.max_artifact_bytes == 0 || self.model_store.max_store_bytes == 0 {
            return Err(AppConfigError::Invalid(
                "model_store byte limits must be non-zero".into(),
            ));
        }
        for (name, profile) in self.detection.profiles() {
            if profile.threshold <= 0.0 {
                return Err(AppConfigError::Invalid(format!(
                    "detection.{name}.threshold must be positive"
                )));
            }
            if !matches!(profile.direction.as_str(), "both" | "above" | "below") {
                return Err(AppConfigError::Invalid(format!(
                    "detection.{name}.direction must be one of both/above/below"
                )));
            }
        }
        Ok(())
    }
}

impl DetectionConfig {
    /// Named profiles in detection-pass order.
    pub fn profiles(&self) -> Vec<(&'static str, &ProfileConfig)> {
        vec![
            ("stock", &self.stock),
            ("consumption", &self.consumption),
            ("task_duration", &self.task_duration),
            ("custody_shrinkage", &self.custody_shrinkage),
            ("occupancy_mismatch", &self.occupancy_mismatch),
            ("request_latency", &self.request_latency),
            ("scan_frequency", &self.scan_frequency),
        ]
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Load configuration from `config/default`, `config/{env}`, and
/// `APP__`-prefixed environment variables, then validate.
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://stockwatch.db?mode=rwc")?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration validation failed: {}", e);
        e
    })?;

    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let cfg = AppConfig::new("sqlite::memory:");
        assert!(cfg.validate_additional_constraints().is_ok());
        assert_eq!(cfg.detection.stock.lookback_days, 30);
        assert_eq!(cfg.detection.stock.dedup_hours, 1);
        assert_eq!(cfg.detection.consumption.threshold, 2.5);
        assert_eq!(cfg.detection.task_duration.direction, "above");
        assert_eq!(cfg.model_store.load_retries, 3);
    }

    #[test]
    fn warn_ratio_above_alert_ratio_is_rejected() {
        let mut cfg = AppConfig::new("sqlite::memory:");
        cfg.detection.fallback_warn_ratio = 0.9;
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn bogus_direction_is_rejected() {
        let mut cfg = AppConfig::new("sqlite::memory:");
        cfg.detection.stock.direction = "sideways".into();
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn profiles_enumerate_every_category() {
        let cfg = AppConfig::new("sqlite::memory:");
        let names: Vec<&str> = cfg.detection.profiles().iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec![
                "stock",
                "consumption",
                "task_duration",
                "custody_shrinkage",
                "occupancy_mismatch",
                "request_latency",
                "scan_frequency",
            ]
        );
    }
}
