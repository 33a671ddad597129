use crate::error::{AttributionError, AttributionResult};
use serde::Deserialize;
use std::collections::HashMap;

/// Root application configuration. Loaded from environment variables
/// with the prefix `VIEWTHROUGH__` and TOML config files.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Bearer tokens in `token:tenant_id` form.
    #[serde(default)]
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    ClickHouse,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    #[serde(default = "default_clickhouse_url")]
    pub url: String,
    #[serde(default = "default_clickhouse_db")]
    pub database: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Parameters of the view probability model.
///
/// `base_rates` maps a lowercase platform name to its historical
/// view-to-conversion rate; platforms missing from the map fall back to
/// `default_base_rate`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    #[serde(default = "default_decay_days")]
    pub decay_days: f64,
    #[serde(default = "default_frequency_saturation")]
    pub frequency_saturation: f64,
    #[serde(default = "default_max_view_probability")]
    pub max_view_probability: f64,
    #[serde(default = "default_max_view_credit_share")]
    pub max_view_credit_share: f64,
    #[serde(default = "default_min_view_probability")]
    pub min_view_probability: f64,
    #[serde(default = "default_base_rate")]
    pub default_base_rate: f64,
    #[serde(default = "default_base_rates")]
    pub base_rates: HashMap<String, f64>,
    #[serde(default = "default_model_version")]
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    /// Hour of day (UTC) for the daily run. Must fall after the click model batch.
    #[serde(default = "default_run_at_hour_utc")]
    pub run_at_hour_utc: u32,
    #[serde(default = "default_window_days")]
    pub window_days: i64,
    #[serde(default = "default_upsert_batch_size")]
    pub upsert_batch_size: usize,
    #[serde(default = "default_max_concurrent_tenants")]
    pub max_concurrent_tenants: usize,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}
fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}
fn default_clickhouse_db() -> String {
    "viewthrough".to_string()
}

fn default_lookback_days() -> i64 {
    30
}
fn default_decay_days() -> f64 {
    14.0
}
fn default_frequency_saturation() -> f64 {
    10.0
}
fn default_max_view_probability() -> f64 {
    0.30
}
fn default_max_view_credit_share() -> f64 {
    0.30
}
fn default_min_view_probability() -> f64 {
    0.001
}
fn default_base_rate() -> f64 {
    0.05
}
fn default_base_rates() -> HashMap<String, f64> {
    HashMap::from([
        ("meta".to_string(), 0.15),
        ("tiktok".to_string(), 0.10),
        ("google".to_string(), 0.08),
    ])
}
fn default_model_version() -> String {
    "vt-1".to_string()
}

fn default_scheduler_enabled() -> bool {
    true
}
fn default_run_at_hour_utc() -> u32 {
    4
}
fn default_window_days() -> i64 {
    90
}
fn default_upsert_batch_size() -> usize {
    500
}
fn default_max_concurrent_tenants() -> usize {
    1
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            tokens: Vec::new(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: default_clickhouse_url(),
            database: default_clickhouse_db(),
            user: None,
            password: None,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            decay_days: default_decay_days(),
            frequency_saturation: default_frequency_saturation(),
            max_view_probability: default_max_view_probability(),
            max_view_credit_share: default_max_view_credit_share(),
            min_view_probability: default_min_view_probability(),
            default_base_rate: default_base_rate(),
            base_rates: default_base_rates(),
            version: default_model_version(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            run_at_hour_utc: default_run_at_hour_utc(),
            window_days: default_window_days(),
            upsert_batch_size: default_upsert_batch_size(),
            max_concurrent_tenants: default_max_concurrent_tenants(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            store: StoreConfig::default(),
            clickhouse: ClickHouseConfig::default(),
            model: ModelConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl ModelConfig {
    /// Historical view-to-conversion rate for a platform.
    pub fn base_rate(&self, platform: &str) -> f64 {
        self.base_rates
            .get(&platform.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default_base_rate)
    }
}

impl AppConfig {
    /// Load configuration from environment variables and optional config file.
    pub fn load() -> AttributionResult<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("viewthrough").required(false))
            .add_source(
                config::Environment::with_prefix("VIEWTHROUGH")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("api.tokens"),
            );

        Self::from_builder(builder)
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> AttributionResult<Self> {
        builder
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| AttributionError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_base_rates() {
        let model = ModelConfig::default();
        assert!((model.base_rate("meta") - 0.15).abs() < f64::EPSILON);
        assert!((model.base_rate("TikTok") - 0.10).abs() < f64::EPSILON);
        assert!((model.base_rate("google") - 0.08).abs() < f64::EPSILON);
        assert!((model.base_rate("pinterest") - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn test_injected_base_rates_override_defaults() {
        let model = ModelConfig {
            base_rates: HashMap::from([("meta".to_string(), 0.5)]),
            default_base_rate: 0.01,
            ..ModelConfig::default()
        };
        assert!((model.base_rate("meta") - 0.5).abs() < f64::EPSILON);
        assert!((model.base_rate("google") - 0.01).abs() < f64::EPSILON);
    }

    #[test]
    fn test_overrides_are_applied() {
        let builder = config::Config::builder()
            .set_override("api.http_port", 9090)
            .unwrap()
            .set_override("scheduler.window_days", 30)
            .unwrap();
        let config = AppConfig::from_builder(builder).unwrap();
        assert_eq!(config.api.http_port, 9090);
        assert_eq!(config.scheduler.window_days, 30);
        assert_eq!(config.model.lookback_days, 30);
    }

    #[test]
    fn test_malformed_value_is_config_error() {
        let builder = config::Config::builder()
            .set_override("api.http_port", "not-a-port")
            .unwrap();
        let err = AppConfig::from_builder(builder).unwrap_err();
        assert!(matches!(err, AttributionError::Config(_)));
        assert!(err.to_string().starts_with("Configuration error:"));
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_scheduler_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.window_days, 90);
        assert_eq!(config.scheduler.upsert_batch_size, 500);
        assert_eq!(config.scheduler.max_concurrent_tenants, 1);
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }
}
