use config::{Config, ConfigError, Environment, File};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;

static CURRENCY_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[A-Za-z]{3}$").expect("valid currency pattern"));

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Default currency code for new orders
    #[serde(default = "default_currency")]
    pub default_currency: String,

    /// Currencies payments may be made in
    #[serde(default = "default_supported_currencies")]
    pub supported_currencies: Vec<String>,

    /// Default tax rate (as decimal, e.g., 0.08 for 8%)
    // The primitive is path-qualified so the validator derive passes the
    // field by reference to the custom validator; the bare spelling would
    // be passed by value and not match `validate_tax_rate(&f64)`.
    #[serde(default = "default_tax_rate")]
    #[validate(custom = "validate_tax_rate")]
    pub default_tax_rate: core::primitive::f64,

    /// Upper bound for a single cart line quantity
    #[serde(default = "default_cart_item_max_quantity")]
    #[validate(range(min = 1))]
    pub cart_item_max_quantity: i32,

    /// Days until an untouched cart expires (consumed by an external cleaner)
    #[serde(default = "default_cart_ttl_days")]
    #[validate(range(min = 1))]
    pub cart_ttl_days: i64,

    /// Oldest an order may be and still accept a new payment (hours)
    #[serde(default = "default_payment_order_max_age_hours")]
    #[validate(range(min = 1))]
    pub payment_order_max_age_hours: i64,

    /// How long after creation a payment may still execute (minutes)
    #[serde(default = "default_payment_execution_window_minutes")]
    #[validate(range(min = 1))]
    pub payment_execution_window_minutes: i64,

    /// Days after payment during which refunds are accepted
    #[serde(default = "default_refund_window_days")]
    #[validate(range(min = 1))]
    pub refund_window_days: i64,

    /// Webhook secret for verifying payment gateway callbacks
    #[serde(default)]
    pub webhook_secret: Option<String>,

    /// Webhook timestamp tolerance (seconds)
    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: u64,

    /// Event channel capacity for async event processing
    // Path-qualified for the same validator-derive reason as
    // `default_tax_rate` above.
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: core::primitive::usize,
}

impl AppConfig {
    /// Gets database URL reference
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Creates a configuration from a database URL and environment, with
    /// defaults everywhere else. Primarily for tests and embedding.
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            default_currency: default_currency(),
            supported_currencies: default_supported_currencies(),
            default_tax_rate: default_tax_rate(),
            cart_item_max_quantity: default_cart_item_max_quantity(),
            cart_ttl_days: default_cart_ttl_days(),
            payment_order_max_age_hours: default_payment_order_max_age_hours(),
            payment_execution_window_minutes: default_payment_execution_window_minutes(),
            refund_window_days: default_refund_window_days(),
            webhook_secret: None,
            webhook_tolerance_secs: default_webhook_tolerance_secs(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Tax rate as a `Decimal` for money math.
    pub fn tax_rate(&self) -> Decimal {
        Decimal::from_f64_retain(self.default_tax_rate).unwrap_or_default()
    }

    pub fn is_supported_currency(&self, code: &str) -> bool {
        self.supported_currencies
            .iter()
            .any(|c| c.eq_ignore_ascii_case(code))
    }

    pub fn cart_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.cart_ttl_days)
    }

    pub fn payment_order_max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.payment_order_max_age_hours)
    }

    pub fn payment_execution_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.payment_execution_window_minutes)
    }

    pub fn refund_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.refund_window_days)
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.supported_currencies.is_empty() {
            let mut err = ValidationError::new("supported_currencies_empty");
            err.message = Some("At least one supported currency must be configured".into());
            errors.add("supported_currencies", err);
        }

        if self
            .supported_currencies
            .iter()
            .any(|c| !CURRENCY_CODE.is_match(c))
        {
            let mut err = ValidationError::new("supported_currencies_format");
            err.message = Some("Currency codes must be 3-letter ISO codes".into());
            errors.add("supported_currencies", err);
        }

        if !self.is_supported_currency(&self.default_currency) {
            let mut err = ValidationError::new("default_currency_unsupported");
            err.message =
                Some("default_currency must be included in supported_currencies".into());
            errors.add("default_currency", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_supported_currencies() -> Vec<String> {
    vec!["USD".to_string(), "EUR".to_string(), "GBP".to_string()]
}

fn default_tax_rate() -> f64 {
    0.0
}

fn default_cart_item_max_quantity() -> i32 {
    99
}

fn default_cart_ttl_days() -> i64 {
    30
}

fn default_payment_order_max_age_hours() -> i64 {
    24
}

fn default_payment_execution_window_minutes() -> i64 {
    60
}

fn default_refund_window_days() -> i64 {
    90
}

fn default_webhook_tolerance_secs() -> u64 {
    DEFAULT_WEBHOOK_TOLERANCE_SECS
}

fn default_event_channel_capacity() -> usize {
    1024
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_tax_rate(rate: &f64) -> Result<(), ValidationError> {
    if !rate.is_finite() || *rate < 0.0 || *rate > 1.0 {
        let mut err = ValidationError::new("default_tax_rate");
        err.message = Some("default_tax_rate must be a finite value between 0.0 and 1.0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_event_channel_capacity(capacity: &usize) -> Result<(), ValidationError> {
    if *capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default_directive = format!("storefront_core={}", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive.clone());

    // Optional OpenTelemetry initialization via env (APP__OTEL_ENABLED or OTEL_EXPORTER_OTLP_ENDPOINT)
    let otel_enabled = env::var("APP__OTEL_ENABLED")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
        || env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok();

    if otel_enabled {
        use opentelemetry::KeyValue;
        use opentelemetry_otlp::WithExportConfig;
        use opentelemetry_sdk::{trace as sdktrace, Resource};

        let endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .unwrap_or_else(|_| "http://localhost:4317".to_string());
        let service_name =
            env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "storefront-core".to_string());

        let resource = Resource::new(vec![KeyValue::new("service.name", service_name)]);
        let tracer = match opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .with_trace_config(sdktrace::config().with_resource(resource))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
        {
            Ok(tracer) => tracer,
            Err(err) => {
                error!("Failed to install OTLP pipeline: {}", err);
                if json {
                    let _ = fmt().with_env_filter(filter_directive).json().try_init();
                } else {
                    let _ = fmt().with_env_filter(filter_directive).try_init();
                }
                return;
            }
        };

        let base = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .with(EnvFilter::new(filter_directive.clone()));

        if json {
            let _ = base.with(fmt::layer().json()).try_init();
        } else {
            let _ = base.with(fmt::layer()).try_init();
        }
    } else if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
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
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;
    app_config.validate()?;
    app_config.validate_additional_constraints()?;

    Ok(app_config)
}

#[cfg(test)]
mod config_validation_tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig::new("sqlite::memory:".into(), "testing".into())
    }

    #[test]
    fn defaults_pass_validation() {
        let config = base_config();
        config.validate().expect("derive validation");
        config
            .validate_additional_constraints()
            .expect("constraint validation");
    }

    #[test]
    fn rejects_empty_currency_list() {
        let mut config = base_config();
        config.supported_currencies.clear();
        assert!(config.validate_additional_constraints().is_err());
    }

    #[test]
    fn rejects_default_currency_outside_supported_set() {
        let mut config = base_config();
        config.default_currency = "JPY".into();
        assert!(config.validate_additional_constraints().is_err());
    }

    #[test]
    fn rejects_malformed_currency_codes() {
        let mut config = base_config();
        config.supported_currencies = vec!["US".into(), "USD".into()];
        assert!(config.validate_additional_constraints().is_err());
    }

    #[test]
    fn currency_check_is_case_insensitive() {
        let config = base_config();
        assert!(config.is_supported_currency("usd"));
        assert!(config.is_supported_currency("USD"));
        assert!(!config.is_supported_currency("JPY"));
    }

    #[test]
    fn tax_rate_must_be_a_sane_fraction() {
        assert!(validate_tax_rate(&0.08).is_ok());
        assert!(validate_tax_rate(&0.0).is_ok());
        assert!(validate_tax_rate(&1.5).is_err());
        assert!(validate_tax_rate(&-0.1).is_err());
        assert!(validate_tax_rate(&f64::NAN).is_err());
    }

    #[test]
    fn log_level_must_be_known() {
        assert!(validate_log_level("info").is_ok());
        assert!(validate_log_level("WARN").is_ok());
        assert!(validate_log_level("verbose").is_err());
    }
}
