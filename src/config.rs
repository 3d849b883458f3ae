use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_DATABASE_URL: &str = "sqlite://autoshop.db?mode=rwc";

/// Business knobs consulted by the engines.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct BusinessRules {
    /// Multiplier applied to a sale subtotal when an invoice is required
    #[serde(default = "default_iva_factor")]
    #[validate(custom = "validate_iva_factor")]
    pub iva_factor: Decimal,

    /// Days without movements before a part is flagged NO_MOVEMENT
    #[serde(default = "default_no_movement_days")]
    #[validate(range(min = 1, max = 3650))]
    pub no_movement_days: i64,

    /// Stock at or below `min × factor` raises a LOW alert
    #[serde(default = "default_low_stock_factor")]
    #[validate(custom = "validate_low_stock_factor")]
    pub low_stock_factor: Decimal,

    /// Absolute cash difference at which a close raises a CRITICAL alert
    #[serde(default = "default_cash_difference_critical")]
    #[validate(custom = "validate_non_negative")]
    pub cash_difference_critical: Decimal,

    #[serde(default = "default_long_shift_warning_hours")]
    #[validate(range(min = 1))]
    pub long_shift_warning_hours: i64,

    #[serde(default = "default_long_shift_critical_hours")]
    #[validate(range(min = 1))]
    pub long_shift_critical_hours: i64,
}

impl Default for BusinessRules {
    fn default() -> Self {
        Self {
            iva_factor: default_iva_factor(),
            no_movement_days: default_no_movement_days(),
            low_stock_factor: default_low_stock_factor(),
            cash_difference_critical: default_cash_difference_critical(),
            long_shift_warning_hours: default_long_shift_warning_hours(),
            long_shift_critical_hours: default_long_shift_critical_hours(),
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
    #[validate(range(min = 1))]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB connect timeout (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    /// DB idle timeout (seconds)
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    /// DB acquire timeout (seconds)
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Capacity of the domain event channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    #[serde(default)]
    #[validate]
    pub business: BusinessRules,
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

impl AppConfig {
    /// Builds a configuration with defaults for everything except the store.
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
            event_channel_capacity: default_event_channel_capacity(),
            business: BusinessRules::default(),
        }
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn business(&self) -> &BusinessRules {
        &self.business
    }

    fn validate_additional_constraints(&self) -> Result<(), validator::ValidationErrors> {
        let mut errors = validator::ValidationErrors::new();

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_min_connections");
            err.message = Some("db_min_connections cannot exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if self.business.long_shift_critical_hours < self.business.long_shift_warning_hours {
            let mut err = ValidationError::new("long_shift_critical_hours");
            err.message =
                Some("long_shift_critical_hours cannot be below long_shift_warning_hours".into());
            errors.add("business", err);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    30
}
fn default_event_channel_capacity() -> usize {
    1024
}
fn default_iva_factor() -> Decimal {
    dec!(1.16)
}
fn default_no_movement_days() -> i64 {
    90
}
fn default_low_stock_factor() -> Decimal {
    dec!(1.2)
}
fn default_cash_difference_critical() -> Decimal {
    dec!(50.00)
}
fn default_long_shift_warning_hours() -> i64 {
    12
}
fn default_long_shift_critical_hours() -> i64 {
    24
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

fn validate_iva_factor(factor: &Decimal) -> Result<(), ValidationError> {
    if *factor < Decimal::ONE || *factor > dec!(2) {
        let mut err = ValidationError::new("iva_factor");
        err.message = Some("iva_factor must be between 1.0 and 2.0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_low_stock_factor(factor: &Decimal) -> Result<(), ValidationError> {
    if *factor < Decimal::ONE {
        let mut err = ValidationError::new("low_stock_factor");
        err.message = Some("low_stock_factor must be at least 1.0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_non_negative(value: &Decimal) -> Result<(), ValidationError> {
    if value.is_sign_negative() {
        let mut err = ValidationError::new("non_negative");
        err.message = Some("value cannot be negative".into());
        return Err(err);
    }
    Ok(())
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("autoshop_api={},sea_orm=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
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
        .set_default("database_url", DEFAULT_DATABASE_URL)?
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
        error!("Configuration constraint validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig::new("sqlite::memory:".into(), "development".into())
    }

    #[test]
    fn business_rules_defaults() {
        let rules = BusinessRules::default();
        assert_eq!(rules.iva_factor, dec!(1.16));
        assert_eq!(rules.no_movement_days, 90);
        assert_eq!(rules.low_stock_factor, dec!(1.2));
        assert_eq!(rules.cash_difference_critical, dec!(50));
        assert_eq!(rules.long_shift_warning_hours, 12);
        assert_eq!(rules.long_shift_critical_hours, 24);
    }

    #[test]
    fn default_config_validates() {
        let cfg = base_config();
        assert!(cfg.validate().is_ok());
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut cfg = base_config();
        cfg.log_level = "verbose".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_iva_factor_below_one() {
        let mut cfg = base_config();
        cfg.business.iva_factor = dec!(0.16);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_pool_bounds() {
        let mut cfg = base_config();
        cfg.db_min_connections = 20;
        cfg.db_max_connections = 5;
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn rejects_critical_shift_threshold_below_warning() {
        let mut cfg = base_config();
        cfg.business.long_shift_critical_hours = 6;
        assert!(cfg.validate_additional_constraints().is_err());
    }
}
