use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the reporting API service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable output
    #[serde(default = "default_true")]
    pub log_json: bool,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Warehouse database configuration
///
/// Either a full `url` or the individual connection parts may be supplied.
/// The parts mirror the `DB_HOST`/`DB_PORT`/`DB_NAME`/`DB_USER`/`DB_PASSWORD`
/// variables the loading scripts have always used.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; takes precedence over the parts below
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_name")]
    pub name: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection acquire timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Upper bound for a single store operation in seconds
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
    /// Delay before the single retry on a transient connectivity error
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// API configuration for the reporting endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Default `limit` for top-product reports
    #[serde(default = "default_report_limit")]
    pub default_report_limit: i64,
}

// Default value functions
fn default_service_name() -> String {
    "medgram-api".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_name() -> String {
    "medical_warehouse".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_statement_timeout_secs() -> u64 {
    30
}

fn default_retry_delay_ms() -> u64 {
    250
}

fn default_run_migrations() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

pub(crate) fn default_report_limit() -> i64 {
    10
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/api").required(false))
            .add_source(config::File::with_name("/etc/medgram/api").required(false))
            // MEDGRAM_API__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("MEDGRAM_API")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: Self = with_db_env_overrides(builder)?.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;

        if self.api.default_report_limit <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "api.default_report_limit".to_string(),
                message: "must be a positive integer".to_string(),
            });
        }

        Ok(())
    }
}

/// Apply the plain `DB_*` environment variables on top of a config builder.
///
/// These have the highest precedence so an operator can point any service at
/// a warehouse without knowing the prefixed variable names.
pub fn with_db_env_overrides(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
    let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

    Ok(builder
        .set_override_option("database.host", var("DB_HOST"))?
        .set_override_option("database.port", var("DB_PORT"))?
        .set_override_option("database.name", var("DB_NAME"))?
        .set_override_option("database.user", var("DB_USER"))?
        .set_override_option("database.password", var("DB_PASSWORD"))?)
}

impl DatabaseConfig {
    /// Connection options: the explicit URL when set, otherwise the parts.
    ///
    /// Parts are passed through unencoded, so credentials may hold any
    /// character.
    pub fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        if let Some(url) = &self.url {
            return url.parse();
        }

        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name);
        if let Some(user) = &self.user {
            options = options.username(user);
        }
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        Ok(options)
    }

    /// Validate pool and timeout settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_none() && self.host.is_empty() {
            return Err(ConfigError::MissingRequired(
                "database.url or database.host".to_string(),
            ));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                key: "database.max_connections".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue {
                key: "database.min_connections".to_string(),
                message: "cannot exceed max_connections".to_string(),
            });
        }

        if self.statement_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "database.statement_timeout_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    /// Get connection acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Get per-operation timeout as Duration
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }

    /// Get retry delay as Duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Longest one store operation can take: two attempts and the delay between them
    pub fn operation_budget(&self) -> Duration {
        self.statement_timeout() * 2 + self.retry_delay()
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_json: true,
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_db_host(),
            port: default_db_port(),
            name: default_db_name(),
            user: None,
            password: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            statement_timeout_secs: default_statement_timeout_secs(),
            retry_delay_ms: default_retry_delay_ms(),
            run_migrations: default_run_migrations(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            default_report_limit: default_report_limit(),
        }
    }
}
