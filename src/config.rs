//! Configuration parsing and validation for ccrelay.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::pricing::{PricingRow, PricingTable};

/// Environment variable overriding `relay.http_client_timeout_secs`.
pub const ENV_HTTP_CLIENT_TIMEOUT: &str = "CCRELAY_HTTP_CLIENT_TIMEOUT";
/// Environment variable overriding `health.log_retention_months`.
pub const ENV_LOG_RETENTION_MONTHS: &str = "CCRELAY_LOG_RETENTION_MONTHS";

/// Root configuration structure. Every section is optional.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Requests per second each client IP may send to `/v1/messages`.
    /// 0 disables the limit.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_second: u32,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_rate_limit() -> u32 {
    20
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            rate_limit_per_second: default_rate_limit(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file. May contain `${VAR}` references.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "./ccrelay.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Outbound relay behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_http_timeout")]
    pub http_client_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Foreign model used when no mapping pair matches.
    #[serde(default = "default_foreign_model")]
    pub default_foreign_model: String,
    /// Base URL for native accounts without a `request_url`.
    #[serde(default = "default_native_base_url")]
    pub native_base_url: String,
    #[serde(default = "default_anthropic_version")]
    pub anthropic_version: String,
    /// Finished requests waiting for accounting. Overflow is dropped.
    #[serde(default = "default_bookkeeping_queue")]
    pub bookkeeping_queue_capacity: usize,
}

fn default_http_timeout() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_foreign_model() -> String {
    "gpt-4o".to_string()
}

fn default_native_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_anthropic_version() -> String {
    "2023-06-01".to_string()
}

fn default_bookkeeping_queue() -> usize {
    4096
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            http_client_timeout_secs: default_http_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            default_foreign_model: default_foreign_model(),
            native_base_url: default_native_base_url(),
            anthropic_version: default_anthropic_version(),
            bookkeeping_queue_capacity: default_bookkeeping_queue(),
        }
    }
}

impl RelayConfig {
    pub fn http_client_timeout(&self) -> Duration {
        Duration::from_secs(self.http_client_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Background job cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Interval between probes of accounts in upstream-error state.
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Model sent in the synthetic probe request.
    #[serde(default = "default_probe_model")]
    pub probe_model: String,
    #[serde(default = "default_rate_limit_check_interval")]
    pub rate_limit_check_interval_secs: u64,
    #[serde(default = "default_log_retention_months")]
    pub log_retention_months: u32,
    /// Set to false to run without any background jobs.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_probe_interval() -> u64 {
    30 * 60
}

fn default_probe_timeout() -> u64 {
    30
}

fn default_probe_model() -> String {
    "claude-3-5-haiku-20241022".to_string()
}

fn default_rate_limit_check_interval() -> u64 {
    60
}

fn default_log_retention_months() -> u32 {
    3
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
            probe_model: default_probe_model(),
            rate_limit_check_interval_secs: default_rate_limit_check_interval(),
            log_retention_months: default_log_retention_months(),
            enabled: true,
        }
    }
}

impl HealthConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn rate_limit_check_interval(&self) -> Duration {
        Duration::from_secs(self.rate_limit_check_interval_secs)
    }
}

/// Pricing overrides layered over the built-in table.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PricingConfig {
    /// Replaces the fallback row used for unknown models.
    pub default: Option<PricingRow>,
    #[serde(default)]
    pub models: HashMap<String, PricingRow>,
}

impl PricingConfig {
    /// Built-in table with configured rows added or replaced.
    pub fn table(&self) -> PricingTable {
        let builtin = PricingTable::builtin();
        let mut models: HashMap<String, PricingRow> = builtin
            .models()
            .into_iter()
            .map(|(name, row)| (name.to_string(), row))
            .collect();
        for (name, row) in &self.models {
            models.insert(name.clone(), *row);
        }
        let default = self.default.unwrap_or_else(|| builtin.default_row());
        PricingTable::new(models, default)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to persist request logs to the database
    #[serde(default = "default_true")]
    pub log_requests: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_requests: true,
        }
    }
}

/// Upstream credential wrapper that redacts in Debug/Display/Serialize and
/// zeroizes on drop.
///
/// The raw value is only reachable through `.expose_secret()`, so every use
/// is grep-auditable.
#[derive(Clone)]
pub struct Credential(SecretString);

impl Credential {
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for Credential {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for Credential {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| Credential(SecretString::from(s)))
    }
}

impl From<String> for Credential {
    fn from(s: String) -> Self {
        Credential(SecretString::from(s))
    }
}

impl From<&str> for Credential {
    fn from(s: &str) -> Self {
        Credential(SecretString::from(s))
    }
}

impl Config {
    /// Load configuration from a TOML file, applying environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_with_env(&content, |name| std::env::var(name).ok())
    }

    /// Parse configuration from a TOML string without consulting the environment.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse, then expand `${VAR}` references and apply overrides through `lookup`.
    ///
    /// The lookup closure keeps tests independent of the process environment.
    pub fn parse_with_env<F>(content: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.apply_env_with(lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.database.path = expand_env_vars_with(&self.database.path, "database.path", &lookup)?;
        self.relay.native_base_url =
            expand_env_vars_with(&self.relay.native_base_url, "relay.native_base_url", &lookup)?;

        if let Some(raw) = lookup(ENV_HTTP_CLIENT_TIMEOUT) {
            self.relay.http_client_timeout_secs = parse_override(ENV_HTTP_CLIENT_TIMEOUT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_LOG_RETENTION_MONTHS) {
            self.health.log_retention_months = parse_override(ENV_LOG_RETENTION_MONTHS, &raw)?;
        }
        Ok(())
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.http_client_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "relay.http_client_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.relay.bookkeeping_queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "relay.bookkeeping_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.health.probe_interval_secs == 0 || self.health.rate_limit_check_interval_secs == 0
        {
            return Err(ConfigError::Validation(
                "health job intervals must be greater than 0".to_string(),
            ));
        }
        if self.health.log_retention_months == 0 {
            return Err(ConfigError::Validation(
                "health.log_retention_months must be at least 1".to_string(),
            ));
        }
        if self.relay.default_foreign_model.trim().is_empty() {
            return Err(ConfigError::Validation(
                "relay.default_foreign_model must not be empty".to_string(),
            ));
        }

        for (name, row) in &self.pricing.models {
            if [row.input, row.output, row.cache_write, row.cache_read]
                .iter()
                .any(|rate| *rate < 0.0)
            {
                return Err(ConfigError::Validation(format!(
                    "Pricing for '{}' has a negative rate",
                    name
                )));
            }
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not usable for '{field}': {message}")]
    EnvVar {
        var: String,
        field: String,
        message: String,
    },
}

fn parse_override<T: std::str::FromStr>(var: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::EnvVar {
        var: var.to_string(),
        field: var.to_string(),
        message: format!("'{}' is not a valid number", raw),
    })
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Fails on the first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, field: &str, lookup: &F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            field: field.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                field: field.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            field: field.to_string(),
            message: format!("Environment variable '{}' is not set", var_name),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}
