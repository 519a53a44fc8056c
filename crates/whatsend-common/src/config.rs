//! Configuration for Whatsend

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// WhatsApp Cloud API configuration
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,

    /// Campaign dispatch tuning
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Scheduled campaign worker
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL
    pub url: String,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Seconds to wait for a free connection
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    30
}

/// WhatsApp Cloud API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    /// Graph API base URL
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Graph API version segment (e.g. "v19.0")
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Sending phone number id
    #[serde(default)]
    pub phone_number_id: String,

    /// WhatsApp Business Account id (owner of message templates)
    #[serde(default)]
    pub business_account_id: String,

    /// Permanent or system-user access token
    #[serde(default)]
    pub access_token: String,

    /// App secret used to verify webhook signatures
    pub app_secret: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            api_version: default_api_version(),
            phone_number_id: String::new(),
            business_account_id: String::new(),
            access_token: String::new(),
            app_secret: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_api_base_url() -> String {
    "https://graph.facebook.com".to_string()
}

fn default_api_version() -> String {
    "v19.0".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

/// Campaign dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Messages sent concurrently per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Long-run average send rate ceiling
    #[serde(default = "default_messages_per_second")]
    pub messages_per_second: f64,

    /// Retries per message after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Linear backoff step in milliseconds (attempt n waits n * step)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound on a single provider call in seconds
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// Capacity of the dispatch event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            messages_per_second: default_messages_per_second(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            send_timeout_secs: default_send_timeout(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl DispatchConfig {
    /// Check the values can drive a dispatch loop
    pub fn validate(&self) -> crate::Result<()> {
        if self.batch_size == 0 {
            return Err(crate::Error::Config(
                "dispatch.batch_size must be at least 1".to_string(),
            ));
        }
        if !(self.messages_per_second.is_finite() && self.messages_per_second > 0.0) {
            return Err(crate::Error::Config(format!(
                "dispatch.messages_per_second must be positive, got {}",
                self.messages_per_second
            )));
        }
        if self.event_capacity == 0 {
            return Err(crate::Error::Config(
                "dispatch.event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

fn default_batch_size() -> usize {
    10
}

fn default_messages_per_second() -> f64 {
    1.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

fn default_send_timeout() -> u64 {
    30
}

fn default_event_capacity() -> usize {
    256
}

/// Scheduled campaign worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Enable the worker
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,

    /// Seconds between polls for due campaigns
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Resume campaigns left in `sending` when the process starts
    #[serde(default = "default_resume_interrupted")]
    pub resume_interrupted: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            poll_interval_secs: default_poll_interval(),
            resume_interrupted: default_resume_interrupted(),
        }
    }
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    15
}

fn default_resume_interrupted() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Environment variable prefix for overrides, e.g. `WHATSEND__WHATSAPP__ACCESS_TOKEN`
const ENV_PREFIX: &str = "WHATSEND";

impl Config {
    /// Load configuration from a TOML file with environment overrides
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Toml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| crate::Error::Config(format!("Failed to load {}: {}", path.display(), e)))?;

        config.dispatch.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text (no environment overrides)
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.dispatch.validate()?;
        Ok(config)
    }

    /// Load configuration from the first default location that exists
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var("WHATSEND_CONFIG") {
            return Self::from_file(&PathBuf::from(path));
        }

        let paths = [
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/whatsend/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_dispatch_config() {
        let dispatch = DispatchConfig::default();
        assert_eq!(dispatch.batch_size, 10);
        assert_eq!(dispatch.messages_per_second, 1.0);
        assert_eq!(dispatch.max_retries, 3);
        assert_eq!(dispatch.retry_backoff(), Duration::from_millis(2000));
        assert!(dispatch.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[database]
url = "postgres://localhost/whatsend"

[whatsapp]
phone_number_id = "1234567890"
business_account_id = "998877"
access_token = "token"

[dispatch]
batch_size = 25
messages_per_second = 20.0
"#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.database.url, "postgres://localhost/whatsend");
        assert_eq!(config.database.max_connections, 20);
        assert_eq!(config.database.acquire_timeout_secs, 30);
        assert_eq!(config.whatsapp.phone_number_id, "1234567890");
        assert_eq!(config.whatsapp.api_version, "v19.0");
        assert_eq!(config.dispatch.batch_size, 25);
        assert_eq!(config.dispatch.max_retries, 3);
        assert!(config.scheduler.enabled);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let toml = r#"
[database]
url = "postgres://localhost/whatsend"

[dispatch]
batch_size = 0
"#;

        let err = Config::from_toml(toml).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_rejects_non_positive_rate() {
        let dispatch = DispatchConfig {
            messages_per_second: 0.0,
            ..DispatchConfig::default()
        };
        assert!(dispatch.validate().is_err());
    }
}
