//! Configuration for mailflow

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Default outbound SMTP relay
    #[serde(default)]
    pub smtp: SmtpRelayConfig,

    /// Queue and worker tuning
    #[serde(default)]
    pub queue: QueueConfig,

    /// Sliding-window rate limits
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Open/click tracking
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Webhook delivery defaults
    #[serde(default)]
    pub webhooks: WebhookConfig,

    /// At-rest encryption of webhook credentials
    pub encryption: EncryptionConfig,

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
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

/// Fallback SMTP relay used when no config row is marked active.
///
/// Operational SMTP configs live in the datastore; this block only seeds the
/// connection defaults for local development.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpRelayConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,

    #[serde(default = "default_smtp_port")]
    pub port: u16,

    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default)]
    pub use_tls: bool,

    #[serde(default = "default_use_starttls")]
    pub use_starttls: bool,

    /// Per-send timeout in seconds
    #[serde(default = "default_smtp_timeout")]
    pub timeout_secs: u64,
}

impl Default for SmtpRelayConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: None,
            password: None,
            use_tls: false,
            use_starttls: default_use_starttls(),
            timeout_secs: default_smtp_timeout(),
        }
    }
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_use_starttls() -> bool {
    true
}

fn default_smtp_timeout() -> u64 {
    30
}

/// Queue and worker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum in-flight email jobs
    #[serde(default = "default_email_concurrency")]
    pub email_concurrency: usize,

    /// Maximum in-flight webhook deliveries
    #[serde(default = "default_webhook_concurrency")]
    pub webhook_concurrency: usize,

    /// Seconds between claim cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Jobs claimed per cycle
    #[serde(default = "default_claim_batch")]
    pub claim_batch_size: i64,

    /// Active jobs whose heartbeat is older than this are requeued
    #[serde(default = "default_stalled_after")]
    pub stalled_after_secs: i64,

    /// Completed job records older than this are deleted
    #[serde(default = "default_completed_retention")]
    pub completed_retention_hours: i64,

    /// Failed job records older than this are deleted
    #[serde(default = "default_failed_retention")]
    pub failed_retention_days: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            email_concurrency: default_email_concurrency(),
            webhook_concurrency: default_webhook_concurrency(),
            poll_interval_secs: default_poll_interval(),
            claim_batch_size: default_claim_batch(),
            stalled_after_secs: default_stalled_after(),
            completed_retention_hours: default_completed_retention(),
            failed_retention_days: default_failed_retention(),
        }
    }
}

fn default_email_concurrency() -> usize {
    10
}

fn default_webhook_concurrency() -> usize {
    10
}

fn default_poll_interval() -> u64 {
    5
}

fn default_claim_batch() -> i64 {
    100
}

fn default_stalled_after() -> i64 {
    120
}

fn default_completed_retention() -> i64 {
    24
}

fn default_failed_retention() -> i64 {
    14
}

/// Sliding-window rate limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sends admitted per SMTP config per window
    #[serde(default = "default_smtp_limit")]
    pub smtp_limit: u32,

    /// SMTP window length in milliseconds
    #[serde(default = "default_smtp_window")]
    pub smtp_window_ms: u64,

    /// Webhook calls admitted per endpoint per window
    #[serde(default = "default_webhook_limit")]
    pub webhook_limit: u32,

    /// Webhook window length in milliseconds
    #[serde(default = "default_webhook_window")]
    pub webhook_window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            smtp_limit: default_smtp_limit(),
            smtp_window_ms: default_smtp_window(),
            webhook_limit: default_webhook_limit(),
            webhook_window_ms: default_webhook_window(),
        }
    }
}

fn default_smtp_limit() -> u32 {
    100
}

fn default_smtp_window() -> u64 {
    60_000
}

fn default_webhook_limit() -> u32 {
    60
}

fn default_webhook_window() -> u64 {
    60_000
}

/// Open/click tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Base URL the pixel and click redirects are served from
    #[serde(default = "default_tracking_base_url")]
    pub base_url: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            base_url: default_tracking_base_url(),
        }
    }
}

fn default_tracking_base_url() -> String {
    "http://localhost:8080/track".to_string()
}

/// Webhook delivery defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Timeout applied when a webhook has none configured
    #[serde(default = "default_webhook_timeout")]
    pub default_timeout_secs: u64,

    /// User-Agent header on outbound deliveries
    #[serde(default = "default_webhook_user_agent")]
    pub user_agent: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_webhook_timeout(),
            user_agent: default_webhook_user_agent(),
        }
    }
}

fn default_webhook_timeout() -> u64 {
    10
}

fn default_webhook_user_agent() -> String {
    "mailflow-webhooks/0.1".to_string()
}

/// At-rest encryption of webhook credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Base64-encoded 32-byte AES-256-GCM key
    pub key: String,
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
    "text".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            std::path::PathBuf::from("./mailflow.toml"),
            std::path::PathBuf::from("./config.toml"),
            std::path::PathBuf::from("/etc/mailflow/config.toml"),
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
    fn test_default_sections() {
        let queue = QueueConfig::default();
        assert_eq!(queue.email_concurrency, 10);
        assert_eq!(queue.poll_interval_secs, 5);

        let smtp = SmtpRelayConfig::default();
        assert_eq!(smtp.port, 25);
        assert!(smtp.use_starttls);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[database]
url = "postgres://localhost/mailflow"

[smtp]
host = "relay.example.com"
port = 587

[queue]
email_concurrency = 32

[rate_limit]
smtp_limit = 500

[encryption]
key = "c2VjcmV0LWtleS1zZWNyZXQta2V5LXNlY3JldC1rZQ=="
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.database.url, "postgres://localhost/mailflow");
        assert_eq!(config.smtp.host, "relay.example.com");
        assert_eq!(config.queue.email_concurrency, 32);
        assert_eq!(config.rate_limit.smtp_limit, 500);
        assert_eq!(config.rate_limit.webhook_limit, 60);
    }
}
