//! Configuration for relayd
//!
//! The configuration is loaded and validated once at startup; every
//! component receives it as a read-only value.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// SMTP listener configuration
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Job database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Spool configuration for in-flight message artifacts
    #[serde(default)]
    pub spool: SpoolConfig,

    /// Delivery queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// TLS configuration; absent means STARTTLS is not offered
    pub tls: Option<TlsConfig>,

    /// Authorized sending domains
    #[serde(default)]
    pub domains: Vec<DomainConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname announced in the banner and EHLO greeting
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            bind_address: default_bind_address(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

/// SMTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Submission port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum accepted message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum concurrent client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Time budget for a single MX connect/verify/send attempt, in seconds
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_message_size: default_max_message_size(),
            max_connections: default_max_connections(),
            delivery_timeout_secs: default_delivery_timeout_secs(),
        }
    }
}

fn default_port() -> u16 {
    587
}

fn default_max_message_size() -> usize {
    16 * 1024 * 1024
}

fn default_max_connections() -> usize {
    100
}

fn default_delivery_timeout_secs() -> u64 {
    30
}

/// Job database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database URL
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://relayd.db?mode=rwc".to_string()
}

/// Spool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolConfig {
    /// Directory holding message and attachment temp files
    #[serde(default = "default_spool_path")]
    pub path: PathBuf,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            path: default_spool_path(),
        }
    }
}

fn default_spool_path() -> PathBuf {
    std::env::temp_dir().join("relayd-spool")
}

/// Delivery queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Redelivery attempts before a job is parked as failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// Seconds between polls for due jobs
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Base delay before a failed job is redelivered, scaled by the
    /// attempts already made
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Maximum jobs executing concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            poll_interval_secs: default_poll_interval_secs(),
            retry_delay_secs: default_retry_delay_secs(),
            workers: default_workers(),
        }
    }
}

fn default_retry_delay_secs() -> u64 {
    30
}

fn default_max_attempts() -> i32 {
    5
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_workers() -> usize {
    8
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Require STARTTLS before AUTH is accepted
    #[serde(default)]
    pub forced: bool,

    /// PEM certificate chain path
    pub cert_path: PathBuf,

    /// PEM private key path
    pub key_path: PathBuf,
}

/// Per-domain authorization entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Domain name
    pub domain: String,

    /// DKIM signing settings for this domain
    #[serde(default)]
    pub dkim: DkimConfig,

    /// Users allowed to submit as this domain
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

/// DKIM settings for a domain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DkimConfig {
    /// Whether outbound mail for this domain is signed
    #[serde(default)]
    pub enabled: bool,

    /// DKIM selector
    pub selector: Option<String>,

    /// Path to the PEM-encoded RSA private key
    pub key_path: Option<PathBuf>,
}

/// A known submitting user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// Full email address used as the AUTH username
    pub email: String,

    /// Display name used in the formatted From header
    pub name: String,

    /// Password compared verbatim against the AUTH credential
    pub password: String,
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        let paths = [
            PathBuf::from("./relayd.toml"),
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/relayd/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(Error::Config("No configuration file found".to_string()))
    }

    /// Validate cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        if self.server.hostname.is_empty() {
            return Err(Error::Config("hostname must not be empty".to_string()));
        }

        if self.smtp.max_message_size == 0 {
            return Err(Error::Config(
                "smtp.max_message_size must be non-zero".to_string(),
            ));
        }

        for domain in &self.domains {
            if domain.domain.is_empty() {
                return Err(Error::Config("domain name must not be empty".to_string()));
            }

            if domain.dkim.enabled {
                if domain.dkim.selector.is_none() {
                    return Err(Error::Config(format!(
                        "domain {}: dkim.selector is required when dkim is enabled",
                        domain.domain
                    )));
                }
                if domain.dkim.key_path.is_none() {
                    return Err(Error::Config(format!(
                        "domain {}: dkim.key_path is required when dkim is enabled",
                        domain.domain
                    )));
                }
            }

            for user in &domain.users {
                if crate::types::EmailAddress::parse(&user.email).is_none() {
                    return Err(Error::Config(format!(
                        "domain {}: invalid user email {}",
                        domain.domain, user.email
                    )));
                }
            }
        }

        Ok(())
    }

    /// Look up the authorization entry for a domain
    pub fn domain(&self, name: &str) -> Option<&DomainConfig> {
        self.domains.iter().find(|d| d.domain == name)
    }
}
