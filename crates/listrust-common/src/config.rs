//! Configuration for ListRust

use crate::types::{DeliveryMode, SubscriptionPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Queue runner configuration
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Pending record lifetimes
    #[serde(default)]
    pub pending: PendingConfig,

    /// Named posting chains, in addition to the built-in ones
    #[serde(default)]
    pub chains: HashMap<String, ChainConfig>,

    /// Named delivery pipelines, in addition to the built-in ones
    #[serde(default)]
    pub pipelines: HashMap<String, PipelineConfig>,

    /// Mailing lists to create or update at startup
    #[serde(default)]
    pub lists: Vec<ListConfig>,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Seconds a runner waits for a free connection
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout_secs() -> u64 {
    30
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

/// Queue runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Sleep between polls of an empty queue, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum items claimed per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts before an item is moved to the error queue
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// First retry delay, in seconds; doubles on every attempt
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    /// Upper bound of the retry delay, in seconds
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    /// Number of runner slices per queue
    #[serde(default = "default_slices")]
    pub slices: u32,

    /// Jobs stuck in processing for longer than this are returned to their queue
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Queues this process serves
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            slices: default_slices(),
            stale_after_secs: default_stale_after_secs(),
            queues: default_queues(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    10
}

fn default_max_attempts() -> i32 {
    5
}

fn default_backoff_base_secs() -> u64 {
    60
}

fn default_backoff_max_secs() -> u64 {
    4 * 60 * 60
}

fn default_slices() -> u32 {
    1
}

fn default_stale_after_secs() -> u64 {
    15 * 60
}

fn default_queues() -> Vec<String> {
    vec!["in".to_string(), "pipeline".to_string(), "command".to_string()]
}

/// Pending record lifetimes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConfig {
    /// How long a subscriber has to answer a confirmation request
    #[serde(default = "default_confirmation_lifetime_days")]
    pub confirmation_lifetime_days: i64,

    /// How long a held item waits for a moderator. Moderator queues
    /// effectively never expire unless this is lowered.
    #[serde(default = "default_moderation_lifetime_days")]
    pub moderation_lifetime_days: i64,

    /// How often expired records are evicted, in seconds
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            confirmation_lifetime_days: default_confirmation_lifetime_days(),
            moderation_lifetime_days: default_moderation_lifetime_days(),
            eviction_interval_secs: default_eviction_interval_secs(),
        }
    }
}

impl PendingConfig {
    pub fn confirmation_lifetime(&self) -> chrono::Duration {
        chrono::Duration::days(self.confirmation_lifetime_days)
    }

    pub fn moderation_lifetime(&self) -> chrono::Duration {
        chrono::Duration::days(self.moderation_lifetime_days)
    }
}

fn default_confirmation_lifetime_days() -> i64 {
    3
}

fn default_moderation_lifetime_days() -> i64 {
    5000
}

fn default_eviction_interval_secs() -> u64 {
    3600
}

/// What a chain link does when its rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkActionConfig {
    Accept,
    Hold,
    Reject,
    Discard,
    /// Record the hit and keep evaluating
    Defer,
    /// Continue in the chain named by `chain`
    Jump,
}

/// One rule/action pair of a chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub rule: String,
    pub action: LinkActionConfig,
    #[serde(default)]
    pub chain: Option<String>,
}

/// A named, ordered chain of links
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default)]
    pub description: Option<String>,
    pub links: Vec<LinkConfig>,
}

/// A named, ordered list of delivery handlers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub description: Option<String>,
    pub handlers: Vec<String>,
}

/// A mailing list to bootstrap at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListConfig {
    /// Posting address
    pub address: String,

    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default)]
    pub subscription_policy: SubscriptionPolicy,

    #[serde(default)]
    pub unsubscription_policy: SubscriptionPolicy,

    #[serde(default = "default_posting_chain")]
    pub posting_chain: String,

    #[serde(default = "default_posting_pipeline")]
    pub posting_pipeline: String,

    #[serde(default = "default_true")]
    pub send_welcome_message: bool,

    #[serde(default = "default_true")]
    pub send_goodbye_message: bool,

    #[serde(default)]
    pub admin_notify_mchanges: bool,

    /// Banned addresses; entries starting with `^` are regular expressions
    #[serde(default)]
    pub ban_patterns: Vec<String>,

    /// Largest accepted post in KiB, 0 disables the check
    #[serde(default = "default_max_message_size_kb")]
    pub max_message_size_kb: i64,

    /// Most explicit recipients a post may carry, 0 disables the check
    #[serde(default = "default_max_num_recipients")]
    pub max_num_recipients: i64,

    #[serde(default)]
    pub default_delivery_mode: DeliveryMode,
}

fn default_posting_chain() -> String {
    "default-posting-chain".to_string()
}

fn default_posting_pipeline() -> String {
    "default-posting-pipeline".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_message_size_kb() -> i64 {
    40
}

fn default_max_num_recipients() -> i64 {
    10
}

impl Config {
    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file, with `LISTRUST__SECTION__KEY` environment overrides
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(
                ::config::Environment::with_prefix("LISTRUST")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))?;

        config.validate()?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            PathBuf::from("./listrust.toml"),
            PathBuf::from("/etc/listrust/listrust.toml"),
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

    /// Reject values the runners cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        if self.runner.max_attempts < 1 {
            return Err(crate::Error::Config(
                "runner.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.runner.batch_size == 0 {
            return Err(crate::Error::Config(
                "runner.batch_size must be at least 1".to_string(),
            ));
        }
        if self.runner.slices == 0 {
            return Err(crate::Error::Config(
                "runner.slices must be at least 1".to_string(),
            ));
        }
        if self.pending.confirmation_lifetime_days <= 0 || self.pending.moderation_lifetime_days <= 0 {
            return Err(crate::Error::Config(
                "pending lifetimes must be positive".to_string(),
            ));
        }
        for (name, chain) in &self.chains {
            for link in &chain.links {
                if link.action == LinkActionConfig::Jump && link.chain.is_none() {
                    return Err(crate::Error::Config(format!(
                        "chain {}: jump link on rule {} names no target chain",
                        name, link.rule
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            runner: RunnerConfig::default(),
            pending: PendingConfig::default(),
            chains: HashMap::new(),
            pipelines: HashMap::new(),
            lists: Vec::new(),
        }
    }
}
