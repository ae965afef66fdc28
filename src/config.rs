use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use shellexpand;
use std::path::{Path, PathBuf};

/// Main configuration structure for tubesentry
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// Channel rules, processed in order
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    /// Daily API budget
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Public channel feed polling
    #[serde(default)]
    pub feed: FeedConfig,

    /// YouTube Data API access
    #[serde(default)]
    pub api: ApiConfig,

    /// Synchronization behavior settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Playlist retention policies
    #[serde(default)]
    pub cleanup: Vec<RetentionPolicy>,

    /// Ledger location
    #[serde(default)]
    pub storage: StorageConfig,

    /// Credential source
    #[serde(default)]
    pub auth: AuthConfig,

    /// Alert delivery
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One channel rule as written in the config file.
///
/// Validation into a [`crate::rules::ChannelRule`] happens per rule, so one
/// broken entry never prevents the others from loading.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ChannelConfig {
    pub channel_id: String,

    #[serde(default)]
    pub channel_name: String,

    pub playlist_id: String,

    #[serde(default)]
    pub playlist_name: Option<String>,

    /// Case-insensitive regular expression searched anywhere in the title
    #[serde(default)]
    pub title_pattern: Option<String>,

    /// Minimum duration in seconds (inclusive)
    #[serde(default)]
    pub min_duration: u64,

    /// Maximum duration in seconds (inclusive), unbounded when absent
    #[serde(default)]
    pub max_duration: Option<u64>,

    /// Only uploads newer than this many hours are considered
    #[serde(default = "default_hours_limit")]
    pub hours_limit: u32,
}

/// Daily quota configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QuotaConfig {
    #[serde(default = "default_daily_budget")]
    pub daily_budget: u64,

    /// Fraction of the budget that triggers a one-time warning
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f64,
}

/// Feed polling configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FeedConfig {
    #[serde(default = "default_feed_base_url")]
    pub base_url: String,

    /// How long a parsed feed is served without refetching
    #[serde(default = "default_feed_cache_ttl")]
    pub cache_ttl: String, // "60m"

    /// Request timeout in seconds
    #[serde(default = "default_feed_timeout")]
    pub timeout: u64,

    /// List uploads through the costed search API when the feed is unavailable
    #[serde(default)]
    pub remote_fallback: bool,

    /// Result cap for the remote fallback listing
    #[serde(default = "default_remote_max_results")]
    pub remote_max_results: u32,
}

/// YouTube Data API configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_api_timeout")]
    pub timeout: u64,

    /// Attempts per operation, counting the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Age after which another run's claim on a video may be taken over
    #[serde(default = "default_claim_stale_after")]
    pub claim_stale_after: String, // "30m"

    /// TTL for run-scoped detail and membership lookups
    #[serde(default = "default_memory_cache_ttl")]
    pub memory_cache_ttl: String, // "30m"
}

/// Remove playlist entries older than `max_age_days`
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RetentionPolicy {
    pub playlist_id: String,

    #[serde(default)]
    pub playlist_name: Option<String>,

    pub max_age_days: u32,
}

/// Longest accepted retention, a century
pub const MAX_RETENTION_DAYS: u32 = 365 * 100;

impl RetentionPolicy {
    /// Items published before this instant have expired.
    /// Saturates at the earliest representable instant.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(Duration::days(i64::from(self.max_age_days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Ledger storage configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

/// Credential configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuthConfig {
    /// Authentication method
    #[serde(default = "default_auth_method")]
    pub method: String, // "token_file", "env"

    /// OAuth token JSON written by the consent flow
    #[serde(default = "default_token_file")]
    pub token_file: String,

    /// Environment variable holding a raw access token (method "env")
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

/// Notification configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NotificationConfig {
    #[serde(default)]
    pub telegram_token: Option<String>,

    #[serde(default)]
    pub telegram_chat_id: Option<String>,

    #[serde(default = "default_telegram_api_url")]
    pub telegram_api_url: String,

    /// Send the run summary at info level after every run
    #[serde(default)]
    pub send_summary: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "json"
}

// Default value functions
fn default_hours_limit() -> u32 {
    8
}
fn default_daily_budget() -> u64 {
    10_000
}
fn default_warning_ratio() -> f64 {
    0.9
}
fn default_feed_base_url() -> String {
    "https://www.youtube.com/feeds/videos.xml".to_string()
}
fn default_feed_cache_ttl() -> String {
    "60m".to_string()
}
fn default_feed_timeout() -> u64 {
    15
}
fn default_remote_max_results() -> u32 {
    10
}
fn default_api_base_url() -> String {
    "https://www.googleapis.com/youtube/v3".to_string()
}
fn default_api_timeout() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    8_000
}
fn default_claim_stale_after() -> String {
    "30m".to_string()
}
fn default_memory_cache_ttl() -> String {
    "30m".to_string()
}
fn default_database_path() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/tubesentry/ledger.db", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/tubesentry/ledger.db", home)
    } else {
        "/tmp/tubesentry-ledger.db".to_string()
    }
}
fn default_auth_method() -> String {
    "token_file".to_string()
}
fn default_token_file() -> String {
    "~/.config/tubesentry/token.json".to_string()
}
fn default_token_env() -> String {
    "YOUTUBE_ACCESS_TOKEN".to_string()
}
fn default_telegram_api_url() -> String {
    "https://api.telegram.org".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

// Default implementations
impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_budget: default_daily_budget(),
            warning_ratio: default_warning_ratio(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: default_feed_base_url(),
            cache_ttl: default_feed_cache_ttl(),
            timeout: default_feed_timeout(),
            remote_fallback: false,
            remote_max_results: default_remote_max_results(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            timeout: default_api_timeout(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            claim_stale_after: default_claim_stale_after(),
            memory_cache_ttl: default_memory_cache_ttl(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            method: default_auth_method(),
            token_file: default_token_file(),
            token_env: default_token_env(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            telegram_token: None,
            telegram_chat_id: None,
            telegram_api_url: default_telegram_api_url(),
            send_summary: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Parse a duration like "30s", "30m", "1h" or "2d". A bare number is seconds.
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_str = duration_str.trim().to_lowercase();

    let seconds = if let Some(value) = duration_str.strip_suffix('s') {
        value.parse::<i64>().context("Invalid seconds value")?
    } else if let Some(value) = duration_str.strip_suffix('m') {
        value.parse::<i64>().map(|v| v * 60).context("Invalid minutes value")?
    } else if let Some(value) = duration_str.strip_suffix('h') {
        value.parse::<i64>().map(|v| v * 3600).context("Invalid hours value")?
    } else if let Some(value) = duration_str.strip_suffix('d') {
        value.parse::<i64>().map(|v| v * 86400).context("Invalid days value")?
    } else {
        duration_str
            .parse::<i64>()
            .context("Invalid duration format. Use format like '30m', '1h', '2d'")?
    };

    if seconds < 0 {
        bail!("Duration must not be negative: {}", duration_str);
    }

    Ok(Duration::seconds(seconds))
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            config.expand_paths()?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_yaml(&content).with_context(|| format!("Failed to load config file: {:?}", path))
    }

    /// Parse, expand and validate a YAML document
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut config: Config =
            serde_yaml::from_str(content).context("Failed to parse configuration YAML")?;

        config.expand_paths()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("tubesentry").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.storage.database_path = shellexpand::full(&self.storage.database_path)
            .context("Failed to expand database_path")?
            .into_owned();

        self.auth.token_file = shellexpand::full(&self.auth.token_file)
            .context("Failed to expand token_file path")?
            .into_owned();

        Ok(())
    }

    /// Check settings that apply to the whole run.
    ///
    /// Channel rules are not checked here; they are validated one by one in
    /// [`crate::rules::RuleSet::from_config`].
    pub fn validate(&self) -> Result<()> {
        if self.quota.daily_budget == 0 {
            bail!("quota.daily_budget must be greater than zero");
        }
        if !(self.quota.warning_ratio > 0.0 && self.quota.warning_ratio <= 1.0) {
            bail!(
                "quota.warning_ratio must be in (0, 1], got {}",
                self.quota.warning_ratio
            );
        }

        self.feed_cache_ttl()?;
        self.claim_stale_after()?;
        self.memory_cache_ttl()?;

        for policy in &self.cleanup {
            if policy.playlist_id.trim().is_empty() {
                bail!("cleanup entries need a playlist_id");
            }
            if policy.max_age_days == 0 {
                bail!(
                    "cleanup.max_age_days must be greater than zero for playlist {}",
                    policy.playlist_id
                );
            }
            if policy.max_age_days > MAX_RETENTION_DAYS {
                bail!(
                    "cleanup.max_age_days ({}) exceeds the maximum of {} for playlist {}",
                    policy.max_age_days,
                    MAX_RETENTION_DAYS,
                    policy.playlist_id
                );
            }
        }

        match self.auth.method.as_str() {
            "token_file" | "env" => {}
            other => bail!("Unknown auth.method '{}'. Use 'token_file' or 'env'", other),
        }

        Ok(())
    }

    pub fn feed_cache_ttl(&self) -> Result<Duration> {
        parse_duration(&self.feed.cache_ttl).context("Invalid feed.cache_ttl")
    }

    pub fn claim_stale_after(&self) -> Result<Duration> {
        parse_duration(&self.sync.claim_stale_after).context("Invalid sync.claim_stale_after")
    }

    pub fn memory_cache_ttl(&self) -> Result<Duration> {
        parse_duration(&self.sync.memory_cache_ttl).context("Invalid sync.memory_cache_ttl")
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.storage.database_path)
    }

    pub fn telegram_enabled(&self) -> bool {
        self.notifications.telegram_token.is_some() && self.notifications.telegram_chat_id.is_some()
    }
}
