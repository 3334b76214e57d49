//! Configuration management for Threadcast
//!
//! Configuration is a TOML file. Every platform section is optional; a
//! missing section means the platform is not configured and any request
//! targeting it fails for that target only.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::types::Target;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub limits: Limits,
    pub bluesky: Option<BlueskyConfig>,
    pub mastodon: Option<MastodonConfig>,
    pub twitter: Option<TwitterConfig>,
    pub linkedin: Option<LinkedInConfig>,
    pub feed: Option<FeedConfig>,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/threadcast/threadcast.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Request timeout, humantime syntax ("30s", "1m")
    #[serde(default = "default_timeout")]
    pub timeout: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Result<Duration> {
        parse_duration("http.timeout", &self.timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Result<Duration> {
        parse_duration("retry.base_delay", &self.base_delay)
    }
}

/// Structural limits enforced before any network call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_images_per_message: usize,
    pub max_content_bytes: usize,
    /// Largest image file read for upload
    pub max_image_bytes: u64,
    /// LinkedIn's comment ceiling is not documented precisely, keep it
    /// configurable
    pub linkedin_comment_chars: usize,
    pub bluesky_chars: usize,
    pub mastodon_chars: usize,
    pub twitter_chars: usize,
    pub linkedin_chars: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_images_per_message: 4,
            max_content_bytes: 100 * 1024,
            max_image_bytes: 10 * 1024 * 1024,
            linkedin_comment_chars: 1250,
            bluesky_chars: 300,
            mastodon_chars: 500,
            twitter_chars: 280,
            linkedin_chars: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueskyConfig {
    #[serde(default = "default_bluesky_service")]
    pub service: String,
    pub handle: String,
    pub app_password_file: String,
    /// Visible length of shortened links; `None` keeps links verbatim
    #[serde(default = "default_link_display_length")]
    pub link_display_length: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MastodonConfig {
    pub instance: String,
    pub token_file: String,
    #[serde(default = "default_visibility")]
    pub visibility: String,
}

impl MastodonConfig {
    /// Instance URL with an https:// prefix
    pub fn instance_url(&self) -> String {
        if self.instance.starts_with("http://") || self.instance.starts_with("https://") {
            self.instance.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", self.instance.trim_end_matches('/'))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwitterConfig {
    #[serde(default = "default_twitter_api")]
    pub api_base: String,
    pub client_id: String,
    pub client_secret_file: Option<String>,
    pub refresh_token_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedInConfig {
    #[serde(default = "default_linkedin_api")]
    pub api_base: String,
    /// Author URN, e.g. "urn:li:person:abc123"
    pub author_urn: String,
    pub token_file: String,
    #[serde(default = "default_linkedin_version")]
    pub api_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Public base URL entries are served under
    pub base_url: String,
    #[serde(default = "default_feed_title")]
    pub title: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default)]
    pub targets: Vec<String>,
}

fn default_timeout() -> String {
    "30s".to_string()
}

fn default_user_agent() -> String {
    format!("threadcast/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> String {
    "1s".to_string()
}

fn default_bluesky_service() -> String {
    "https://bsky.social".to_string()
}

fn default_link_display_length() -> Option<usize> {
    Some(27)
}

fn default_visibility() -> String {
    "public".to_string()
}

fn default_twitter_api() -> String {
    "https://api.x.com".to_string()
}

fn default_linkedin_api() -> String {
    "https://api.linkedin.com".to_string()
}

fn default_linkedin_version() -> String {
    "202405".to_string()
}

fn default_feed_title() -> String {
    "Threadcast".to_string()
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).map_err(|e| {
        ConfigError::InvalidValue {
            field: field.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.http.timeout()?;
        config.retry.base_delay()?;
        Ok(config)
    }

    /// Whether a section exists for `target`
    pub fn is_configured(&self, target: Target) -> bool {
        match target {
            Target::Bluesky => self.bluesky.is_some(),
            Target::Mastodon => self.mastodon.is_some(),
            Target::Twitter => self.twitter.is_some(),
            Target::LinkedIn => self.linkedin.is_some(),
            Target::Feed => self.feed.is_some(),
        }
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("THREADCAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("threadcast").join("config.toml"))
}

/// Expand `~` and environment variables in a configured path
pub fn expand_path(path: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(path).map_err(|e| ConfigError::InvalidValue {
        field: path.to_string(),
        reason: e.to_string(),
    })?;
    Ok(PathBuf::from(expanded.as_ref()))
}

/// Read a secret (token, password) from a file
///
/// Surrounding whitespace is trimmed; an empty file is an error.
pub fn read_secret_file(path: &str) -> Result<SecretString> {
    let path = expand_path(path)?;
    let content = std::fs::read_to_string(&path).map_err(ConfigError::ReadError)?;
    let secret = content.trim();
    if secret.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: path.display().to_string(),
            reason: "secret file is empty".to_string(),
        }
        .into());
    }
    Ok(SecretString::from(secret.to_string()))
}
