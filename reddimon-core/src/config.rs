//! Application configuration.
//!
//! Settings are read from an optional TOML file and then overlaid with
//! environment variables, which is where the Reddit credentials normally
//! come from.

use crate::error::{ConfigError, CoreError, DEFAULT_RETRYABLE_STATUS_CODES};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "web:reddimon:v1.0.0";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://reddimon.db";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedditSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub request_delay_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retryable_status_codes: Vec<u16>,
    pub continue_after_rate_limit: bool,
    pub cache_ttl_seconds: u64,
    pub cache_sweep_interval_seconds: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_delay_ms: 1100,
            max_retries: 3,
            retry_base_delay_ms: 2000,
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.to_vec(),
            continue_after_rate_limit: true,
            cache_ttl_seconds: 5 * 60,
            cache_sweep_interval_seconds: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    pub interval_minutes: u64,
    pub retention_days: u32,
    pub post_window_days: u32,
    pub tracking_dedup_seconds: u64,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            interval_minutes: 5,
            retention_days: 30,
            post_window_days: 7,
            tracking_dedup_seconds: 4 * 60,
        }
    }
}

impl CollectorSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub reddit: RedditSettings,
    pub client: ClientSettings,
    pub collector: CollectorSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            reddit: RedditSettings::default(),
            client: ClientSettings::default(),
            collector: CollectorSettings::default(),
        }
    }
}

impl AppConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, CoreError> {
        let config: AppConfig = toml::from_str(contents).map_err(ConfigError::from)?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            }
            .into());
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Load from `REDDIMON_CONFIG` (if set) and apply environment overrides.
    pub fn load() -> Result<Self, CoreError> {
        let mut config = match std::env::var("REDDIMON_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let reddit = &mut self.reddit;
        for (key, slot) in [
            ("REDDIT_CLIENT_ID", &mut reddit.client_id),
            ("REDDIT_CLIENT_SECRET", &mut reddit.client_secret),
            ("REDDIT_USERNAME", &mut reddit.username),
            ("REDDIT_PASSWORD", &mut reddit.password),
            ("REDDIT_USER_AGENT", &mut reddit.user_agent),
        ] {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *slot = Some(value);
            }
        }
        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            self.database_url = url;
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.collector.interval_minutes == 0 {
            return Err(invalid("collector.interval_minutes", "0"));
        }
        if self.collector.retention_days == 0 {
            return Err(invalid("collector.retention_days", "0"));
        }
        if self.client.max_retries > 10 {
            return Err(invalid(
                "client.max_retries",
                &self.client.max_retries.to_string(),
            ));
        }
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "database_url".to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub fn user_agent(&self) -> String {
        self.reddit
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }
}

fn invalid(field: &str, value: &str) -> CoreError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}
