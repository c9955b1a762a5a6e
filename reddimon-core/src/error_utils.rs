//! Classification and logging helpers shared by every error type.

use crate::error::*;
use std::fmt::Display;
use std::time::Duration;
use tracing::{error, warn};

pub trait ErrorExt: Display {
    /// Stable, upper-case code for logs and exported metrics.
    fn error_code(&self) -> &'static str;

    /// Whether repeating the same operation later can succeed.
    fn is_retryable(&self) -> bool {
        false
    }

    /// How long the remote side asked us to wait, when it said so.
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    fn user_friendly_message(&self) -> String;

    fn log_error(&self) -> &Self
    where
        Self: Sized,
    {
        error!(code = self.error_code(), retryable = self.is_retryable(), "{}", self);
        self
    }

    fn log_warn(&self) -> &Self
    where
        Self: Sized,
    {
        warn!(code = self.error_code(), "{}", self);
        self
    }
}

impl ErrorExt for CoreError {
    fn error_code(&self) -> &'static str {
        match self {
            CoreError::RedditApi(_) => "REDDIT_API",
            CoreError::Database(_) => "DATABASE",
            CoreError::Config(_) => "CONFIG",
            CoreError::Io(_) => "IO",
            CoreError::Serialization(_) => "SERIALIZATION",
            CoreError::Network(_) => "NETWORK",
            CoreError::InvalidInput { .. } => "INVALID_INPUT",
            CoreError::Internal { .. } => "INTERNAL",
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            CoreError::RedditApi(e) => e.is_retryable(),
            CoreError::Database(e) => e.is_retryable(),
            CoreError::Network(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            CoreError::RedditApi(e) => e.retry_after(),
            CoreError::Database(e) => e.retry_after(),
            _ => None,
        }
    }

    fn user_friendly_message(&self) -> String {
        match self {
            CoreError::RedditApi(e) => e.user_friendly_message(),
            CoreError::Database(e) => e.user_friendly_message(),
            CoreError::Config(e) => e.user_friendly_message(),
            CoreError::Network(_) => "Could not reach Reddit. Check the network connection.".to_string(),
            CoreError::InvalidInput { message } => message.clone(),
            _ => "Unexpected error while collecting subreddit metrics.".to_string(),
        }
    }

    fn log_error(&self) -> &Self {
        match self {
            CoreError::RedditApi(e) => {
                e.log_error();
            }
            CoreError::Database(e) => {
                e.log_error();
            }
            CoreError::Config(e) => {
                e.log_error();
            }
            other => {
                error!(code = other.error_code(), "{}", other);
            }
        }
        self
    }
}

impl ErrorExt for RedditApiError {
    fn error_code(&self) -> &'static str {
        match self {
            RedditApiError::AuthenticationFailed { .. } => "REDDIT_AUTH_FAILED",
            RedditApiError::RateLimitExceeded { .. } => "REDDIT_RATE_LIMIT",
            RedditApiError::Forbidden { .. } => "REDDIT_FORBIDDEN",
            RedditApiError::SubredditNotFound { .. } => "REDDIT_SUBREDDIT_NOT_FOUND",
            RedditApiError::InvalidToken => "REDDIT_INVALID_TOKEN",
            RedditApiError::RequestTimeout => "REDDIT_TIMEOUT",
            RedditApiError::InvalidResponse { .. } => "REDDIT_INVALID_RESPONSE",
            RedditApiError::ServerError { .. } => "REDDIT_SERVER_ERROR",
        }
    }

    /// The single source of retry classification. The client's
    /// `RetryPolicy::strategy_for` defers to this and only overrides the
    /// server-error status set and the rate-limit switch from configuration.
    fn is_retryable(&self) -> bool {
        match self {
            RedditApiError::RateLimitExceeded { .. }
            | RedditApiError::RequestTimeout
            | RedditApiError::InvalidToken => true,
            RedditApiError::ServerError { status_code } => {
                DEFAULT_RETRYABLE_STATUS_CODES.contains(status_code)
            }
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            RedditApiError::RateLimitExceeded { retry_after } => {
                Some(Duration::from_secs(*retry_after))
            }
            _ => None,
        }
    }

    fn user_friendly_message(&self) -> String {
        match self {
            RedditApiError::AuthenticationFailed { .. } => {
                "Reddit rejected the configured credentials.".to_string()
            }
            RedditApiError::RateLimitExceeded { retry_after } => {
                format!("Reddit rate limit hit; collection resumes in {}s.", retry_after)
            }
            RedditApiError::Forbidden { resource } => {
                format!("r/{} is private, quarantined or banned.", resource)
            }
            RedditApiError::SubredditNotFound { subreddit } => {
                format!("r/{} does not exist.", subreddit)
            }
            RedditApiError::InvalidToken => {
                "Reddit authentication token is invalid and will be renewed.".to_string()
            }
            RedditApiError::RequestTimeout => "Reddit did not answer in time.".to_string(),
            RedditApiError::InvalidResponse { .. } => {
                "Reddit returned a response the collector could not read.".to_string()
            }
            RedditApiError::ServerError { status_code } => {
                format!("Reddit is having trouble (HTTP {}).", status_code)
            }
        }
    }
}

impl ErrorExt for DatabaseError {
    fn error_code(&self) -> &'static str {
        match self {
            DatabaseError::ConnectionFailed { .. } => "DB_CONNECTION_FAILED",
            DatabaseError::MigrationFailed { .. } => "DB_MIGRATION_FAILED",
            DatabaseError::DatabaseLocked => "DB_LOCKED",
            DatabaseError::Sql(_) => "DB_SQL_ERROR",
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, DatabaseError::DatabaseLocked)
    }

    fn retry_after(&self) -> Option<Duration> {
        self.is_retryable().then(|| Duration::from_millis(250))
    }

    fn user_friendly_message(&self) -> String {
        match self {
            DatabaseError::ConnectionFailed { reason } => {
                format!("Could not open the metrics database: {}", reason)
            }
            DatabaseError::MigrationFailed { .. } => {
                "The metrics database schema could not be upgraded.".to_string()
            }
            DatabaseError::DatabaseLocked => {
                "The metrics database is busy; the write will be attempted next cycle.".to_string()
            }
            DatabaseError::Sql(_) => "A metrics database query failed.".to_string(),
        }
    }
}

impl ErrorExt for ConfigError {
    fn error_code(&self) -> &'static str {
        match self {
            ConfigError::FileNotFound { .. } => "CONFIG_FILE_NOT_FOUND",
            ConfigError::MissingField { .. } => "CONFIG_MISSING_FIELD",
            ConfigError::InvalidValue { .. } => "CONFIG_INVALID_VALUE",
            ConfigError::Parse(_) => "CONFIG_PARSE_ERROR",
        }
    }

    fn user_friendly_message(&self) -> String {
        match self {
            ConfigError::FileNotFound { path } => {
                format!("Configuration file '{}' not found.", path)
            }
            ConfigError::MissingField { field } => {
                format!("Required setting '{}' is missing.", field)
            }
            ConfigError::InvalidValue { field, value } => {
                format!("'{}' is not a valid value for '{}'.", value, field)
            }
            ConfigError::Parse(e) => format!("Configuration file is not valid TOML: {}", e),
        }
    }
}
