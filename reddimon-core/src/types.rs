use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Users may follow at most this many subreddits.
pub const MAX_TRACKED_SUBREDDITS: usize = 3;

/// Counter state of one post as returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostCounters {
    pub id: String,
    pub ups: i64,
    pub num_comments: i64,
    pub created_utc: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditPost {
    pub id: String,
    pub title: String,
    pub selftext: String,
    pub url: String,
    pub score: i64,
    pub num_comments: i64,
    pub created_utc: i64,
}

impl RedditPost {
    pub fn engagement(&self) -> i64 {
        self.score + self.num_comments
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubredditAbout {
    pub active_users: u64,
    pub subscribers: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFilter {
    Hour,
    Day,
    Week,
    Month,
    Year,
    All,
}

impl TimeFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFilter::Hour => "hour",
            TimeFilter::Day => "day",
            TimeFilter::Week => "week",
            TimeFilter::Month => "month",
            TimeFilter::Year => "year",
            TimeFilter::All => "all",
        }
    }
}

/// A named feed of posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListingKind {
    Top(TimeFilter),
    Hot,
    New,
    Rising,
}

impl ListingKind {
    pub fn path_segment(&self) -> &'static str {
        match self {
            ListingKind::Top(_) => "top",
            ListingKind::Hot => "hot",
            ListingKind::New => "new",
            ListingKind::Rising => "rising",
        }
    }

    pub fn time_filter(&self) -> Option<TimeFilter> {
        match self {
            ListingKind::Top(filter) => Some(*filter),
            _ => None,
        }
    }
}

impl fmt::Display for ListingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.time_filter() {
            Some(filter) => write!(f, "top/{}", filter.as_str()),
            None => f.write_str(self.path_segment()),
        }
    }
}

/// Canonical form of a subreddit name: lowercase, without an `r/` prefix.
///
/// Reddit names are 2 to 21 ASCII letters, digits or underscores. Anything
/// else is rejected before it can reach a URL path or the database.
pub fn normalize_subreddit(name: &str) -> Result<String, CoreError> {
    let trimmed = name.trim();
    let bare = trimmed
        .strip_prefix("r/")
        .or_else(|| trimmed.strip_prefix("/r/"))
        .unwrap_or(trimmed);

    let valid_chars = bare.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_chars || !(2..=21).contains(&bare.len()) {
        return Err(CoreError::invalid_input(format!(
            "'{}' is not a valid subreddit name",
            name.trim()
        )));
    }
    Ok(bare.to_ascii_lowercase())
}

/// Positive-only counter change of one post between two cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityDelta {
    pub post_id: String,
    pub upvote_change: u64,
    pub comment_change: u64,
    pub is_new_post: bool,
    pub age_hours: i64,
}

impl ActivityDelta {
    pub fn total_change(&self) -> u64 {
        self.upvote_change + self.comment_change
    }
}

/// One persisted aggregate row per subreddit per cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubredditMetricsRecord {
    pub subreddit: String,
    pub timestamp: DateTime<Utc>,
    pub active_users: u64,
    pub subscribers: u64,
    pub upvotes: u64,
    pub comment_counts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSubreddit {
    pub user_id: String,
    pub subreddit: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_listing_kind_display() {
        assert_eq!(ListingKind::Top(TimeFilter::Week).to_string(), "top/week");
        assert_eq!(ListingKind::Rising.to_string(), "rising");
        assert_eq!(ListingKind::Hot.time_filter(), None);
    }

    #[test]
    fn test_normalize_subreddit() {
        assert_eq!(normalize_subreddit("Rust").unwrap(), "rust");
        assert_eq!(normalize_subreddit("  r/AskReddit ").unwrap(), "askreddit");
        assert_eq!(normalize_subreddit("/r/rust_gamedev").unwrap(), "rust_gamedev");

        for bad in ["", "r", "rust/../../api/v1/me", "rust?limit=1", "has space", "ab%2f", "a".repeat(22).as_str()] {
            let error = normalize_subreddit(bad).unwrap_err();
            assert!(matches!(error, CoreError::InvalidInput { .. }), "{bad:?} accepted");
        }
    }

    #[test]
    fn test_metrics_record_json_shape() {
        let record = SubredditMetricsRecord {
            subreddit: "rust".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            active_users: 120,
            subscribers: 300_000,
            upvotes: 42,
            comment_counts: 7,
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["subreddit"], "rust");
        assert_eq!(value["activeUsers"], 120);
        assert_eq!(value["commentCounts"], 7);
        assert_eq!(value["timestamp"], "2024-05-01T12:00:00Z");
    }
}
