//! Seams between the collector and the outside world.
//!
//! The tracker only needs to read subreddit listings, write one metrics row
//! per cycle and learn which subreddits to follow. The production
//! implementations are the Reddit client and the SQLite database; tests
//! substitute in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use database::Database;
use reddimon_core::{CoreError, ListingKind, PostCounters, SubredditAbout, SubredditMetricsRecord};
use reddit_client::RedditClient;

#[async_trait]
pub trait SubredditSource: Send + Sync {
    async fn fetch_about(&self, subreddit: &str) -> Result<SubredditAbout, CoreError>;

    async fn fetch_listing(
        &self,
        subreddit: &str,
        kind: ListingKind,
        limit: u32,
    ) -> Result<Vec<PostCounters>, CoreError>;
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn store_metrics(&self, record: &SubredditMetricsRecord) -> Result<(), CoreError>;

    /// Delete rows stamped before `cutoff`, returning how many went.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError>;

    async fn has_recent_metrics(
        &self,
        subreddit: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, CoreError>;
}

#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    async fn tracked_subreddits(&self) -> Result<Vec<String>, CoreError>;
}

#[async_trait]
impl SubredditSource for RedditClient {
    async fn fetch_about(&self, subreddit: &str) -> Result<SubredditAbout, CoreError> {
        RedditClient::fetch_about(self, subreddit).await
    }

    async fn fetch_listing(
        &self,
        subreddit: &str,
        kind: ListingKind,
        limit: u32,
    ) -> Result<Vec<PostCounters>, CoreError> {
        RedditClient::fetch_listing(self, subreddit, kind, limit).await
    }
}

#[async_trait]
impl MetricsSink for Database {
    async fn store_metrics(&self, record: &SubredditMetricsRecord) -> Result<(), CoreError> {
        self.insert_metrics(record).await.map(|_| ())
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError> {
        Database::prune_older_than(self, cutoff).await
    }

    async fn has_recent_metrics(
        &self,
        subreddit: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        Database::has_recent_metrics(self, subreddit, since).await
    }
}

#[async_trait]
impl SubscriptionSource for Database {
    async fn tracked_subreddits(&self) -> Result<Vec<String>, CoreError> {
        Database::tracked_subreddits(self).await
    }
}
