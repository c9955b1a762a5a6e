use chrono::{DateTime, Duration, TimeZone, Utc};
use reddimon_core::{
    normalize_subreddit, CoreError, DatabaseError, SubredditMetricsRecord, UserSubreddit,
    MAX_TRACKED_SUBREDDITS,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use tracing::{debug, info};


#[derive(Debug, FromRow)]
struct MetricsRow {
    subreddit: String,
    timestamp_ms: i64,
    active_users: i64,
    subscribers: i64,
    upvotes: i64,
    comment_counts: i64,
}

impl TryFrom<MetricsRow> for SubredditMetricsRecord {
    type Error = CoreError;

    fn try_from(row: MetricsRow) -> Result<Self, Self::Error> {
        Ok(Self {
            subreddit: row.subreddit,
            timestamp: from_millis(row.timestamp_ms)?,
            active_users: to_u64(row.active_users),
            subscribers: to_u64(row.subscribers),
            upvotes: to_u64(row.upvotes),
            comment_counts: to_u64(row.comment_counts),
        })
    }
}

#[derive(Debug, FromRow)]
struct UserSubredditRow {
    user_id: String,
    subreddit: String,
    created_at_ms: i64,
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, CoreError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| CoreError::internal(format!("stored timestamp {} is out of range", millis)))
}

/// Current and previous value of one metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricPair {
    pub current: u64,
    pub previous: u64,
}

/// The two most recent rows of a subreddit, side by side. Missing rows read as 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsComparison {
    pub upvotes: MetricPair,
    pub comments: MetricPair,
    pub active_users: MetricPair,
}

impl MetricsComparison {
    fn from_rows(
        current: Option<&SubredditMetricsRecord>,
        previous: Option<&SubredditMetricsRecord>,
    ) -> Self {
        let pair = |read: fn(&SubredditMetricsRecord) -> u64| MetricPair {
            current: current.map(read).unwrap_or(0),
            previous: previous.map(read).unwrap_or(0),
        };
        Self {
            upvotes: pair(|r| r.upvotes),
            comments: pair(|r| r.comment_counts),
            active_users: pair(|r| r.active_users),
        }
    }
}

/// Rows inside a trailing window, plus why the window may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementWindow {
    pub metrics: Vec<SubredditMetricsRecord>,
    /// No row was ever stored for this subreddit
    pub is_new_subreddit: bool,
    /// Rows exist, just none inside the window yet
    pub is_calculating: bool,
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the SQLite database at `url`.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| DatabaseError::ConnectionFailed {
                reason: e.to_string(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed {
                reason: e.to_string(),
            })?;

        info!("Connected to database {}", url);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), CoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DatabaseError::MigrationFailed {
                migration: e.to_string(),
            })?;
        debug!("Database migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // Metrics

    pub async fn insert_metrics(&self, record: &SubredditMetricsRecord) -> Result<i64, CoreError> {
        let subreddit = normalize_subreddit(&record.subreddit)?;
        let result = sqlx::query(
            r#"
            INSERT INTO subreddit_metrics (
                subreddit, timestamp_ms, active_users, subscribers, upvotes, comment_counts
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&subreddit)
        .bind(record.timestamp.timestamp_millis())
        .bind(to_i64(record.active_users))
        .bind(to_i64(record.subscribers))
        .bind(to_i64(record.upvotes))
        .bind(to_i64(record.comment_counts))
        .execute(&self.pool)
        .await?;

        debug!(
            "Stored metrics for r/{} at {}",
            subreddit,
            record.timestamp.to_rfc3339()
        );
        Ok(result.last_insert_rowid())
    }

    /// Deletes every row stamped strictly before `cutoff`.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM subreddit_metrics WHERE timestamp_ms < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Rows with `from <= timestamp <= to`, oldest first.
    pub async fn metrics_between(
        &self,
        subreddit: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SubredditMetricsRecord>, CoreError> {
        let subreddit = normalize_subreddit(subreddit)?;
        let rows: Vec<MetricsRow> = sqlx::query_as(
            r#"
            SELECT subreddit, timestamp_ms, active_users, subscribers, upvotes, comment_counts
            FROM subreddit_metrics
            WHERE subreddit = ? AND timestamp_ms >= ? AND timestamp_ms <= ?
            ORDER BY timestamp_ms ASC, id ASC
            "#,
        )
        .bind(&subreddit)
        .bind(from.timestamp_millis())
        .bind(to.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SubredditMetricsRecord::try_from).collect()
    }

    /// Rows at or after `from`, newest first.
    pub async fn metrics_since(
        &self,
        subreddit: &str,
        from: DateTime<Utc>,
    ) -> Result<Vec<SubredditMetricsRecord>, CoreError> {
        let subreddit = normalize_subreddit(subreddit)?;
        let rows: Vec<MetricsRow> = sqlx::query_as(
            r#"
            SELECT subreddit, timestamp_ms, active_users, subscribers, upvotes, comment_counts
            FROM subreddit_metrics
            WHERE subreddit = ? AND timestamp_ms >= ?
            ORDER BY timestamp_ms DESC, id DESC
            "#,
        )
        .bind(&subreddit)
        .bind(from.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SubredditMetricsRecord::try_from).collect()
    }

    pub async fn latest_metrics(
        &self,
        subreddit: &str,
    ) -> Result<Option<SubredditMetricsRecord>, CoreError> {
        let subreddit = normalize_subreddit(subreddit)?;
        let row: Option<MetricsRow> = sqlx::query_as(
            r#"
            SELECT subreddit, timestamp_ms, active_users, subscribers, upvotes, comment_counts
            FROM subreddit_metrics
            WHERE subreddit = ?
            ORDER BY timestamp_ms DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(&subreddit)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubredditMetricsRecord::try_from).transpose()
    }

    /// Most recent row against the latest one stamped strictly earlier.
    pub async fn latest_metrics_pair(&self, subreddit: &str) -> Result<MetricsComparison, CoreError> {
        let subreddit = normalize_subreddit(subreddit)?;
        let Some(current) = self.latest_metrics(&subreddit).await? else {
            return Ok(MetricsComparison::default());
        };

        let previous: Option<MetricsRow> = sqlx::query_as(
            r#"
            SELECT subreddit, timestamp_ms, active_users, subscribers, upvotes, comment_counts
            FROM subreddit_metrics
            WHERE subreddit = ? AND timestamp_ms < ?
            ORDER BY timestamp_ms DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(&subreddit)
        .bind(current.timestamp.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;
        let previous = previous.map(SubredditMetricsRecord::try_from).transpose()?;

        Ok(MetricsComparison::from_rows(Some(&current), previous.as_ref()))
    }

    /// Rows from the trailing `hours`, flagged for the dashboard's empty states.
    pub async fn engagement_window(
        &self,
        subreddit: &str,
        hours: i64,
    ) -> Result<EngagementWindow, CoreError> {
        let subreddit = normalize_subreddit(subreddit)?;
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subreddit_metrics WHERE subreddit = ?")
            .bind(&subreddit)
            .fetch_one(&self.pool)
            .await?;

        if total == 0 {
            return Ok(EngagementWindow {
                is_new_subreddit: true,
                ..EngagementWindow::default()
            });
        }

        let end = Utc::now();
        let start = end - Duration::hours(hours.max(0));
        let metrics = self.metrics_between(&subreddit, start, end).await?;
        debug!(
            "Found {} of {} rows for r/{} in the last {}h",
            metrics.len(),
            total,
            subreddit,
            hours
        );

        Ok(EngagementWindow {
            is_calculating: metrics.is_empty(),
            is_new_subreddit: false,
            metrics,
        })
    }

    pub async fn has_recent_metrics(
        &self,
        subreddit: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let subreddit = normalize_subreddit(subreddit)?;
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM subreddit_metrics WHERE subreddit = ? AND timestamp_ms >= ? LIMIT 1",
        )
        .bind(&subreddit)
        .bind(since.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.is_some())
    }

    // User subscriptions

    /// Follows `subreddit` for `user_id`, up to [`MAX_TRACKED_SUBREDDITS`].
    pub async fn add_user_subreddit(
        &self,
        user_id: &str,
        subreddit: &str,
    ) -> Result<UserSubreddit, CoreError> {
        if subreddit.trim().is_empty() {
            return Err(CoreError::invalid_input("Subreddit name is required"));
        }
        let subreddit = normalize_subreddit(subreddit)?;

        let mut tx = self.pool.begin().await?;

        let existing: Vec<String> =
            sqlx::query_scalar("SELECT subreddit FROM user_subreddits WHERE user_id = ?")
                .bind(user_id)
                .fetch_all(&mut *tx)
                .await?;

        if existing.iter().any(|name| name.eq_ignore_ascii_case(&subreddit)) {
            return Err(CoreError::invalid_input(format!(
                "r/{} is already added",
                subreddit
            )));
        }
        if existing.len() >= MAX_TRACKED_SUBREDDITS {
            return Err(CoreError::invalid_input(format!(
                "At most {} subreddits can be followed",
                MAX_TRACKED_SUBREDDITS
            )));
        }

        let created_at = from_millis(Utc::now().timestamp_millis())?;
        sqlx::query(
            "INSERT INTO user_subreddits (user_id, subreddit, created_at_ms) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(&subreddit)
        .bind(created_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!("User {} now follows r/{}", user_id, subreddit);

        Ok(UserSubreddit {
            user_id: user_id.to_string(),
            subreddit,
            created_at,
        })
    }

    pub async fn list_user_subreddits(&self, user_id: &str) -> Result<Vec<UserSubreddit>, CoreError> {
        let rows: Vec<UserSubredditRow> = sqlx::query_as(
            r#"
            SELECT user_id, subreddit, created_at_ms
            FROM user_subreddits
            WHERE user_id = ?
            ORDER BY created_at_ms ASC, id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(UserSubreddit {
                    created_at: from_millis(row.created_at_ms)?,
                    user_id: row.user_id,
                    subreddit: row.subreddit,
                })
            })
            .collect()
    }

    /// Returns whether anything was removed.
    pub async fn remove_user_subreddit(&self, user_id: &str, subreddit: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "DELETE FROM user_subreddits WHERE user_id = ? AND lower(subreddit) = lower(?)",
        )
        .bind(user_id)
        .bind(subreddit.trim())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Every subreddit followed by at least one user, lowercased, once per
    /// name, sorted. These are the keys metrics rows are stored under.
    pub async fn tracked_subreddits(&self) -> Result<Vec<String>, CoreError> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT lower(subreddit)
            FROM user_subreddits
            ORDER BY 1 ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(names)
    }
}
