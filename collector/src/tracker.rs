use crate::snapshot::{SnapshotStore, SubredditSnapshot};
use crate::source::{MetricsSink, SubredditSource};
use chrono::{DateTime, Duration, Utc};
use reddimon_core::{
    ActivityDelta, CoreError, ErrorExt, ListingKind, PostCounters, SubredditMetricsRecord,
    TimeFilter,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const TOP_WEEK_LIMIT: u32 = 100;
pub const HOT_LIMIT: u32 = 50;
pub const NEW_LIMIT: u32 = 50;
pub const RISING_LIMIT: u32 = 50;

/// How many of the most active posts are logged per cycle.
const LOGGED_CHANGES: usize = 5;

/// Result of one collection cycle for one subreddit.
#[derive(Debug)]
pub enum CycleOutcome {
    Stored(SubredditMetricsRecord),
    /// A row was stored recently enough that this one was dropped
    Deduplicated(SubredditMetricsRecord),
    /// Nothing written and the snapshot left as it was
    FetchFailed(CoreError),
    /// Computed but not persisted; the snapshot already moved on
    StoreFailed(SubredditMetricsRecord, CoreError),
    /// Another cycle for the same subreddit was still running
    Skipped,
}

impl CycleOutcome {
    pub fn record(&self) -> Option<&SubredditMetricsRecord> {
        match self {
            CycleOutcome::Stored(record)
            | CycleOutcome::Deduplicated(record)
            | CycleOutcome::StoreFailed(record, _) => Some(record),
            CycleOutcome::FetchFailed(_) | CycleOutcome::Skipped => None,
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, CycleOutcome::Stored(_))
    }
}

/// When a computed record is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistPolicy {
    Always,
    /// Skip the write when the subreddit already has a row this recent
    UnlessRecent(Duration),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityReport {
    pub upvotes: u64,
    pub comment_counts: u64,
    /// Posts that contributed, most active first
    pub significant_changes: Vec<ActivityDelta>,
}

/// Merge listings into one set keyed by post id, keeping only posts created
/// at or after `cutoff_epoch_secs`. First-seen order is preserved.
pub fn union_recent_posts(
    listings: impl IntoIterator<Item = Vec<PostCounters>>,
    cutoff_epoch_secs: i64,
) -> Vec<PostCounters> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut posts: Vec<PostCounters> = Vec::new();

    for post in listings.into_iter().flatten() {
        if post.created_utc < cutoff_epoch_secs {
            continue;
        }
        match positions.get(&post.id) {
            Some(&index) => posts[index] = post,
            None => {
                positions.insert(post.id.clone(), posts.len());
                posts.push(post);
            }
        }
    }

    posts
}

fn positive_change(current: i64, previous: i64) -> u64 {
    u64::try_from(current.saturating_sub(previous)).unwrap_or(0)
}

/// Diff `current` against the previous snapshot.
///
/// Known posts contribute their counter increase (never negative). Unknown
/// posts contribute their full counters, but only when non-zero.
pub fn compute_deltas(
    previous: &SubredditSnapshot,
    current: &[PostCounters],
    now_epoch_secs: i64,
) -> ActivityReport {
    let mut report = ActivityReport::default();

    for post in current {
        let age_hours = (now_epoch_secs - post.created_utc).max(0) / 3600;
        let delta = match previous.get(&post.id) {
            Some(before) => ActivityDelta {
                post_id: post.id.clone(),
                upvote_change: positive_change(post.ups, before.ups),
                comment_change: positive_change(post.num_comments, before.num_comments),
                is_new_post: false,
                age_hours,
            },
            None => ActivityDelta {
                post_id: post.id.clone(),
                upvote_change: positive_change(post.ups, 0),
                comment_change: positive_change(post.num_comments, 0),
                is_new_post: true,
                age_hours,
            },
        };

        if delta.total_change() == 0 {
            continue;
        }

        report.upvotes += delta.upvote_change;
        report.comment_counts += delta.comment_change;
        report.significant_changes.push(delta);
    }

    report.significant_changes.sort_by(|a, b| {
        b.total_change()
            .cmp(&a.total_change())
            .then_with(|| a.post_id.cmp(&b.post_id))
    });
    report
}

/// Turns listing snapshots into one engagement row per subreddit per cycle.
pub struct ActivityTracker {
    source: Arc<dyn SubredditSource>,
    sink: Arc<dyn MetricsSink>,
    snapshots: Arc<SnapshotStore>,
    post_window: Duration,
}

impl ActivityTracker {
    pub fn new(
        source: Arc<dyn SubredditSource>,
        sink: Arc<dyn MetricsSink>,
        snapshots: Arc<SnapshotStore>,
        post_window: Duration,
    ) -> Self {
        Self {
            source,
            sink,
            snapshots,
            post_window,
        }
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn post_window(&self) -> Duration {
        self.post_window
    }

    pub async fn run_cycle(
        &self,
        subreddit: &str,
        now: DateTime<Utc>,
        persist: PersistPolicy,
    ) -> CycleOutcome {
        let Some(mut snapshot) = self.snapshots.try_acquire(subreddit) else {
            warn!("Previous cycle for r/{} still running, skipping", subreddit);
            return CycleOutcome::Skipped;
        };

        let source = &self.source;
        let fetched = futures::try_join!(
            source.fetch_about(subreddit),
            source.fetch_listing(subreddit, ListingKind::Top(TimeFilter::Week), TOP_WEEK_LIMIT),
            source.fetch_listing(subreddit, ListingKind::Hot, HOT_LIMIT),
            source.fetch_listing(subreddit, ListingKind::New, NEW_LIMIT),
            source.fetch_listing(subreddit, ListingKind::Rising, RISING_LIMIT),
        );

        let (about, top, hot, new, rising) = match fetched {
            Ok(results) => results,
            Err(e) => {
                warn!("Fetch for r/{} failed, keeping previous snapshot", subreddit);
                if e.is_retryable() {
                    e.log_warn();
                } else {
                    e.log_error();
                }
                return CycleOutcome::FetchFailed(e);
            }
        };

        let now_secs = now.timestamp();
        let cutoff = (now - self.post_window).timestamp();
        let current = union_recent_posts([top, hot, new, rising], cutoff);
        let report = compute_deltas(&snapshot, &current, now_secs);

        if !report.significant_changes.is_empty() {
            debug!(
                "Active posts in r/{}: +{} upvotes, +{} comments across {} posts; top: {:?}",
                subreddit,
                report.upvotes,
                report.comment_counts,
                report.significant_changes.len(),
                &report.significant_changes[..report.significant_changes.len().min(LOGGED_CHANGES)]
            );
        }

        let tracked_posts = current.len();
        snapshot.replace(current);

        let record = SubredditMetricsRecord {
            subreddit: subreddit.to_ascii_lowercase(),
            timestamp: now,
            active_users: about.active_users,
            subscribers: about.subscribers,
            upvotes: report.upvotes,
            comment_counts: report.comment_counts,
        };

        if let PersistPolicy::UnlessRecent(window) = persist {
            match self.sink.has_recent_metrics(subreddit, now - window).await {
                Ok(true) => {
                    debug!("r/{} already has a row within {}s", subreddit, window.num_seconds());
                    return CycleOutcome::Deduplicated(record);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Could not check recent metrics for r/{}", subreddit);
                    e.log_error();
                    return CycleOutcome::StoreFailed(record, e);
                }
            }
        }

        match self.sink.store_metrics(&record).await {
            Ok(()) => {
                info!(
                    "r/{}: {} active, +{} upvotes, +{} comments ({} posts tracked)",
                    subreddit, record.active_users, record.upvotes, record.comment_counts, tracked_posts
                );
                CycleOutcome::Stored(record)
            }
            Err(e) => {
                warn!("Metrics for r/{} computed but not stored", subreddit);
                e.log_error();
                CycleOutcome::StoreFailed(record, e)
            }
        }
    }
}
