use crate::snapshot::SnapshotStore;
use crate::source::{MetricsSink, SubredditSource, SubscriptionSource};
use crate::tracker::{ActivityTracker, CycleOutcome, PersistPolicy};
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use reddimon_core::{normalize_subreddit, CollectorSettings, CoreError, ErrorExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives collection cycles for every tracked subreddit on a fixed interval
/// and prunes old metrics.
pub struct Scheduler {
    tracker: ActivityTracker,
    sink: Arc<dyn MetricsSink>,
    subscriptions: Arc<dyn SubscriptionSource>,
    settings: CollectorSettings,
}

impl Scheduler {
    pub fn new(
        source: Arc<dyn SubredditSource>,
        sink: Arc<dyn MetricsSink>,
        subscriptions: Arc<dyn SubscriptionSource>,
        settings: CollectorSettings,
    ) -> Self {
        let post_window = Duration::days(i64::from(settings.post_window_days));
        let tracker = ActivityTracker::new(
            source,
            Arc::clone(&sink),
            Arc::new(SnapshotStore::new()),
            post_window,
        );

        Self {
            tracker,
            sink,
            subscriptions,
            settings,
        }
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        self.tracker.snapshots()
    }

    /// Run one cycle for each named subreddit concurrently.
    ///
    /// Names are normalized to lowercase and deduplicated; invalid names are
    /// logged and dropped. A failure in one subreddit never affects the others.
    pub async fn collect_once(&self, subreddits: &[String]) -> Vec<(String, CycleOutcome)> {
        self.run_all(subreddits, PersistPolicy::Always).await
    }

    async fn run_all(
        &self,
        subreddits: &[String],
        policy: PersistPolicy,
    ) -> Vec<(String, CycleOutcome)> {
        let now = Utc::now();
        let names = unique_names(subreddits);

        let cycles = names.iter().map(|name| async move {
            let outcome = self.tracker.run_cycle(name, now, policy).await;
            (name.clone(), outcome)
        });
        let outcomes = join_all(cycles).await;

        log_summary(&outcomes, now);
        outcomes
    }

    /// On-demand cycles outside the schedule. Snapshots always advance, but
    /// no row is written for a subreddit that already has one within the
    /// dedup window.
    pub async fn track_now(&self, subreddits: &[String]) -> Vec<(String, CycleOutcome)> {
        let secs = u32::try_from(self.settings.tracking_dedup_seconds).unwrap_or(u32::MAX);
        let policy = PersistPolicy::UnlessRecent(Duration::seconds(i64::from(secs)));
        self.run_all(subreddits, policy).await
    }

    /// Delete metrics rows older than `days` days and evict posts that fell
    /// out of the tracking window from idle snapshots.
    pub async fn prune_older_than(&self, days: u32) -> Result<u64, CoreError> {
        let now = Utc::now();
        let cutoff = now - Duration::days(i64::from(days));
        let deleted = self.sink.prune_older_than(cutoff).await?;

        let evicted = self
            .snapshots()
            .evict_older_than((now - self.tracker.post_window()).timestamp());

        info!(
            "Pruned {} metrics rows older than {} days, evicted {} stale posts",
            deleted, days, evicted
        );
        Ok(deleted)
    }

    async fn tick(&self) {
        let tracked = match self.subscriptions.tracked_subreddits().await {
            Ok(tracked) => tracked,
            Err(e) => {
                warn!("Could not load tracked subreddits, skipping this tick");
                e.log_error();
                return;
            }
        };

        if tracked.is_empty() {
            debug!("No subreddits tracked, nothing to collect");
        } else {
            self.collect_once(&tracked).await;
        }

        let forgotten = self.snapshots().retain_tracked(&tracked);
        if forgotten > 0 {
            debug!("Dropped {} snapshots of untracked subreddits", forgotten);
        }
    }

    /// Prune once, then collect on every interval tick until `shutdown` fires.
    ///
    /// Each tick is awaited before the next one is taken, so ticks never
    /// overlap; late ticks are skipped rather than bunched up.
    pub async fn run(&self, shutdown: CancellationToken) {
        let period = self.settings.interval().max(std::time::Duration::from_secs(1));
        info!(
            "Collector starting: every {}s, keeping {} days of metrics",
            period.as_secs(),
            self.settings.retention_days
        );

        if let Err(e) = self.prune_older_than(self.settings.retention_days).await {
            warn!("Startup prune failed");
            e.log_error();
        }

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    warn!("Shutdown requested during a collection cycle");
                    break;
                }
                _ = self.tick() => {}
            }
        }

        info!("Collector stopped");
    }
}

fn unique_names(subreddits: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    subreddits
        .iter()
        .filter(|name| !name.trim().is_empty())
        .filter_map(|name| match normalize_subreddit(name) {
            Ok(normalized) => Some(normalized),
            Err(e) => {
                e.log_warn();
                None
            }
        })
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

fn log_summary(outcomes: &[(String, CycleOutcome)], started: DateTime<Utc>) {
    let count = |pred: fn(&CycleOutcome) -> bool| outcomes.iter().filter(|(_, o)| pred(o)).count();
    let stored = count(|o| matches!(o, CycleOutcome::Stored(_)));
    let deduplicated = count(|o| matches!(o, CycleOutcome::Deduplicated(_)));
    let skipped = count(|o| matches!(o, CycleOutcome::Skipped));
    let failed = outcomes.len() - stored - deduplicated - skipped;

    info!(
        "Collection finished in {}ms: {} stored, {} deduplicated, {} failed, {} skipped",
        (Utc::now() - started).num_milliseconds(),
        stored,
        deduplicated,
        failed,
        skipped
    );
}
