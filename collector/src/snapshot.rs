use reddimon_core::PostCounters;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Last observed counters of one subreddit's posts, keyed by post id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubredditSnapshot {
    posts: HashMap<String, PostCounters>,
}

impl SubredditSnapshot {
    pub fn from_posts(posts: impl IntoIterator<Item = PostCounters>) -> Self {
        Self {
            posts: posts.into_iter().map(|post| (post.id.clone(), post)).collect(),
        }
    }

    pub fn get(&self, post_id: &str) -> Option<&PostCounters> {
        self.posts.get(post_id)
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    /// Swap in the whole current post set; nothing from the old set survives.
    pub fn replace(&mut self, posts: impl IntoIterator<Item = PostCounters>) {
        *self = Self::from_posts(posts);
    }

    /// Drop posts created before `cutoff_epoch_secs`. Returns how many went.
    pub fn evict_older_than(&mut self, cutoff_epoch_secs: i64) -> usize {
        let before = self.posts.len();
        self.posts.retain(|_, post| post.created_utc >= cutoff_epoch_secs);
        before - self.posts.len()
    }
}

/// Owner of every subreddit's snapshot.
///
/// Each subreddit has its own async mutex. A cycle holds that lock from fetch
/// to persist, so two cycles for one subreddit can never interleave, while
/// cycles for different subreddits proceed independently.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    entries: Mutex<HashMap<String, Arc<AsyncMutex<SubredditSnapshot>>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(subreddit: &str) -> String {
        subreddit.trim().to_lowercase()
    }

    fn handle(&self, subreddit: &str) -> Arc<AsyncMutex<SubredditSnapshot>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(entries.entry(Self::key(subreddit)).or_default())
    }

    /// Exclusive access to a subreddit's snapshot, or `None` while another
    /// cycle holds it.
    pub fn try_acquire(&self, subreddit: &str) -> Option<OwnedMutexGuard<SubredditSnapshot>> {
        self.handle(subreddit).try_lock_owned().ok()
    }

    /// Copy of the current snapshot, waiting for any running cycle.
    pub async fn snapshot(&self, subreddit: &str) -> SubredditSnapshot {
        self.handle(subreddit).lock().await.clone()
    }

    pub fn subreddits(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Evict posts older than the cutoff from every idle snapshot.
    pub fn evict_older_than(&self, cutoff_epoch_secs: i64) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .values()
            .filter_map(|snapshot| snapshot.try_lock().ok())
            .map(|mut snapshot| snapshot.evict_older_than(cutoff_epoch_secs))
            .sum()
    }

    /// Forget snapshots of subreddits nobody tracks any more. A snapshot
    /// whose cycle is still running is kept.
    pub fn retain_tracked(&self, tracked: &[String]) -> usize {
        let keep: Vec<String> = tracked.iter().map(|name| Self::key(name)).collect();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|name, snapshot| keep.contains(name) || snapshot.try_lock().is_err());
        before - entries.len()
    }
}
