use reddimon_core::RedditPost;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

type CacheKey = (String, u32);

#[derive(Debug, Clone)]
struct CachedPosts {
    posts: Vec<RedditPost>,
    fetched_at: Instant,
}

/// Short-lived cache for paginated "new" listings, keyed by subreddit and limit.
#[derive(Debug)]
pub struct ListingCache {
    ttl: Duration,
    post_window: Duration,
    entries: RwLock<HashMap<CacheKey, CachedPosts>>,
}

impl ListingCache {
    pub fn new(ttl: Duration, post_window: Duration) -> Self {
        Self {
            ttl,
            post_window,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn key(subreddit: &str, limit: u32) -> CacheKey {
        (subreddit.to_lowercase(), limit)
    }

    /// Entry younger than the TTL.
    pub async fn get_fresh(&self, subreddit: &str, limit: u32) -> Option<Vec<RedditPost>> {
        let entries = self.entries.read().await;
        entries
            .get(&Self::key(subreddit, limit))
            .filter(|cached| cached.fetched_at.elapsed() < self.ttl)
            .map(|cached| cached.posts.clone())
    }

    /// Entry regardless of age, used when a refresh fails.
    pub async fn get_any(&self, subreddit: &str, limit: u32) -> Option<Vec<RedditPost>> {
        let entries = self.entries.read().await;
        entries
            .get(&Self::key(subreddit, limit))
            .map(|cached| cached.posts.clone())
    }

    pub async fn insert(&self, subreddit: &str, limit: u32, posts: Vec<RedditPost>) {
        let mut entries = self.entries.write().await;
        entries.insert(
            Self::key(subreddit, limit),
            CachedPosts {
                posts,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Drops expired entries, trims the rest to posts inside the post window
    /// and drops entries left empty. Returns the number of entries removed.
    pub async fn sweep(&self, now_epoch_secs: i64) -> usize {
        let cutoff = now_epoch_secs - self.post_window.as_secs() as i64;
        let mut entries = self.entries.write().await;
        let before = entries.len();

        entries.retain(|_, cached| cached.fetched_at.elapsed() < self.ttl);
        entries.retain(|_, cached| {
            cached.posts.retain(|post| post.created_utc >= cutoff);
            !cached.posts.is_empty()
        });

        let removed = before - entries.len();
        if removed > 0 {
            debug!("Listing cache sweep removed {} entries", removed);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 24 * 3600;

    fn post(id: &str, created_utc: i64) -> RedditPost {
        RedditPost {
            id: id.to_string(),
            title: format!("post {}", id),
            selftext: String::new(),
            url: format!("https://reddit.com/{}", id),
            score: 1,
            num_comments: 0,
            created_utc,
        }
    }

    #[tokio::test]
    async fn test_keys_ignore_subreddit_case() {
        let cache = ListingCache::new(Duration::from_secs(300), Duration::from_secs(7 * 86400));
        cache.insert("RustLang", 100, vec![post("a", 0)]).await;

        assert!(cache.get_fresh("rustlang", 100).await.is_some());
        assert!(cache.get_fresh("rustlang", 50).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_remain_available_as_stale() {
        let cache = ListingCache::new(Duration::from_millis(10), Duration::from_secs(7 * 86400));
        cache.insert("rust", 25, vec![post("a", 0)]).await;

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(cache.get_fresh("rust", 25).await.is_none());
        assert_eq!(cache.get_any("rust", 25).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_trims_old_posts_and_expired_entries() {
        let now = 1_700_000_000;
        let cache = ListingCache::new(Duration::from_secs(300), Duration::from_secs(7 * 86400));
        cache
            .insert("rust", 25, vec![post("fresh", now - DAY), post("old", now - 8 * DAY)])
            .await;

        assert_eq!(cache.sweep(now).await, 0);
        let posts = cache.get_fresh("rust", 25).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, "fresh");

        cache.insert("golang", 25, vec![post("stale", now - 9 * DAY)]).await;
        assert_eq!(cache.sweep(now).await, 1);
        assert!(cache.get_any("golang", 25).await.is_none());

        let short = ListingCache::new(Duration::from_millis(1), Duration::from_secs(7 * 86400));
        short.insert("rust", 25, vec![post("a", now)]).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(short.sweep(now).await, 1);
        assert!(short.is_empty().await);
    }
}
