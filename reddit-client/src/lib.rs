pub mod api;
pub mod auth;
pub mod cache;
pub mod metrics;
pub mod request_queue;
pub mod retry;

mod tests;

pub use api::{RedditApiClient, REDDIT_API_BASE};
pub use auth::{Authenticator, RedditCredentials, TOKEN_URL};
pub use cache::ListingCache;
pub use metrics::{ApiMetrics, EndpointMetrics, MetricsCollector};
pub use request_queue::{QueueStats, RequestQueue};
pub use retry::{RetryExecutor, RetryMetrics, RetryPolicy, RetryStrategy};

use reddimon_core::{
    keyword_frequencies, normalize_subreddit, AppConfig, CoreError, ErrorExt, KeywordFrequency,
    ListingKind, PostCounters, RedditApiError, RedditPost, SubredditAbout, TimeFilter,
    DEFAULT_KEYWORD_LIMIT,
};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

/// Reddit refuses to page further back than this.
pub const MAX_NEW_POSTS: u32 = 1000;
pub const DEFAULT_SEARCH_LIMIT: u32 = 5;
pub const TRENDING_LIMIT: u32 = 10;
pub const KEYWORD_SAMPLE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Minimum gap between the starts of two requests
    pub request_delay: Duration,
    pub retry: RetryPolicy,
    pub cache_ttl: Duration,
    pub cache_sweep_interval: Duration,
    /// Posts older than this are dropped from cached listings
    pub post_window: Duration,
    pub http_timeout: Duration,
    /// Honour HTTP(S)_PROXY from the environment
    pub use_system_proxy: bool,
    pub api_base_url: String,
    pub token_url: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_delay: Duration::from_millis(1100),
            retry: RetryPolicy::reddit(),
            cache_ttl: Duration::from_secs(5 * 60),
            cache_sweep_interval: Duration::from_secs(60 * 60),
            post_window: Duration::from_secs(7 * 24 * 3600),
            http_timeout: Duration::from_secs(30),
            use_system_proxy: true,
            api_base_url: REDDIT_API_BASE.to_string(),
            token_url: TOKEN_URL.to_string(),
        }
    }
}

impl ClientOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        let client = &config.client;
        Self {
            request_delay: Duration::from_millis(client.request_delay_ms),
            retry: RetryPolicy::from_settings(client),
            cache_ttl: Duration::from_secs(client.cache_ttl_seconds),
            cache_sweep_interval: Duration::from_secs(client.cache_sweep_interval_seconds),
            post_window: Duration::from_secs(u64::from(config.collector.post_window_days) * 24 * 3600),
            ..Self::default()
        }
    }
}

/// Authenticated, throttled Reddit client.
///
/// Every call is authenticated, passed through the serial request queue and
/// retried per the [`RetryPolicy`]; each retry is a separate queue job so a
/// backoff wait never blocks other callers.
#[derive(Debug)]
pub struct RedditClient {
    auth: Arc<Authenticator>,
    api: Arc<RedditApiClient>,
    metrics: Arc<MetricsCollector>,
    queue: RequestQueue,
    retry: RetryExecutor,
    cache: Arc<ListingCache>,
    sweeper: JoinHandle<()>,
}

impl RedditClient {
    /// Must be called inside a tokio runtime; spawns the queue worker and
    /// the cache sweeper.
    pub fn new(credentials: RedditCredentials, options: ClientOptions) -> Result<Self, CoreError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(&credentials.user_agent)
            .timeout(options.http_timeout);
        if !options.use_system_proxy {
            builder = builder.no_proxy();
        }
        let http = builder.build()?;

        let metrics = Arc::new(MetricsCollector::new());
        let auth = Arc::new(Authenticator::new(&credentials, http.clone(), &options.token_url)?);
        let api = Arc::new(RedditApiClient::new(
            http,
            options.api_base_url.clone(),
            Arc::clone(&metrics),
        ));
        let cache = Arc::new(ListingCache::new(options.cache_ttl, options.post_window));
        let sweeper = spawn_cache_sweeper(Arc::clone(&cache), options.cache_sweep_interval);

        info!(
            "Reddit client initialized for u/{} (request gap {:?})",
            credentials.username, options.request_delay
        );

        Ok(Self {
            auth,
            api,
            metrics,
            queue: RequestQueue::new(options.request_delay),
            retry: RetryExecutor::new(options.retry),
            cache,
            sweeper,
        })
    }

    async fn call<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T, CoreError>
    where
        F: Fn(Arc<RedditApiClient>, String) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<T, CoreError>> + Send + 'static,
        T: Send + 'static,
    {
        self.retry
            .execute(operation_name, || {
                let auth = Arc::clone(&self.auth);
                let api = Arc::clone(&self.api);
                let operation = operation.clone();

                self.queue.enqueue(move || async move {
                    let token = auth.access_token().await?;
                    let result = operation(api, token).await;
                    if let Err(CoreError::RedditApi(RedditApiError::InvalidToken)) = &result {
                        auth.invalidate().await;
                    }
                    result
                })
            })
            .await
    }

    pub async fn fetch_about(&self, subreddit: &str) -> Result<SubredditAbout, CoreError> {
        let name = normalize_subreddit(subreddit)?;
        self.call(&format!("about r/{}", name), move |api, token| {
            let name = name.clone();
            async move { api.subreddit_about(&token, &name).await }
        })
        .await
    }

    /// One page of `kind`, reduced to the counters used for delta tracking.
    pub async fn fetch_listing(
        &self,
        subreddit: &str,
        kind: ListingKind,
        limit: u32,
    ) -> Result<Vec<PostCounters>, CoreError> {
        let name = normalize_subreddit(subreddit)?;
        let limit = limit.min(MAX_PAGE_SIZE);
        let page = self
            .call(&format!("{} r/{}", kind, name), move |api, token| {
                let name = name.clone();
                async move { api.listing(&token, &name, kind, limit, None).await }
            })
            .await?;

        Ok(page.posts.iter().map(PostCounters::from).collect())
    }

    pub async fn fetch_top_posts(
        &self,
        subreddit: &str,
        filter: TimeFilter,
        limit: u32,
    ) -> Result<Vec<RedditPost>, CoreError> {
        let name = normalize_subreddit(subreddit)?;
        let kind = ListingKind::Top(filter);
        let limit = limit.min(MAX_PAGE_SIZE);
        let page = self
            .call(&format!("{} r/{}", kind, name), move |api, token| {
                let name = name.clone();
                async move { api.listing(&token, &name, kind, limit, None).await }
            })
            .await?;

        Ok(page.posts.into_iter().map(RedditPost::from).collect())
    }

    /// Today's top posts, highest engagement first.
    pub async fn trending_posts(&self, subreddit: &str) -> Result<Vec<RedditPost>, CoreError> {
        let mut posts = self
            .fetch_top_posts(subreddit, TimeFilter::Day, TRENDING_LIMIT)
            .await?;
        posts.sort_by_key(|post| std::cmp::Reverse(post.engagement()));
        Ok(posts)
    }

    /// Keyword frequencies over this week's top posts.
    pub async fn keyword_report(&self, subreddit: &str) -> Result<Vec<KeywordFrequency>, CoreError> {
        let posts = self
            .fetch_top_posts(subreddit, TimeFilter::Week, KEYWORD_SAMPLE_SIZE)
            .await?;
        Ok(keyword_frequencies(&posts, DEFAULT_KEYWORD_LIMIT))
    }

    /// Newest posts, following cursors up to `limit` (capped at 1000).
    /// Served from the listing cache while fresh; a failed refresh falls
    /// back to the last cached result.
    pub async fn fetch_new_posts(
        &self,
        subreddit: &str,
        limit: u32,
    ) -> Result<Vec<RedditPost>, CoreError> {
        let subreddit = normalize_subreddit(subreddit)?;
        let subreddit = subreddit.as_str();
        let limit = limit.min(MAX_NEW_POSTS);
        if limit == 0 {
            return Ok(Vec::new());
        }

        if let Some(posts) = self.cache.get_fresh(subreddit, limit).await {
            debug!("Serving r/{} new posts from cache", subreddit);
            return Ok(posts);
        }

        match self.page_new_posts(subreddit, limit).await {
            Ok(posts) => {
                self.cache.insert(subreddit, limit, posts.clone()).await;
                Ok(posts)
            }
            Err(error) => match self.cache.get_any(subreddit, limit).await {
                Some(stale) => {
                    error.log_warn();
                    warn!(
                        "Refreshing r/{} new posts failed, serving {} cached posts",
                        subreddit,
                        stale.len()
                    );
                    Ok(stale)
                }
                None => Err(error),
            },
        }
    }

    async fn page_new_posts(&self, subreddit: &str, limit: u32) -> Result<Vec<RedditPost>, CoreError> {
        let page_size = if limit > 500 { MAX_PAGE_SIZE } else { 25 };
        let mut posts: Vec<RedditPost> = Vec::new();
        let mut after: Option<String> = None;

        while (posts.len() as u32) < limit {
            let batch = page_size.min(limit - posts.len() as u32);
            let name = subreddit.to_string();
            let cursor = after.clone();

            let page = self
                .call(&format!("new r/{}", subreddit), move |api, token| {
                    let name = name.clone();
                    let cursor = cursor.clone();
                    async move {
                        api.listing(&token, &name, ListingKind::New, batch, cursor.as_deref())
                            .await
                    }
                })
                .await?;

            if page.posts.is_empty() {
                break;
            }

            let last_name = page.posts.last().map(|post| post.name.clone());
            after = page.after.or(last_name).filter(|cursor| !cursor.is_empty());
            posts.extend(page.posts.into_iter().map(RedditPost::from));

            if after.is_none() {
                break;
            }
        }

        posts.truncate(limit as usize);
        debug!("Paged {} new posts from r/{}", posts.len(), subreddit);
        Ok(posts)
    }

    pub async fn search_subreddits(&self, query: &str, limit: u32) -> Result<Vec<String>, CoreError> {
        let query = query.trim().to_string();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        self.call("search subreddits", move |api, token| {
            let query = query.clone();
            async move { api.search_subreddits(&token, &query, limit).await }
        })
        .await
    }

    pub async fn request_metrics(&self) -> ApiMetrics {
        self.metrics.get_metrics().await
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn retry_metrics(&self) -> RetryMetrics {
        self.retry.metrics()
    }
}

impl Drop for RedditClient {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

fn spawn_cache_sweeper(cache: Arc<ListingCache>, every: Duration) -> JoinHandle<()> {
    // interval_at panics on a zero period
    let every = every.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        loop {
            ticker.tick().await;
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs() as i64)
                .unwrap_or_default();
            let removed = cache.sweep(now).await;
            debug!("Cache sweep removed {} listings", removed);
        }
    })
}
