use crate::metrics::{MetricsCollector, RequestMetrics};
use reddimon_core::{
    normalize_subreddit, CoreError, ErrorExt, ListingKind, PostCounters, RedditApiError, RedditPost,
    SubredditAbout,
};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

pub const REDDIT_API_BASE: &str = "https://oauth.reddit.com";

const DEFAULT_RATE_LIMIT_WAIT_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditListing<T> {
    pub kind: String,
    pub data: RedditListingData<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditListingData<T> {
    pub children: Vec<RedditListingChild<T>>,
    #[serde(default)]
    pub after: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditListingChild<T> {
    pub kind: String,
    pub data: T,
}

/// Post fields shared by every listing; Reddit omits some on removed posts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditPostData {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub selftext: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub created_utc: f64,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub ups: i64,
    #[serde(default)]
    pub num_comments: i64,
}

impl From<&RedditPostData> for PostCounters {
    fn from(post: &RedditPostData) -> Self {
        Self {
            id: post.id.clone(),
            ups: post.ups,
            num_comments: post.num_comments,
            created_utc: post.created_utc as i64,
        }
    }
}

impl From<RedditPostData> for RedditPost {
    fn from(post: RedditPostData) -> Self {
        Self {
            id: post.id,
            title: post.title,
            selftext: post.selftext,
            url: post.url,
            score: post.score,
            num_comments: post.num_comments,
            created_utc: post.created_utc as i64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditSubredditData {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub subscribers: Option<u64>,
    #[serde(default)]
    pub active_user_count: Option<u64>,
}

impl From<&RedditSubredditData> for SubredditAbout {
    fn from(data: &RedditSubredditData) -> Self {
        Self {
            active_users: data.active_user_count.unwrap_or(0),
            subscribers: data.subscribers.unwrap_or(0),
        }
    }
}

/// One page of a listing plus the cursor for the next one.
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub posts: Vec<RedditPostData>,
    pub after: Option<String>,
}

/// Maps a non-success status onto the error the rest of the system understands.
pub fn error_for_status(
    status: StatusCode,
    retry_after: Option<&str>,
    subreddit: Option<&str>,
    endpoint: &str,
) -> CoreError {
    let reddit_error = match status.as_u16() {
        401 => RedditApiError::InvalidToken,
        403 => RedditApiError::Forbidden {
            resource: endpoint.to_string(),
        },
        404 => match subreddit {
            Some(name) => RedditApiError::SubredditNotFound {
                subreddit: name.to_string(),
            },
            None => RedditApiError::InvalidResponse {
                details: format!("{} not found", endpoint),
            },
        },
        429 => RedditApiError::RateLimitExceeded {
            retry_after: retry_after
                .and_then(|value| value.trim().parse::<f64>().ok())
                .map(|seconds| seconds.ceil() as u64)
                .unwrap_or(DEFAULT_RATE_LIMIT_WAIT_SECS),
        },
        code if status.is_server_error() => RedditApiError::ServerError { status_code: code },
        code => RedditApiError::InvalidResponse {
            details: format!("unexpected status {} for {}", code, endpoint),
        },
    };
    CoreError::RedditApi(reddit_error)
}

/// Thin typed wrapper over Reddit's OAuth endpoints. Holds no auth state;
/// callers pass the bearer token.
#[derive(Debug)]
pub struct RedditApiClient {
    http: Client,
    base_url: String,
    metrics: Arc<MetricsCollector>,
}

impl RedditApiClient {
    pub fn new(http: Client, base_url: impl Into<String>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            metrics,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        access_token: &str,
        path: &str,
        query: &[(&str, String)],
        metrics_key: &str,
        subreddit: Option<&str>,
    ) -> Result<T, CoreError> {
        let url = format!("{}{}", self.base_url, path);
        let started = Instant::now();
        debug!("GET {}", path);

        let result = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .query(query)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                error!("Network error for {}: {}", path, e);
                let error = if e.is_timeout() {
                    CoreError::RedditApi(RedditApiError::RequestTimeout)
                } else {
                    CoreError::Network(e)
                };
                self.record(metrics_key, None, started, Some(&error)).await;
                return Err(error);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok());
            let error = error_for_status(status, retry_after, subreddit, path);
            self.record(metrics_key, Some(status), started, Some(&error)).await;
            warn!("Request to {} failed with {}: {}", path, status, error);
            return Err(error);
        }
        self.record(metrics_key, Some(status), started, None).await;

        response.json::<T>().await.map_err(|e| {
            error!("Failed to parse response from {}: {}", path, e);
            CoreError::RedditApi(RedditApiError::InvalidResponse {
                details: format!("Failed to parse {}: {}", path, e),
            })
        })
    }

    async fn record(
        &self,
        endpoint: &str,
        status: Option<StatusCode>,
        started: Instant,
        error: Option<&CoreError>,
    ) {
        let error_code = error.map(|e| match e {
            CoreError::RedditApi(reddit) => reddit.error_code(),
            other => other.error_code(),
        });
        self.metrics
            .record_request(RequestMetrics {
                endpoint: endpoint.to_string(),
                status_code: status.map(|s| s.as_u16()),
                response_time: started.elapsed(),
                error_code,
            })
            .await;
    }

    pub async fn subreddit_about(
        &self,
        access_token: &str,
        subreddit: &str,
    ) -> Result<SubredditAbout, CoreError> {
        let subreddit = normalize_subreddit(subreddit)?;
        let path = format!("/r/{}/about", subreddit);
        let about: RedditListingChild<RedditSubredditData> = self
            .get_json(
                access_token,
                &path,
                &[("raw_json", "1".to_string())],
                "about",
                Some(subreddit.as_str()),
            )
            .await?;

        Ok(SubredditAbout::from(&about.data))
    }

    pub async fn listing(
        &self,
        access_token: &str,
        subreddit: &str,
        kind: ListingKind,
        limit: u32,
        after: Option<&str>,
    ) -> Result<ListingPage, CoreError> {
        let subreddit = normalize_subreddit(subreddit)?;
        let path = format!("/r/{}/{}", subreddit, kind.path_segment());
        let mut query = vec![("limit", limit.to_string()), ("raw_json", "1".to_string())];
        if let Some(filter) = kind.time_filter() {
            query.push(("t", filter.as_str().to_string()));
        }
        if let Some(cursor) = after {
            query.push(("after", cursor.to_string()));
        }

        let listing: RedditListing<RedditPostData> = self
            .get_json(access_token, &path, &query, kind.path_segment(), Some(subreddit.as_str()))
            .await?;

        debug!(
            "Retrieved {} posts from r/{} ({})",
            listing.data.children.len(),
            subreddit,
            kind
        );

        Ok(ListingPage {
            posts: listing
                .data
                .children
                .into_iter()
                .map(|child| child.data)
                .collect(),
            after: listing.data.after.filter(|cursor| !cursor.is_empty()),
        })
    }

    pub async fn search_subreddits(
        &self,
        access_token: &str,
        query: &str,
        limit: u32,
    ) -> Result<Vec<String>, CoreError> {
        let params = [("q", query.to_string()), ("limit", limit.to_string())];
        let listing: RedditListing<RedditSubredditData> = self
            .get_json(access_token, "/subreddits/search", &params, "search", None)
            .await?;

        Ok(listing
            .data
            .children
            .into_iter()
            .map(|child| child.data.display_name)
            .filter(|name| !name.is_empty())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let not_found = error_for_status(StatusCode::NOT_FOUND, None, Some("nope"), "/r/nope/about");
        assert!(matches!(
            not_found,
            CoreError::RedditApi(RedditApiError::SubredditNotFound { ref subreddit }) if subreddit == "nope"
        ));

        let unauthorized = error_for_status(StatusCode::UNAUTHORIZED, None, None, "/r/x/hot");
        assert!(matches!(unauthorized, CoreError::RedditApi(RedditApiError::InvalidToken)));

        let forbidden = error_for_status(StatusCode::FORBIDDEN, None, Some("private"), "/r/private/new");
        assert!(matches!(forbidden, CoreError::RedditApi(RedditApiError::Forbidden { .. })));

        let gateway = error_for_status(StatusCode::BAD_GATEWAY, None, None, "/r/x/hot");
        assert!(matches!(
            gateway,
            CoreError::RedditApi(RedditApiError::ServerError { status_code: 502 })
        ));
    }

    #[test]
    fn test_rate_limit_reads_retry_after() {
        let limited = error_for_status(StatusCode::TOO_MANY_REQUESTS, Some("12.4"), None, "/r/x/new");
        assert!(matches!(
            limited,
            CoreError::RedditApi(RedditApiError::RateLimitExceeded { retry_after: 13 })
        ));

        let default_wait = error_for_status(StatusCode::TOO_MANY_REQUESTS, Some("soon"), None, "/r/x/new");
        assert!(matches!(
            default_wait,
            CoreError::RedditApi(RedditApiError::RateLimitExceeded { retry_after: 60 })
        ));
    }

    #[test]
    fn test_listing_parsing_tolerates_missing_fields() {
        let body = r#"{
            "kind": "Listing",
            "data": {
                "after": "t3_b",
                "children": [
                    {"kind": "t3", "data": {"id": "a", "name": "t3_a", "ups": 10, "num_comments": 2, "created_utc": 1700000000.0, "title": "Hello"}},
                    {"kind": "t3", "data": {"id": "b"}}
                ]
            }
        }"#;

        let listing: RedditListing<RedditPostData> = serde_json::from_str(body).unwrap();
        assert_eq!(listing.data.after.as_deref(), Some("t3_b"));

        let counters: Vec<PostCounters> = listing.data.children.iter().map(|c| (&c.data).into()).collect();
        assert_eq!(
            counters[0],
            PostCounters {
                id: "a".to_string(),
                ups: 10,
                num_comments: 2,
                created_utc: 1_700_000_000,
            }
        );
        assert_eq!(counters[1].ups, 0);
    }

    #[test]
    fn test_about_defaults_missing_counts_to_zero() {
        let body = r#"{"kind": "t5", "data": {"display_name": "rust", "subscribers": 250000, "active_user_count": null}}"#;
        let about: RedditListingChild<RedditSubredditData> = serde_json::from_str(body).unwrap();

        let about = SubredditAbout::from(&about.data);
        assert_eq!(about.subscribers, 250_000);
        assert_eq!(about.active_users, 0);
    }
}
