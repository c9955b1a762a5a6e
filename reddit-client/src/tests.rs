#[cfg(test)]
mod tests {
    use crate::{ClientOptions, RedditClient, RedditCredentials, RetryPolicy};
    use reddimon_core::{CoreError, ListingKind, RedditApiError, TimeFilter};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const TOKEN_BODY: &str =
        r#"{"access_token":"test-token","token_type":"bearer","expires_in":3600,"scope":"*"}"#;

    #[derive(Debug, Clone)]
    struct MockRequest {
        method: String,
        target: String,
        head: String,
    }

    type Responder = Arc<dyn Fn(&MockRequest) -> (u16, String) + Send + Sync>;

    /// Minimal HTTP/1.1 responder: one request per connection.
    struct MockReddit {
        base_url: String,
        requests: Arc<Mutex<Vec<MockRequest>>>,
    }

    impl MockReddit {
        async fn start(
            responder: impl Fn(&MockRequest) -> (u16, String) + Send + Sync + 'static,
        ) -> Self {
            let responder: Responder = Arc::new(responder);
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base_url = format!("http://{}", listener.local_addr().unwrap());
            let requests = Arc::new(Mutex::new(Vec::new()));

            let recorded = requests.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let responder = responder.clone();
                    let recorded = recorded.clone();
                    tokio::spawn(async move {
                        let _ = serve(stream, responder, recorded).await;
                    });
                }
            });

            Self { base_url, requests }
        }

        fn options(&self) -> ClientOptions {
            ClientOptions {
                request_delay: Duration::ZERO,
                use_system_proxy: false,
                retry: RetryPolicy {
                    base_delay: Duration::from_millis(1),
                    ..RetryPolicy::reddit()
                },
                api_base_url: self.base_url.clone(),
                token_url: format!("{}/api/v1/access_token", self.base_url),
                ..ClientOptions::default()
            }
        }

        fn client(&self) -> RedditClient {
            self.client_with(self.options())
        }

        fn client_with(&self, options: ClientOptions) -> RedditClient {
            let credentials =
                RedditCredentials::new("id", "secret", "bot", "hunter2", "web:reddimon:test")
                    .unwrap();
            RedditClient::new(credentials, options).unwrap()
        }

        fn api_requests(&self) -> Vec<MockRequest> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| !r.target.starts_with("/api/v1/access_token"))
                .cloned()
                .collect()
        }

        fn token_requests(&self) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.target.starts_with("/api/v1/access_token"))
                .count()
        }
    }

    async fn serve(
        mut stream: TcpStream,
        responder: Responder,
        recorded: Arc<Mutex<Vec<MockRequest>>>,
    ) -> std::io::Result<()> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];

        let header_end = loop {
            let read = stream.read(&mut chunk).await?;
            if read == 0 {
                return Ok(());
            }
            buffer.extend_from_slice(&chunk[..read]);
            if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
        let content_length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);

        while buffer.len() < header_end + content_length {
            let read = stream.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
        }

        let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
        let request = MockRequest {
            method: request_line.next().unwrap_or_default().to_string(),
            target: request_line.next().unwrap_or_default().to_string(),
            head: head.to_lowercase(),
        };

        let (status, body) = if request.target.starts_with("/api/v1/access_token") {
            (200, TOKEN_BODY.to_string())
        } else {
            responder(&request)
        };
        recorded.lock().unwrap().push(request);

        let response = format!(
            "HTTP/1.1 {} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    }

    fn about_body(active: u64, subscribers: u64) -> String {
        format!(
            r#"{{"kind":"t5","data":{{"display_name":"rust","active_user_count":{},"subscribers":{}}}}}"#,
            active, subscribers
        )
    }

    fn listing_body(ids: &[String], after: Option<&str>) -> String {
        let children: Vec<String> = ids
            .iter()
            .map(|id| {
                format!(
                    r#"{{"kind":"t3","data":{{"id":"{id}","name":"t3_{id}","title":"Post {id}","ups":5,"score":5,"num_comments":1,"created_utc":1700000000.0}}}}"#,
                    id = id
                )
            })
            .collect();
        let after = after
            .map(|cursor| format!(r#""{}""#, cursor))
            .unwrap_or_else(|| "null".to_string());
        format!(
            r#"{{"kind":"Listing","data":{{"after":{},"children":[{}]}}}}"#,
            after,
            children.join(",")
        )
    }

    fn ids(range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|i| format!("p{}", i)).collect()
    }

    #[tokio::test]
    async fn test_fetch_about_authenticates_once() {
        let server = MockReddit::start(|_| (200, about_body(42, 1000))).await;
        let client = server.client();

        let about = client.fetch_about("rust").await.unwrap();
        assert_eq!(about.active_users, 42);
        assert_eq!(about.subscribers, 1000);

        client.fetch_about("rust").await.unwrap();
        assert_eq!(server.token_requests(), 1);

        let requests = server.api_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].method, "GET");
        assert!(requests[0].target.starts_with("/r/rust/about"));
        assert!(requests[0].head.contains("authorization: bearer test-token"));
        assert!(requests[0].head.contains("user-agent: web:reddimon:test"));
    }

    #[tokio::test]
    async fn test_listing_request_shape() {
        let server = MockReddit::start(|_| (200, listing_body(&ids(0..3), None))).await;
        let client = server.client();

        let posts = client
            .fetch_listing("rust", ListingKind::Top(TimeFilter::Week), 100)
            .await
            .unwrap();
        assert_eq!(posts.len(), 3);
        assert_eq!(posts[0].id, "p0");
        assert_eq!(posts[0].ups, 5);

        let target = &server.api_requests()[0].target;
        assert!(target.starts_with("/r/rust/top"));
        assert!(target.contains("limit=100"));
        assert!(target.contains("t=week"));
    }

    #[tokio::test]
    async fn test_gateway_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let server = MockReddit::start(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                (503, "{}".to_string())
            } else {
                (200, listing_body(&ids(0..1), None))
            }
        })
        .await;
        let client = server.client();

        let posts = client.fetch_listing("rust", ListingKind::Hot, 50).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(client.retry_metrics().recovered_operations, 1);

        let metrics = client.request_metrics().await;
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.failed_requests, 2);
        assert_eq!(metrics.failures_by_code["REDDIT_SERVER_ERROR"], 2);
    }

    #[tokio::test]
    async fn test_missing_subreddit_is_not_retried() {
        let server = MockReddit::start(|_| (404, r#"{"error":404}"#.to_string())).await;
        let client = server.client();

        let result = client.fetch_about("doesnotexist").await;
        assert!(matches!(
            result,
            Err(CoreError::RedditApi(RedditApiError::SubredditNotFound { ref subreddit })) if subreddit == "doesnotexist"
        ));
        assert_eq!(server.api_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_token_is_refreshed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let server = MockReddit::start(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                (401, "{}".to_string())
            } else {
                (200, about_body(1, 2))
            }
        })
        .await;
        let client = server.client();

        client.fetch_about("rust").await.unwrap();
        assert_eq!(server.token_requests(), 2);
    }

    #[tokio::test]
    async fn test_new_posts_follow_cursors_and_cache() {
        let server = MockReddit::start(|request| {
            if request.target.contains("after=t3_p24") {
                (200, listing_body(&ids(25..30), None))
            } else {
                (200, listing_body(&ids(0..25), Some("t3_p24")))
            }
        })
        .await;
        let client = server.client();

        let posts = client.fetch_new_posts("rust", 30).await.unwrap();
        assert_eq!(posts.len(), 30);
        assert_eq!(posts[29].id, "p29");

        let requests = server.api_requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].target.contains("limit=25"));
        assert!(requests[1].target.contains("limit=5"));

        // Same subreddit and limit within the TTL comes from cache
        let cached = client.fetch_new_posts("Rust", 30).await.unwrap();
        assert_eq!(cached.len(), 30);
        assert_eq!(server.api_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_serves_stale_posts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let server = MockReddit::start(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                (200, listing_body(&ids(0..3), None))
            } else {
                (500, "{}".to_string())
            }
        })
        .await;
        let client = server.client_with(ClientOptions {
            cache_ttl: Duration::ZERO,
            ..server.options()
        });

        let fresh = client.fetch_new_posts("rust", 10).await.unwrap();
        assert_eq!(fresh.len(), 3);

        let stale = client.fetch_new_posts("rust", 10).await.unwrap();
        assert_eq!(stale.len(), 3);
        assert_eq!(server.api_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_search_subreddits() {
        let server = MockReddit::start(|_| {
            (
                200,
                r#"{"kind":"Listing","data":{"after":null,"children":[
                    {"kind":"t5","data":{"display_name":"rust","subscribers":1}},
                    {"kind":"t5","data":{"display_name":"rust_gamedev","subscribers":1}}
                ]}}"#
                    .to_string(),
            )
        })
        .await;
        let client = server.client();

        let names = client.search_subreddits("rust", 5).await.unwrap();
        assert_eq!(names, vec!["rust".to_string(), "rust_gamedev".to_string()]);
        assert!(server.api_requests()[0].target.starts_with("/subreddits/search"));

        let empty = client.search_subreddits("   ", 5).await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(server.api_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_trending_posts_use_top_of_day() {
        let server = MockReddit::start(|_| {
            (
                200,
                r#"{"kind":"Listing","data":{"after":null,"children":[
                    {"kind":"t3","data":{"id":"a","title":"Quiet","score":3,"num_comments":0,"created_utc":1700000000.0}},
                    {"kind":"t3","data":{"id":"b","title":"Loud","score":40,"num_comments":12,"created_utc":1700000000.0}},
                    {"kind":"t3","data":{"id":"c","title":"Busy","score":10,"num_comments":30,"created_utc":1700000000.0}}
                ]}}"#
                    .to_string(),
            )
        })
        .await;
        let client = server.client();

        let posts = client.trending_posts("Rust").await.unwrap();
        let order: Vec<&str> = posts.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);

        let target = &server.api_requests()[0].target;
        assert!(target.starts_with("/r/rust/top"));
        assert!(target.contains("t=day"));
        assert!(target.contains("limit=10"));
    }

    #[tokio::test]
    async fn test_keyword_report_uses_top_of_week() {
        let server = MockReddit::start(|_| (200, listing_body(&ids(0..3), None))).await;
        let client = server.client();

        let keywords = client.keyword_report("rust").await.unwrap();
        assert_eq!(keywords.len(), 1);
        assert_eq!(keywords[0].keyword, "post");
        assert_eq!(keywords[0].count, 3);
        assert_eq!(keywords[0].engagement, 18);

        let target = &server.api_requests()[0].target;
        assert!(target.starts_with("/r/rust/top"));
        assert!(target.contains("t=week"));
        assert!(target.contains("limit=50"));
    }

    #[tokio::test]
    async fn test_invalid_names_never_reach_reddit() {
        let server = MockReddit::start(|_| (200, about_body(1, 2))).await;
        let client = server.client();

        for name in ["rust/../../api/v1/me", "rust?t=all", "x"] {
            let about = client.fetch_about(name).await;
            assert!(matches!(about, Err(CoreError::InvalidInput { .. })), "{name:?} accepted");

            let listing = client.fetch_listing(name, ListingKind::Hot, 10).await;
            assert!(matches!(listing, Err(CoreError::InvalidInput { .. })));

            let posts = client.fetch_new_posts(name, 10).await;
            assert!(matches!(posts, Err(CoreError::InvalidInput { .. })));
        }

        assert_eq!(server.token_requests(), 0);
        assert!(server.api_requests().is_empty());
        assert_eq!(client.queue_stats().completed + client.queue_stats().failed, 0);
    }

    #[tokio::test]
    async fn test_queue_stats_count_sent_requests() {
        let server = MockReddit::start(|_| (200, about_body(1, 2))).await;
        let client = server.client();

        client.fetch_about("rust").await.unwrap();
        client.fetch_about("golang").await.unwrap();

        let stats = client.queue_stats();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.pending, 0);
    }
}
