use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

/// Rolling totals over every Reddit request the client sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rate_limited_requests: u64,
    pub total_response_time: Duration,
    pub last_request_time: Option<SystemTime>,
    /// Keyed by endpoint kind (`about`, `top`, `new`, ...), not by full path
    pub requests_by_endpoint: BTreeMap<String, EndpointMetrics>,
    /// Failures keyed by error code, e.g. `REDDIT_SERVER_ERROR`
    pub failures_by_code: BTreeMap<String, u64>,
}

impl ApiMetrics {
    pub fn average_response_time(&self) -> Duration {
        average(self.total_response_time, self.total_requests)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub total_response_time: Duration,
    /// `None` until the first request completes
    pub fastest: Option<Duration>,
    pub slowest: Duration,
    pub last_status: Option<u16>,
}

impl EndpointMetrics {
    pub fn average_response_time(&self) -> Duration {
        average(self.total_response_time, self.request_count)
    }

    pub fn success_rate(&self) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }
        (self.request_count - self.error_count) as f64 / self.request_count as f64
    }
}

fn average(total: Duration, count: u64) -> Duration {
    match u32::try_from(count) {
        Ok(0) => Duration::ZERO,
        Ok(count) => total / count,
        Err(_) => Duration::from_secs_f64(total.as_secs_f64() / count as f64),
    }
}

/// One finished HTTP request.
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    pub endpoint: String,
    /// Absent when the request never got a response
    pub status_code: Option<u16>,
    pub response_time: Duration,
    /// Error code of the failure, `None` on success
    pub error_code: Option<&'static str>,
}

impl RequestMetrics {
    pub fn succeeded(&self) -> bool {
        self.error_code.is_none()
    }

    pub fn rate_limited(&self) -> bool {
        self.status_code == Some(429)
    }
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
    metrics: RwLock<ApiMetrics>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_request(&self, request: RequestMetrics) {
        let mut metrics = self.metrics.write().await;

        metrics.total_requests += 1;
        metrics.total_response_time += request.response_time;
        metrics.last_request_time = Some(SystemTime::now());

        match request.error_code {
            None => metrics.successful_requests += 1,
            Some(code) => {
                metrics.failed_requests += 1;
                *metrics.failures_by_code.entry(code.to_string()).or_default() += 1;
            }
        }
        if request.rate_limited() {
            metrics.rate_limited_requests += 1;
        }

        let endpoint = metrics
            .requests_by_endpoint
            .entry(request.endpoint.clone())
            .or_default();
        endpoint.request_count += 1;
        endpoint.total_response_time += request.response_time;
        endpoint.fastest = Some(
            endpoint
                .fastest
                .map_or(request.response_time, |fastest| fastest.min(request.response_time)),
        );
        endpoint.slowest = endpoint.slowest.max(request.response_time);
        endpoint.last_status = request.status_code;
        if !request.succeeded() {
            endpoint.error_count += 1;
        }
    }

    pub async fn get_metrics(&self) -> ApiMetrics {
        self.metrics.read().await.clone()
    }

    pub async fn get_endpoint_metrics(&self, endpoint: &str) -> Option<EndpointMetrics> {
        self.metrics
            .read()
            .await
            .requests_by_endpoint
            .get(endpoint)
            .cloned()
    }

    pub async fn reset_metrics(&self) {
        *self.metrics.write().await = ApiMetrics::default();
    }

    pub async fn export_metrics(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.get_metrics().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(endpoint: &str, status: u16, millis: u64) -> RequestMetrics {
        let error_code = match status {
            429 => Some("REDDIT_RATE_LIMIT"),
            s if s >= 500 => Some("REDDIT_SERVER_ERROR"),
            _ => None,
        };
        RequestMetrics {
            endpoint: endpoint.to_string(),
            status_code: Some(status),
            response_time: Duration::from_millis(millis),
            error_code,
        }
    }

    #[tokio::test]
    async fn test_totals_and_failure_codes() {
        let collector = MetricsCollector::new();

        collector.record_request(request("about", 200, 100)).await;
        collector.record_request(request("top", 429, 300)).await;
        collector.record_request(request("top", 503, 200)).await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 1);
        assert_eq!(metrics.failed_requests, 2);
        assert_eq!(metrics.rate_limited_requests, 1);
        assert_eq!(metrics.average_response_time(), Duration::from_millis(200));
        assert_eq!(metrics.failures_by_code["REDDIT_SERVER_ERROR"], 1);
        assert!(metrics.last_request_time.is_some());
    }

    #[tokio::test]
    async fn test_endpoint_metrics() {
        let collector = MetricsCollector::new();

        collector.record_request(request("new", 200, 100)).await;
        collector.record_request(request("new", 503, 50)).await;

        let endpoint = collector.get_endpoint_metrics("new").await.unwrap();
        assert_eq!(endpoint.request_count, 2);
        assert_eq!(endpoint.error_count, 1);
        assert_eq!(endpoint.fastest, Some(Duration::from_millis(50)));
        assert_eq!(endpoint.slowest, Duration::from_millis(100));
        assert_eq!(endpoint.last_status, Some(503));
        assert_eq!(endpoint.success_rate(), 0.5);

        assert!(collector.get_endpoint_metrics("hot").await.is_none());
    }

    #[tokio::test]
    async fn test_export_and_reset() {
        let collector = MetricsCollector::new();
        collector.record_request(request("about", 200, 10)).await;

        let exported = collector.export_metrics().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&exported).unwrap();
        assert_eq!(value["requests_by_endpoint"]["about"]["request_count"], 1);

        collector.reset_metrics().await;
        assert_eq!(collector.get_metrics().await.total_requests, 0);
    }
}
