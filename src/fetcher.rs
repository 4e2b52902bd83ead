use anyhow::{Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const BASE_BACKOFF: Duration = Duration::from_millis(300);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("Request timeout")]
    Timeout,
    #[error("HTTP error {0}")]
    Status(u16),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Invalid response body: {0}")]
    Decode(String),
    #[error("Request cancelled")]
    Cancelled,
    #[error("Response body exceeds {0} bytes")]
    TooLarge(usize),
}

impl FetchError {
    /// Timeouts, transport failures and 5xx/429 responses are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Network(_) => true,
            FetchError::Status(code) => *code >= 500 || *code == 429,
            FetchError::Decode(_) | FetchError::Cancelled | FetchError::TooLarge(_) => false,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    /// Total number of attempts, including the first one.
    pub retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retries: 2,
        }
    }
}

/// Delay to wait after the failed attempt with the given zero-based index.
pub fn backoff_delay(attempt: u32) -> Duration {
    BASE_BACKOFF.saturating_mul(1u32 << attempt.min(16))
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(policy: RetryPolicy) -> Result<Self> {
        let user_agent = format!("cinerails/{}", env!("CARGO_PKG_VERSION"));
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(user_agent)
            .build()
            .context("Failed to build upstream HTTP client")?;
        Ok(Self { client, policy })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        self.get_json_cancellable(url, &CancellationToken::new())
            .await
    }

    pub async fn get_json_cancellable<T: DeserializeOwned>(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<T, FetchError> {
        let body = self.get_bytes_cancellable(url, cancel).await?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }

    /// Downloads a body of at most `max_bytes`; larger bodies fail with
    /// [`FetchError::TooLarge`] without being buffered.
    pub async fn get_bytes_capped(&self, url: &str, max_bytes: usize) -> Result<Vec<u8>, FetchError> {
        self.fetch(url, &CancellationToken::new(), Some(max_bytes))
            .await
    }

    pub async fn get_bytes_cancellable(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError> {
        self.fetch(url, cancel, None).await
    }

    async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
        limit: Option<usize>,
    ) -> Result<Vec<u8>, FetchError> {
        let attempts = self.policy.retries.max(1);
        let mut last_error = FetchError::Network("no attempt made".to_string());

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = backoff_delay(attempt - 1);
                debug!(
                    url = %url,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying upstream request"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                res = self.attempt(url, limit) => res,
            };

            match outcome {
                Ok(body) => return Ok(body),
                Err(err) if err.is_retryable() => {
                    warn!(
                        "Request to {} failed (attempt {}/{}): {}",
                        url,
                        attempt + 1,
                        attempts,
                        err
                    );
                    last_error = err;
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error)
    }

    async fn attempt(&self, url: &str, limit: Option<usize>) -> Result<Vec<u8>, FetchError> {
        let request = async {
            let mut res = self
                .client
                .get(url)
                .send()
                .await
                .map_err(FetchError::from_reqwest)?;
            let status = res.status();
            if !status.is_success() {
                return Err(FetchError::Status(status.as_u16()));
            }
            let Some(limit) = limit else {
                return res
                    .bytes()
                    .await
                    .map(|b| b.to_vec())
                    .map_err(FetchError::from_reqwest);
            };
            if res.content_length().is_some_and(|len| len > limit as u64) {
                return Err(FetchError::TooLarge(limit));
            }
            let mut body = Vec::new();
            while let Some(chunk) = res.chunk().await.map_err(FetchError::from_reqwest)? {
                if body.len() + chunk.len() > limit {
                    return Err(FetchError::TooLarge(limit));
                }
                body.extend_from_slice(&chunk);
            }
            Ok(body)
        };
        match tokio::time::timeout(self.policy.timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Json, Router};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn counting_router(hits: Arc<AtomicUsize>) -> Router {
        let failing = hits.clone();
        let missing = hits.clone();
        let slow = hits.clone();
        let large = hits.clone();
        let ok = hits;
        Router::new()
            .route(
                "/large",
                get(move || {
                    let hits = large.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        vec![0u8; 4096]
                    }
                }),
            )
            .route(
                "/fail",
                get(move || {
                    let hits = failing.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                }),
            )
            .route(
                "/missing",
                get(move || {
                    let hits = missing.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        StatusCode::NOT_FOUND
                    }
                }),
            )
            .route(
                "/slow",
                get(move || {
                    let hits = slow.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        Json(json!({"late": true}))
                    }
                }),
            )
            .route(
                "/ok",
                get(move || {
                    let hits = ok.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Json(json!({"type": "list", "channels": [{"id": 1}]}))
                    }
                }),
            )
    }

    fn fetcher(timeout_ms: u64, retries: u32) -> Fetcher {
        Fetcher::new(RetryPolicy {
            timeout: Duration::from_millis(timeout_ms),
            retries,
        })
        .unwrap()
    }

    #[test]
    fn backoff_doubles_from_300ms() {
        assert_eq!(backoff_delay(0), Duration::from_millis(300));
        assert_eq!(backoff_delay(1), Duration::from_millis(600));
        assert_eq!(backoff_delay(2), Duration::from_millis(1200));
    }

    #[tokio::test]
    async fn failing_endpoint_is_attempted_exactly_retries_times() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(counting_router(hits.clone())).await;

        let started = Instant::now();
        let err = fetcher(2_000, 2)
            .get_json::<Value>(&format!("{base}/fail"))
            .await
            .unwrap_err();

        assert_eq!(err, FetchError::Status(500));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(counting_router(hits.clone())).await;

        let err = fetcher(2_000, 3)
            .get_json::<Value>(&format!("{base}/missing"))
            .await
            .unwrap_err();

        assert_eq!(err, FetchError::Status(404));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_endpoint_reports_timeout() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(counting_router(hits)).await;

        let err = fetcher(50, 1)
            .get_json::<Value>(&format!("{base}/slow"))
            .await
            .unwrap_err();

        assert_eq!(err, FetchError::Timeout);
        assert_eq!(err.to_string(), "Request timeout");
    }

    #[tokio::test]
    async fn decodes_json_on_success() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(counting_router(hits.clone())).await;

        let body: Value = fetcher(2_000, 2)
            .get_json(&format!("{base}/ok"))
            .await
            .unwrap();

        assert_eq!(body["channels"][0]["id"], 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected_without_retry() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(counting_router(hits.clone())).await;
        let client = fetcher(2_000, 3);

        let err = client
            .get_bytes_capped(&format!("{base}/large"), 1024)
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::TooLarge(1024));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let body = client
            .get_bytes_capped(&format!("{base}/large"), 8192)
            .await
            .unwrap();
        assert_eq!(body.len(), 4096);
    }

    #[tokio::test]
    async fn cancellation_stops_retry_loop() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(counting_router(hits)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fetcher(2_000, 3)
            .get_json_cancellable::<Value>(&format!("{base}/ok"), &cancel)
            .await
            .unwrap_err();

        assert_eq!(err, FetchError::Cancelled);
    }
}
