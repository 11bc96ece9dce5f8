//! Patient HTTP executor for throttled provider operations
//!
//! Used for long-latency partner calls (uploading a file and waiting for a
//! generated link). Only HTTP 429 and 500 are retried, after a fixed delay;
//! every other failure gives up at once. Independent of the callback run
//! [`RetryPolicy`](super::RetryPolicy).

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

/// Retry settings for [`RetryingHttpExecutor`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpRetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Fixed sleep between attempts
    #[serde(with = "crate::duration_millis")]
    pub delay: Duration,

    /// Status codes that trigger a retry
    pub retry_statuses: Vec<u16>,

    /// Per-request timeout
    #[serde(with = "crate::duration_millis")]
    pub request_timeout: Duration,
}

impl Default for HttpRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(20),
            retry_statuses: vec![429, 500],
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl HttpRetryConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn should_retry(&self, status: StatusCode) -> bool {
        self.retry_statuses.contains(&status.as_u16())
    }
}

/// Request body; rebuilt for every attempt
#[derive(Debug, Clone)]
pub enum ProviderBody {
    Empty,
    Json(Value),
    /// A single file upload field
    File {
        field: String,
        file_name: String,
        content_type: String,
        bytes: Vec<u8>,
    },
}

/// Outbound request to a partner API
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: ProviderBody,
    /// JSON pointer selecting the result from the response body
    pub extract: Option<String>,
}

impl ProviderRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: ProviderBody::Empty,
            extract: None,
        }
    }

    /// POST with a JSON body
    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, url).with_body(ProviderBody::Json(body))
    }

    /// POST a file as multipart form data
    pub fn post_file(
        url: impl Into<String>,
        field: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self::new(Method::POST, url).with_body(ProviderBody::File {
            field: field.into(),
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes,
        })
    }

    pub fn with_body(mut self, body: ProviderBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Return only the value at this JSON pointer (e.g. `/data/reward_link_url`)
    pub fn extracting(mut self, pointer: impl Into<String>) -> Self {
        self.extract = Some(pointer.into());
        self
    }
}

/// HTTP client whose requests time out after `timeout`
///
/// If the TLS backend cannot be initialized the error is logged and a client
/// without the timeout is returned.
pub(crate) fn client_with_timeout(timeout: Duration) -> reqwest::Client {
    match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            error!(
                error = %e,
                timeout_ms = timeout.as_millis() as u64,
                "failed to build HTTP client, falling back to one without timeout"
            );
            reqwest::Client::new()
        }
    }
}

/// Bounded, fixed-delay retry around a single provider call
///
/// # Example
///
/// ```ignore
/// let executor = RetryingHttpExecutor::new(HttpRetryConfig::default());
///
/// let request = ProviderRequest::post_file(url, "file", "participants.csv", "text/csv", csv)
///     .with_header("x-api-key", api_key)
///     .extracting("/data/reward_link_url");
///
/// let link = executor.send(&request).await; // None if the provider never delivered
/// ```
#[derive(Debug, Clone)]
pub struct RetryingHttpExecutor {
    client: reqwest::Client,
    config: HttpRetryConfig,
}

impl RetryingHttpExecutor {
    pub fn new(config: HttpRetryConfig) -> Self {
        let client = client_with_timeout(config.request_timeout);
        Self { client, config }
    }

    /// Reuse an existing HTTP client
    pub fn with_client(client: reqwest::Client, config: HttpRetryConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &HttpRetryConfig {
        &self.config
    }

    /// Perform the call, retrying throttled/unavailable responses
    ///
    /// Returns `None` on any non-retryable failure, on a response body that
    /// is not the expected JSON, or once every attempt was used.
    #[instrument(skip(self, request), fields(url = %request.url))]
    pub async fn send(&self, request: &ProviderRequest) -> Option<Value> {
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let builder = match self.build(request) {
                Ok(builder) => builder,
                Err(e) => {
                    error!(error = %e, "failed to build provider request");
                    return None;
                }
            };

            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) => {
                    error!(attempt, error = %e, "provider request failed");
                    return None;
                }
            };

            let status = response.status();
            if status.is_success() {
                debug!(attempt, status = status.as_u16(), "provider call succeeded");
                return Self::read_result(response, request.extract.as_deref()).await;
            }

            if !self.config.should_retry(status) {
                let body = response.text().await.unwrap_or_default();
                error!(status = status.as_u16(), body = %body, "provider call failed");
                return None;
            }

            if attempt >= max_attempts {
                error!(
                    attempts = attempt,
                    status = status.as_u16(),
                    "max retries reached for provider call"
                );
                return None;
            }

            warn!(
                attempt,
                status = status.as_u16(),
                delay_ms = self.config.delay.as_millis() as u64,
                "provider throttled or unavailable, retrying"
            );
            tokio::time::sleep(self.config.delay).await;
        }

        None
    }

    fn build(&self, request: &ProviderRequest) -> Result<RequestBuilder, reqwest::Error> {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match &request.body {
            ProviderBody::Empty => builder,
            ProviderBody::Json(body) => builder.json(body),
            ProviderBody::File {
                field,
                file_name,
                content_type,
                bytes,
            } => {
                let part = Part::bytes(bytes.clone())
                    .file_name(file_name.clone())
                    .mime_str(content_type)?;
                builder.multipart(Form::new().part(field.clone(), part))
            }
        };

        Ok(builder)
    }

    async fn read_result(response: reqwest::Response, extract: Option<&str>) -> Option<Value> {
        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "provider response is not JSON");
                return None;
            }
        };

        match extract {
            None => Some(body),
            Some(pointer) => match body.pointer(pointer) {
                Some(value) if !value.is_null() => Some(value.clone()),
                _ => {
                    error!(pointer, response = %body, "unrecognized provider response");
                    None
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_executor() -> RetryingHttpExecutor {
        RetryingHttpExecutor::new(
            HttpRetryConfig::default().with_delay(Duration::from_millis(10)),
        )
    }

    #[test]
    fn test_default_config() {
        let config = HttpRetryConfig::default();
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.delay, Duration::from_secs(20));
        assert!(config.should_retry(StatusCode::TOO_MANY_REQUESTS));
        assert!(config.should_retry(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!config.should_retry(StatusCode::BAD_GATEWAY));
        assert!(!config.should_retry(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn test_constant_429_stops_after_ten_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .expect(10)
            .mount(&server)
            .await;

        let request = ProviderRequest::post_json(server.uri(), json!({"a": 1}));
        assert_eq!(create_test_executor().send(&request).await, None);
    }

    #[tokio::test]
    async fn test_400_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let request = ProviderRequest::post_json(server.uri(), json!({}));
        assert_eq!(create_test_executor().send(&request).await, None);
    }

    #[tokio::test]
    async fn test_recovers_after_500() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let request = ProviderRequest::post_json(server.uri(), json!({}));
        assert_eq!(
            create_test_executor().send(&request).await,
            Some(json!({"ok": true}))
        );
    }

    #[tokio::test]
    async fn test_extracts_link_from_file_upload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/activities/7/allowlist/telegram-ids"))
            .and(header("x-api-key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {"reward_link_url": "https://example.test/r/abc"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = ProviderRequest::post_file(
            format!("{}/activities/7/allowlist/telegram-ids", server.uri()),
            "file",
            "participants.csv",
            "text/csv",
            b"telegram_id\n1\n2\n".to_vec(),
        )
        .with_header("x-api-key", "secret")
        .extracting("/data/reward_link_url");

        assert_eq!(
            create_test_executor().send(&request).await,
            Some(json!("https://example.test/r/abc"))
        );
    }

    #[tokio::test]
    async fn test_unrecognized_response_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "error"})))
            .mount(&server)
            .await;

        let request = ProviderRequest::new(Method::GET, server.uri()).extracting("/data/link");
        assert_eq!(create_test_executor().send(&request).await, None);
    }

    #[tokio::test]
    async fn test_request_timeout_is_applied() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": true}))
                    .set_delay(Duration::from_secs(5)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let executor = RetryingHttpExecutor::new(HttpRetryConfig {
            request_timeout: Duration::from_millis(200),
            ..HttpRetryConfig::default()
        });
        let request = ProviderRequest::post_json(server.uri(), json!({}));

        let started = std::time::Instant::now();
        assert_eq!(executor.send(&request).await, None);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_transport_error_is_not_retried() {
        // Nothing listens on the discard port
        let request = ProviderRequest::post_json("http://127.0.0.1:9/upload", json!({}));
        assert_eq!(create_test_executor().send(&request).await, None);
    }
}
