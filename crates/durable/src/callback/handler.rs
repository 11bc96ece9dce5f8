//! External task handlers and their typed registry

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, instrument, warn};

use super::model::{ApiName, HttpMethod, TaskFunction};
use crate::job::panic_message;
use crate::reliability::client_with_timeout;

/// What a handler reports back
///
/// `data` is stored verbatim as the run's response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerResult {
    pub success: bool,
    pub data: Value,
}

impl HandlerResult {
    pub fn success(data: Value) -> Self {
        Self { success: true, data }
    }

    pub fn failure(data: Value) -> Self {
        Self {
            success: false,
            data,
        }
    }
}

/// Error raised by a handler instead of returning a result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerError {
    pub message: String,

    /// Additional error details (for debugging)
    pub details: Option<Value>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Failure result recorded for this error
    pub fn into_result(self) -> HandlerResult {
        let mut error = json!({ "error": self.message });
        if let Some(details) = self.details {
            error["details"] = details;
        }
        HandlerResult::failure(error)
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

impl From<reqwest::Error> for HandlerError {
    fn from(err: reqwest::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Performs one call against an external API
///
/// Invoked at most once per attempt; retries are the recorder's business.
///
/// # Example
///
/// ```ignore
/// struct TicketHandler { client: TonfestClient }
///
/// #[async_trait]
/// impl ExternalTaskHandler for TicketHandler {
///     async fn call(&self, payload: Option<&Value>) -> Result<HandlerResult, HandlerError> {
///         let ticket = self.client.add_ticket(payload).await?;
///         Ok(HandlerResult::success(ticket))
///     }
/// }
/// ```
#[async_trait]
pub trait ExternalTaskHandler: Send + Sync + 'static {
    async fn call(&self, payload: Option<&Value>) -> Result<HandlerResult, HandlerError>;

    /// Call with the task's configured HTTP method
    ///
    /// Handlers that do not speak HTTP ignore the method.
    async fn call_with_method(
        &self,
        method: HttpMethod,
        payload: Option<&Value>,
    ) -> Result<HandlerResult, HandlerError> {
        let _ = method;
        self.call(payload).await
    }
}

/// One handler call as a recordable result
///
/// Errors and panics both become failure results, so the caller always has
/// something to store on the run.
pub(crate) async fn call_handler(
    handler: &dyn ExternalTaskHandler,
    method: HttpMethod,
    payload: Option<&Value>,
) -> HandlerResult {
    match AssertUnwindSafe(handler.call_with_method(method, payload))
        .catch_unwind()
        .await
    {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => e.into_result(),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(error = %message, "callback handler panicked");
            HandlerError::new(message).into_result()
        }
    }
}

type HandlerFn = Arc<
    dyn Fn(Option<Value>) -> Pin<Box<dyn Future<Output = Result<HandlerResult, HandlerError>> + Send>>
        + Send
        + Sync,
>;

/// [`ExternalTaskHandler`] built from an async closure
pub struct FnHandler {
    body: HandlerFn,
}

impl FnHandler {
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerResult, HandlerError>> + Send + 'static,
    {
        Self {
            body: Arc::new(move |payload| Box::pin(body(payload))),
        }
    }
}

#[async_trait]
impl ExternalTaskHandler for FnHandler {
    async fn call(&self, payload: Option<&Value>) -> Result<HandlerResult, HandlerError> {
        (self.body)(payload.cloned()).await
    }
}

/// Generic JSON webhook handler
///
/// Sends the payload to a fixed endpoint using the task's HTTP method (POST
/// when called through [`ExternalTaskHandler::call`]). GET and DELETE carry
/// no body. A 2xx response is a success with the response body as data; any
/// other status is a reported failure.
#[derive(Debug, Clone)]
pub struct HttpCallbackHandler {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<(String, String)>,
}

impl HttpCallbackHandler {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(client_with_timeout(Duration::from_secs(30)), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_key: None,
        }
    }

    /// Send `value` in the `header` header on every call
    pub fn with_api_key(mut self, header: impl Into<String>, value: impl Into<String>) -> Self {
        self.api_key = Some((header.into(), value.into()));
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ExternalTaskHandler for HttpCallbackHandler {
    async fn call(&self, payload: Option<&Value>) -> Result<HandlerResult, HandlerError> {
        self.call_with_method(HttpMethod::Post, payload).await
    }

    #[instrument(skip(self, payload), fields(endpoint = %self.endpoint, method = %method))]
    async fn call_with_method(
        &self,
        method: HttpMethod,
        payload: Option<&Value>,
    ) -> Result<HandlerResult, HandlerError> {
        let mut request = self.client.request(request_method(method), &self.endpoint);
        if !matches!(method, HttpMethod::Get | HttpMethod::Delete) {
            request = request.json(payload.unwrap_or(&Value::Null));
        }
        if let Some((header, value)) = &self.api_key {
            request = request.header(header.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        let data = serde_json::from_str(&body).unwrap_or(Value::String(body));

        if status.is_success() {
            debug!(status = status.as_u16(), "callback delivered");
            Ok(HandlerResult::success(data))
        } else {
            warn!(status = status.as_u16(), "callback rejected");
            Ok(HandlerResult::failure(json!({
                "status": status.as_u16(),
                "body": data,
            })))
        }
    }
}

fn request_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

/// Routing key for a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandlerKey {
    pub api_name: ApiName,
    pub task_function: TaskFunction,
}

impl HandlerKey {
    pub fn new(api_name: ApiName, task_function: TaskFunction) -> Self {
        Self {
            api_name,
            task_function,
        }
    }
}

/// Maps `(ApiName, TaskFunction)` to the handler that performs it
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerKey, Arc<dyn ExternalTaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same key
    pub fn register(
        &mut self,
        api_name: ApiName,
        task_function: TaskFunction,
        handler: Arc<dyn ExternalTaskHandler>,
    ) {
        self.handlers
            .insert(HandlerKey::new(api_name, task_function), handler);
    }

    pub fn with_handler(
        mut self,
        api_name: ApiName,
        task_function: TaskFunction,
        handler: impl ExternalTaskHandler,
    ) -> Self {
        self.register(api_name, task_function, Arc::new(handler));
        self
    }

    pub fn get(
        &self,
        api_name: ApiName,
        task_function: TaskFunction,
    ) -> Option<Arc<dyn ExternalTaskHandler>> {
        self.handlers
            .get(&HandlerKey::new(api_name, task_function))
            .cloned()
    }

    /// Registered keys, sorted
    pub fn keys(&self) -> Vec<HandlerKey> {
        let mut keys: Vec<_> = self.handlers.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
