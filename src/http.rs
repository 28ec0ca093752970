//! HTTP request execution.
//!
//! [`HttpClient`] wraps one shared `reqwest::Client` (its connection pool is
//! the only executor-level state shared between virtual users, and it is safe
//! for concurrent use). Every call records two samples against the shared
//! registry regardless of how the caller handles the result:
//!
//! - `http_req_duration` (milliseconds), tagged with `status` and
//!   `expected_response`
//! - `http_req_failed` (0/1), tagged with a `reason` on timeouts and
//!   transport errors
//!
//! The call itself returns `Err` only for timeouts and transport failures; an
//! unexpected HTTP status still yields `Ok(response)` so the iteration can
//! inspect the body, run checks, and decide what failing means for it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
pub use reqwest::Method;

use crate::error::{RequestError, RunError};
use crate::metrics::{names, MetricRegistry};
use crate::run::RunOptions;

/// One HTTP call: method, URL (absolute, or joined to the run's base URL),
/// headers, body, and classification/timing knobs.
#[derive(Clone, Debug)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    /// Overrides the run-level request timeout for this call.
    pub timeout: Option<Duration>,
    /// Statuses counted as success. Empty means any 2xx/3xx.
    pub expected_statuses: Vec<u16>,
}

impl RequestSpec {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
            expected_statuses: Vec::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// JSON body plus the matching content type. A value that fails to
    /// serialize degrades to an empty body.
    pub fn json(self, body: &impl serde::Serialize) -> Self {
        let body = serde_json::to_string(body).unwrap_or_default();
        self.header("content-type", "application/json").body(body)
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn expect_status(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.expected_statuses = statuses.into_iter().collect();
        self
    }

    fn status_expected(&self, status: u16) -> bool {
        if self.expected_statuses.is_empty() {
            (200..400).contains(&status)
        } else {
            self.expected_statuses.contains(&status)
        }
    }
}

/// A completed HTTP exchange.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: bytes::Bytes,
    pub latency: Duration,
    /// Whether `status` was in the request's expected set.
    pub expected: bool,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Shared request executor. Cheap to clone; all clones share one connection
/// pool and the run's registry.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    registry: Arc<MetricRegistry>,
    base_url: Option<String>,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(registry: Arc<MetricRegistry>, options: &RunOptions) -> Result<Self, RunError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &options.base_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| RunError::Config(format!("bad header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| RunError::Config(format!("bad header value: {e}")))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .default_headers(headers)
            .build()
            .map_err(RunError::Client)?;

        Ok(Self {
            client,
            registry,
            base_url: options.base_url.clone(),
            timeout: options.request_timeout,
        })
    }

    /// Issue a request, measure it, classify it, and record its samples.
    pub async fn execute(&self, spec: RequestSpec) -> Result<HttpResponse, RequestError> {
        let url = self.resolve(&spec.url);
        let timeout = spec.timeout.unwrap_or(self.timeout);

        let mut request = self.client.request(spec.method.clone(), &url);
        for (name, value) in &spec.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &spec.body {
            request = request.body(body.clone());
        }
        if let Some(t) = spec.timeout {
            request = request.timeout(t);
        }

        let started = Instant::now();
        let outcome = match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers = response.headers().clone();
                match response.bytes().await {
                    Ok(body) => Ok((status, headers, body)),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };
        let latency = started.elapsed();

        match outcome {
            Ok((status, headers, body)) => {
                let expected = spec.status_expected(status);
                let status_text = status.to_string();
                let expected_text = if expected { "true" } else { "false" };
                self.registry.add_tagged(
                    names::REQUEST_DURATION,
                    latency.as_secs_f64() * 1000.0,
                    &[("status", &status_text), ("expected_response", expected_text)],
                );
                self.registry
                    .add(names::REQUEST_FAILED, if expected { 0.0 } else { 1.0 });

                Ok(HttpResponse {
                    status,
                    headers,
                    body,
                    latency,
                    expected,
                })
            }
            Err(e) => {
                let reason = if e.is_timeout() { "timeout" } else { "transport" };
                self.registry.add_tagged(
                    names::REQUEST_DURATION,
                    latency.as_secs_f64() * 1000.0,
                    &[("status", "0"), ("expected_response", "false")],
                );
                self.registry
                    .add_tagged(names::REQUEST_FAILED, 1.0, &[("reason", reason)]);
                tracing::debug!(url = %url, reason, "request failed");

                if e.is_timeout() {
                    Err(RequestError::Timeout { timeout })
                } else {
                    Err(RequestError::Transport(e))
                }
            }
        }
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        match &self.base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), url.trim_start_matches('/')),
            None => url.to_string(),
        }
    }
}
