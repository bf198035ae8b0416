// Gateways to the model services
// Both services speak JSON over HTTP; calls are blocking and run off the async runtime

pub mod embedding;
pub mod summarization;


use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, error, warn};
use url::Url;

use crate::{RagError, Result};

pub use embedding::HttpEmbeddingGateway;
pub use summarization::{HttpSummarizationGateway, LengthBounds, LengthPolicy};

const EXPONENTIAL_BACKOFF_BASE: u32 = 2;
const DEFAULT_BACKOFF: Duration = Duration::from_millis(1000);

/// Turns text into fixed-length vectors.
#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// One vector per input text, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn health_check(&self) -> Result<()>;
}

/// Produces a shorter text within the given length bounds.
#[async_trait]
pub trait SummarizationGateway: Send + Sync {
    async fn summarize(&self, text: &str, bounds: LengthBounds) -> Result<String>;

    async fn health_check(&self) -> Result<()>;
}

/// Blocking JSON client shared by the HTTP gateways.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    gateway: &'static str,
    base_url: Url,
    agent: ureq::Agent,
    retry_attempts: u32,
    backoff: Duration,
}

impl HttpTransport {
    #[inline]
    pub fn new(gateway: &'static str, base_url: Url, timeout: Duration, retry_attempts: u32) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();

        Self {
            gateway,
            base_url,
            agent,
            retry_attempts: retry_attempts.max(1),
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Delay before the first retry; doubles on each further attempt.
    #[inline]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    #[inline]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[inline]
    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|e| {
            RagError::Config(format!(
                "Invalid {} endpoint {}{}: {}",
                self.gateway, self.base_url, path, e
            ))
        })
    }

    /// GET `path` and return the body; used by readiness probes.
    pub fn get_text(&self, path: &str) -> Result<String> {
        let url = self.endpoint(path)?;
        debug!("GET {}", url);

        self.make_request_with_retry(|| {
            self.agent
                .get(url.as_str())
                .call()
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })
    }

    /// POST `request` as JSON to `path` and decode the JSON response.
    pub fn post_json<Req, Resp>(&self, path: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        let request_json = serde_json::to_string(request).map_err(anyhow::Error::from)?;
        debug!("POST {} ({} bytes)", url, request_json.len());

        let response_text = self.make_request_with_retry(|| {
            self.agent
                .post(url.as_str())
                .header("Content-Type", "application/json")
                .send(&request_json)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        serde_json::from_str(&response_text).map_err(|e| RagError::GatewayDeclined {
            gateway: self.gateway,
            status: 200,
            message: format!("unreadable response from {}: {}", path, e),
        })
    }

    fn make_request_with_retry<F>(&self, mut request_fn: F) -> Result<String>
    where
        F: FnMut() -> std::result::Result<String, ureq::Error>,
    {
        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            debug!(
                "{} request attempt {}/{}",
                self.gateway, attempt, self.retry_attempts
            );

            let error = match request_fn() {
                Ok(response_text) => return Ok(response_text),
                Err(error) => self.classify(error),
            };

            if !error.is_retryable() {
                warn!("{} request failed, not retrying: {}", self.gateway, error);
                return Err(error);
            }

            warn!(
                "{} request failed: {}, attempt {}/{}",
                self.gateway, error, attempt, self.retry_attempts
            );
            last_error = Some(error);

            if attempt < self.retry_attempts {
                let delay = self.backoff * EXPONENTIAL_BACKOFF_BASE.pow(attempt - 1);
                debug!("Waiting {:?} before retry", delay);
                std::thread::sleep(delay);
            }
        }

        error!(
            "All retry attempts failed for {} gateway at {}",
            self.gateway, self.base_url
        );
        Err(last_error.unwrap_or_else(|| RagError::GatewayUnavailable {
            gateway: self.gateway,
            message: "request failed after retries".to_string(),
        }))
    }

    fn classify(&self, error: ureq::Error) -> RagError {
        match error {
            ureq::Error::StatusCode(status) => RagError::GatewayDeclined {
                gateway: self.gateway,
                status,
                message: format!("HTTP {}", status),
            },
            other => RagError::GatewayUnavailable {
                gateway: self.gateway,
                message: other.to_string(),
            },
        }
    }
}

/// Run a blocking gateway call on the blocking thread pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RagError::Other(anyhow::anyhow!("gateway task failed: {}", e)))?
}
