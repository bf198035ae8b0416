
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{HttpTransport, SummarizationGateway, run_blocking};
use crate::config::SummarizationConfig;
use crate::{RagError, Result};

const GATEWAY: &str = "summarization";

/// Summary length bounds in model tokens, `min < max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LengthBounds {
    pub min_length: u32,
    pub max_length: u32,
}

impl LengthBounds {
    /// Clamp configured bounds to what `text` can support.
    ///
    /// The maximum is capped at the estimated token count of the input
    /// (`words * tokens_per_word`, words split on single spaces) and the
    /// minimum is kept strictly below the maximum.
    pub fn clamp_for(
        text: &str,
        min_length: u32,
        max_length: u32,
        tokens_per_word: f64,
    ) -> Result<Self> {
        let words = text.split(' ').count();
        let estimated_tokens = (words as f64 * tokens_per_word).floor() as u32;

        let max_length = max_length.min(estimated_tokens);
        if max_length < 2 {
            return Err(RagError::Validation(format!(
                "text of {} words is too short to summarize",
                words
            )));
        }

        Ok(Self {
            min_length: min_length.min(max_length - 1),
            max_length,
        })
    }
}

/// Configured bounds plus the token estimate ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LengthPolicy {
    pub min_length: u32,
    pub max_length: u32,
    pub tokens_per_word: f64,
}

impl LengthPolicy {
    #[inline]
    pub fn from_config(config: &SummarizationConfig) -> Self {
        Self {
            min_length: config.min_length,
            max_length: config.max_length,
            tokens_per_word: config.tokens_per_word,
        }
    }

    #[inline]
    pub fn bounds_for(&self, text: &str) -> Result<LengthBounds> {
        LengthBounds::clamp_for(text, self.min_length, self.max_length, self.tokens_per_word)
    }
}

#[derive(Debug, Serialize)]
struct SummarizeRequest<'a> {
    text: &'a str,
    min_length: u32,
    max_length: u32,
}

#[derive(Debug, Deserialize)]
struct SummarizeResponse {
    summary: String,
}

#[derive(Debug, Clone)]
pub struct HttpSummarizationGateway {
    transport: HttpTransport,
}

impl HttpSummarizationGateway {
    #[inline]
    pub fn new(config: &SummarizationConfig) -> Result<Self> {
        let base_url = config
            .url()
            .map_err(|e| RagError::Config(format!("summarization gateway: {}", e)))?;

        Ok(Self {
            transport: HttpTransport::new(
                GATEWAY,
                base_url,
                Duration::from_secs(config.timeout_seconds),
                config.retry_attempts,
            ),
        })
    }

    #[inline]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.transport = self.transport.with_backoff(backoff);
        self
    }
}

#[async_trait]
impl SummarizationGateway for HttpSummarizationGateway {
    async fn summarize(&self, text: &str, bounds: LengthBounds) -> Result<String> {
        debug!(
            "Summarizing {} bytes with bounds {}..{}",
            text.len(),
            bounds.min_length,
            bounds.max_length
        );

        let transport = self.transport.clone();
        let text = text.to_string();
        let response: SummarizeResponse = run_blocking(move || {
            transport.post_json(
                "/summarise",
                &SummarizeRequest {
                    text: &text,
                    min_length: bounds.min_length,
                    max_length: bounds.max_length,
                },
            )
        })
        .await?;

        Ok(response.summary)
    }

    async fn health_check(&self) -> Result<()> {
        let transport = self.transport.clone();
        run_blocking(move || transport.get_text("/ready")).await?;
        info!(
            "Summarization service at {} is ready",
            self.transport.base_url()
        );
        Ok(())
    }
}
