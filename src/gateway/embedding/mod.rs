
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use half::f16;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{EmbeddingGateway, HttpTransport, run_blocking};
use crate::config::{EmbeddingConfig, EmbeddingEncoding};
use crate::{RagError, Result};

const GATEWAY: &str = "embedding";

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    text: &'a str,
    encode: bool,
}

#[derive(Debug, Serialize)]
struct BatchEmbedRequest<'a> {
    texts: &'a [String],
    encode: bool,
}

/// A vector as sent by the service: plain floats, or base64 of little-endian f16.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireEmbedding {
    Plain(Vec<f32>),
    Encoded(String),
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: WireEmbedding,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    embeddings: Vec<WireEmbedding>,
}

impl WireEmbedding {
    fn into_vector(self) -> Result<Vec<f32>> {
        match self {
            Self::Plain(values) => Ok(values),
            Self::Encoded(encoded) => decode_f16_base64(&encoded),
        }
    }
}

/// Decode base64 of packed little-endian IEEE-754 half floats.
pub fn decode_f16_base64(encoded: &str) -> Result<Vec<f32>> {
    let bytes = STANDARD.decode(encoded).map_err(|e| declined(format!("invalid base64 embedding: {}", e)))?;

    if bytes.len() % 2 != 0 {
        return Err(declined(format!(
            "encoded embedding has odd byte length {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| f16::from_le_bytes([pair[0], pair[1]]).to_f32())
        .collect())
}

/// Encode a vector the way the service does with `encode=true`.
pub fn encode_f16_base64(values: &[f32]) -> String {
    let bytes: Vec<u8> = values
        .iter()
        .flat_map(|v| f16::from_f32(*v).to_le_bytes())
        .collect();
    STANDARD.encode(bytes)
}

fn declined(message: String) -> RagError {
    RagError::GatewayDeclined {
        gateway: GATEWAY,
        status: 200,
        message,
    }
}

/// Client for the embedding service's `/embeddings/get` endpoints.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingGateway {
    transport: HttpTransport,
    batch_size: usize,
    encoding: EmbeddingEncoding,
}

impl HttpEmbeddingGateway {
    #[inline]
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let base_url = config
            .url()
            .map_err(|e| RagError::Config(format!("embedding gateway: {}", e)))?;

        Ok(Self {
            transport: HttpTransport::new(
                GATEWAY,
                base_url,
                Duration::from_secs(config.timeout_seconds),
                config.retry_attempts,
            ),
            batch_size: config.batch_size.max(1) as usize,
            encoding: config.encoding,
        })
    }

    #[inline]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.transport = self.transport.with_backoff(backoff);
        self
    }

    fn encode_flag(&self) -> bool {
        self.encoding == EmbeddingEncoding::Base64F16
    }

    fn embed_one_blocking(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbedRequest {
            text,
            encode: self.encode_flag(),
        };
        let response: EmbedResponse = self.transport.post_json("/embeddings/get", &request)?;
        let vector = response.embeddings.into_vector()?;
        debug!("Generated embedding with {} dimensions", vector.len());
        Ok(vector)
    }

    fn embed_batch_blocking(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());

        // Chunked to avoid overwhelming the service
        for chunk in texts.chunks(self.batch_size) {
            let request = BatchEmbedRequest {
                texts: chunk,
                encode: self.encode_flag(),
            };
            let response: BatchEmbedResponse =
                self.transport.post_json("/embeddings/get-batch", &request)?;

            if response.embeddings.len() != chunk.len() {
                return Err(declined(format!(
                    "Mismatch between request and response counts: {} vs {}",
                    chunk.len(),
                    response.embeddings.len()
                )));
            }

            for embedding in response.embeddings {
                results.push(embedding.into_vector()?);
            }
        }

        debug!("Generated {} embeddings total", results.len());
        Ok(results)
    }
}

#[async_trait]
impl EmbeddingGateway for HttpEmbeddingGateway {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let gateway = self.clone();
        let text = text.to_string();
        run_blocking(move || gateway.embed_one_blocking(&text)).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Generating embeddings for {} texts", texts.len());
        let gateway = self.clone();
        let texts = texts.to_vec();
        run_blocking(move || gateway.embed_batch_blocking(&texts)).await
    }

    async fn health_check(&self) -> Result<()> {
        let transport = self.transport.clone();
        run_blocking(move || transport.get_text("/ready")).await?;
        info!("Embedding service at {} is ready", self.transport.base_url());
        Ok(())
    }
}
