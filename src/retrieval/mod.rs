//! Enrollment and search on top of the embedding gateway and the index engine.


use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{Config, IndexBackend};
use crate::gateway::{
    EmbeddingGateway, HttpEmbeddingGateway, HttpSummarizationGateway, LengthPolicy,
    SummarizationGateway,
};
use crate::index::{
    CollectionBackend, EngineOptions, Hit, LanceCollection, NewDocument, SegmentCollection,
    VectorIndexEngine, validate_source_identifier,
};
use crate::{RagError, Result};

/// Separator placed between hit previews before summarizing.
pub const PREVIEW_SEPARATOR: &str = "; ";

/// A document to enroll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollRequest {
    pub text: String,
    pub source_identifier: String,
}

impl EnrollRequest {
    #[inline]
    pub fn new(text: impl Into<String>, source_identifier: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source_identifier: source_identifier.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        validate_text(&self.text)?;
        validate_source_identifier(&self.source_identifier)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkEnrollReport {
    pub inserted: usize,
    pub ids: Vec<u64>,
}

/// Result of a search. Hits are always returned, with a summary when one was produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchOutcome {
    Summarized { summary: String, hits: Vec<Hit> },
    HitsOnly { hits: Vec<Hit> },
}

impl SearchOutcome {
    #[inline]
    pub fn hits(&self) -> &[Hit] {
        match self {
            Self::Summarized { hits, .. } | Self::HitsOnly { hits } => hits,
        }
    }

    #[inline]
    pub fn summary(&self) -> Option<&str> {
        match self {
            Self::Summarized { summary, .. } => Some(summary),
            Self::HitsOnly { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self {
                ready: true,
                error: None,
            },
            Err(e) => Self {
                ready: false,
                error: Some(e.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub embedding: ComponentHealth,
    /// `None` when no summarizer is configured
    pub summarization: Option<ComponentHealth>,
    pub index: ComponentHealth,
}

impl Readiness {
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.embedding.ready
            && self.index.ready
            && self.summarization.as_ref().is_none_or(|s| s.ready)
    }
}

pub struct Retriever {
    embedder: Arc<dyn EmbeddingGateway>,
    summarizer: Option<Arc<dyn SummarizationGateway>>,
    engine: Arc<VectorIndexEngine>,
    length_policy: LengthPolicy,
}

impl Retriever {
    #[inline]
    pub fn new(
        embedder: Arc<dyn EmbeddingGateway>,
        summarizer: Option<Arc<dyn SummarizationGateway>>,
        engine: Arc<VectorIndexEngine>,
        length_policy: LengthPolicy,
    ) -> Self {
        Self {
            embedder,
            summarizer,
            engine,
            length_policy,
        }
    }

    /// Build the HTTP gateways and open the configured index backend.
    pub async fn from_config(config: &Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| RagError::Config(e.to_string()))?;

        let embedder: Arc<dyn EmbeddingGateway> =
            Arc::new(HttpEmbeddingGateway::new(&config.embedding)?);

        let summarizer: Option<Arc<dyn SummarizationGateway>> = if config.summarization.enabled {
            Some(Arc::new(HttpSummarizationGateway::new(
                &config.summarization,
            )?))
        } else {
            None
        };

        let backend = open_backend(config).await?;
        let engine = Arc::new(
            VectorIndexEngine::open(backend, EngineOptions::from_config(config)).await?,
        );

        Ok(Self::new(
            embedder,
            summarizer,
            engine,
            LengthPolicy::from_config(&config.summarization),
        ))
    }

    #[inline]
    pub fn engine(&self) -> &Arc<VectorIndexEngine> {
        &self.engine
    }

    /// Embed and store one document. The record becomes searchable on the next query.
    pub async fn enroll_document(&self, text: &str, source_identifier: &str) -> Result<u64> {
        validate_text(text)?;
        validate_source_identifier(source_identifier)?;

        let embedding = self.embedder.embed(text).await?;
        let document = NewDocument::new(source_identifier, text, embedding)?;

        let ids = self.engine.insert(vec![document]).await?;
        let id = ids.first().copied().ok_or_else(|| {
            RagError::IndexUnavailable("insert returned no id".to_string())
        })?;

        info!("Enrolled {} as record {}", source_identifier, id);
        Ok(id)
    }

    /// Embed and store a batch with one insert and one flush.
    ///
    /// Every item and every returned vector is checked before anything is
    /// written, so a bad item fails the whole batch.
    pub async fn enroll_documents(&self, batch: Vec<EnrollRequest>) -> Result<BulkEnrollReport> {
        if batch.is_empty() {
            return Ok(BulkEnrollReport {
                inserted: 0,
                ids: Vec::new(),
            });
        }

        for (position, request) in batch.iter().enumerate() {
            request.validate().map_err(|e| match e {
                RagError::Validation(message) => {
                    RagError::Validation(format!("batch item {}: {}", position, message))
                }
                other => other,
            })?;
        }

        let texts: Vec<String> = batch.iter().map(|r| r.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;

        if embeddings.len() != batch.len() {
            return Err(RagError::GatewayDeclined {
                gateway: "embedding",
                status: 200,
                message: format!(
                    "expected {} embeddings, received {}",
                    batch.len(),
                    embeddings.len()
                ),
            });
        }

        if let Some(bad) = embeddings
            .iter()
            .find(|e| e.len() != self.engine.dimension())
        {
            return Err(RagError::DimensionMismatch {
                expected: self.engine.dimension(),
                actual: bad.len(),
            });
        }

        let documents = batch
            .into_iter()
            .zip(embeddings)
            .map(|(request, embedding)| {
                NewDocument::new(request.source_identifier, &request.text, embedding)
            })
            .collect::<Result<Vec<_>>>()?;

        let ids = self.engine.insert(documents).await?;
        self.engine.flush().await?;

        info!("Bulk enrolled {} documents", ids.len());
        Ok(BulkEnrollReport {
            inserted: ids.len(),
            ids,
        })
    }

    /// Nearest documents to `query_text`, without summarizing.
    pub async fn search(&self, query_text: &str, limit: usize) -> Result<Vec<Hit>> {
        validate_query(query_text)?;

        let embedding = self.embedder.embed(query_text).await?;
        let hits = self.engine.query(&embedding, limit).await?;
        debug!("Query matched {} documents", hits.len());
        Ok(hits)
    }

    pub async fn search_and_summarize(&self, query_text: &str) -> Result<SearchOutcome> {
        let hits = self
            .search(query_text, self.engine.default_limit())
            .await?;

        let Some(summarizer) = &self.summarizer else {
            return Ok(SearchOutcome::HitsOnly { hits });
        };

        if hits.is_empty() {
            debug!("No matches to summarize");
            return Ok(SearchOutcome::HitsOnly { hits });
        }

        let joined = hits
            .iter()
            .map(|h| h.preview_text.as_str())
            .collect::<Vec<_>>()
            .join(PREVIEW_SEPARATOR);

        let bounds = match self.length_policy.bounds_for(&joined) {
            Ok(bounds) => bounds,
            Err(RagError::Validation(reason)) => {
                debug!("Skipping summary: {}", reason);
                return Ok(SearchOutcome::HitsOnly { hits });
            }
            Err(e) => return Err(e),
        };

        let summary = summarizer.summarize(&joined, bounds).await?;
        Ok(SearchOutcome::Summarized { summary, hits })
    }

    /// Probe every collaborator; failures are reported, not returned.
    pub async fn health(&self) -> Readiness {
        let summarization = async {
            match &self.summarizer {
                Some(summarizer) => Some(ComponentHealth::from_result(
                    summarizer.health_check().await,
                )),
                None => None,
            }
        };

        let (embedding, summarization, index) = tokio::join!(
            self.embedder.health_check(),
            summarization,
            self.engine.health_check()
        );

        Readiness {
            embedding: ComponentHealth::from_result(embedding),
            summarization,
            index: ComponentHealth::from_result(index),
        }
    }
}

/// Open the storage backend selected in the configuration.
pub async fn open_backend(config: &Config) -> Result<Arc<dyn CollectionBackend>> {
    match config.index.backend {
        IndexBackend::Segment => {
            let collection =
                SegmentCollection::open(config.collection_path(), config.index.segment_seal_rows)
                    .await?;
            Ok(Arc::new(collection))
        }
        IndexBackend::Lance => {
            let collection =
                LanceCollection::connect(&config.lance_path(), &config.index.collection).await?;
            Ok(Arc::new(collection))
        }
    }
}

fn validate_text(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(RagError::Validation("document text cannot be empty".to_string()));
    }
    Ok(())
}

fn validate_query(query_text: &str) -> Result<()> {
    if query_text.trim().is_empty() {
        return Err(RagError::Validation("query cannot be empty".to_string()));
    }
    Ok(())
}
