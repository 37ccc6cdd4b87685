pub mod error;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod fake;

pub use error::{DiscourseError, Result};
pub use types::{
    ClaimCandidate, ConceptResolution, ExtractedAdu, ExtractedRelation, HealthStatus, TextItem,
};

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use types::{
    AnalyzeRequest, AnalyzeResponse, DisambiguateRequest, DisambiguateResponse, EmbedRequest,
    EmbedResponse, RelationsRequest, RelationsResponse, ValidateEquivalenceRequest,
    ValidateEquivalenceResponse,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The ML service the analysis pipeline depends on.
///
/// Every call crosses a network boundary and may fail independently of the
/// pipeline. Implementations must bound each call with a timeout.
#[async_trait]
pub trait DiscourseEngine: Send + Sync {
    async fn health_check(&self) -> Result<HealthStatus>;

    /// Embed each text. The result has one vector per input, each of the
    /// configured width.
    async fn embed_content(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn analyze_adus(&self, items: &[TextItem]) -> Result<Vec<ExtractedAdu>>;

    /// Returns the id of the candidate the claim is equivalent to, if any.
    async fn validate_claim_equivalence(
        &self,
        claim_text: &str,
        candidates: &[ClaimCandidate],
    ) -> Result<Option<String>>;

    async fn disambiguate_concepts_batch(
        &self,
        context: &str,
        terms: &[String],
    ) -> Result<Vec<ConceptResolution>>;

    async fn detect_relations(&self, adus: &[TextItem]) -> Result<Vec<ExtractedRelation>>;
}

/// Checks an embedding batch against the expected count and width.
pub fn check_embeddings(
    embeddings: &[Vec<f32>],
    expected_count: usize,
    dimension: usize,
) -> Result<()> {
    if embeddings.len() != expected_count {
        return Err(DiscourseError::Malformed(format!(
            "expected {} embeddings, got {}",
            expected_count,
            embeddings.len()
        )));
    }
    if let Some(bad) = embeddings.iter().find(|e| e.len() != dimension) {
        return Err(DiscourseError::DimensionMismatch {
            expected: dimension,
            actual: bad.len(),
        });
    }
    Ok(())
}

/// JSON-over-HTTP discourse engine.
pub struct HttpDiscourseEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    embedding_dimension: usize,
}

impl HttpDiscourseEngine {
    pub fn new(base_url: impl Into<String>, embedding_dimension: usize) -> Result<Self> {
        Self::with_timeout(base_url, embedding_dimension, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        embedding_dimension: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            embedding_dimension,
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn embedding_dimension(&self) -> usize {
        self.embedding_dimension
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(%url, "discourse engine request");

        let mut req = self.client.post(&url).json(body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DiscourseError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl DiscourseEngine for HttpDiscourseEngine {
    async fn health_check(&self) -> Result<HealthStatus> {
        let url = format!("{}/health", self.base_url);
        let resp = self.client.get(&url).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DiscourseError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn embed_content(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let resp: EmbedResponse = self.post("/embed", &EmbedRequest { texts }).await?;
        check_embeddings(&resp.embeddings, texts.len(), self.embedding_dimension)?;
        Ok(resp.embeddings)
    }

    async fn analyze_adus(&self, items: &[TextItem]) -> Result<Vec<ExtractedAdu>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let resp: AnalyzeResponse = self.post("/analyze-adus", &AnalyzeRequest { items }).await?;
        Ok(resp.adus)
    }

    async fn validate_claim_equivalence(
        &self,
        claim_text: &str,
        candidates: &[ClaimCandidate],
    ) -> Result<Option<String>> {
        if candidates.is_empty() {
            return Ok(None);
        }

        let resp: ValidateEquivalenceResponse = self
            .post(
                "/validate-claim-equivalence",
                &ValidateEquivalenceRequest {
                    claim_text,
                    candidates,
                },
            )
            .await?;
        Ok(resp.matched_candidate_id)
    }

    async fn disambiguate_concepts_batch(
        &self,
        context: &str,
        terms: &[String],
    ) -> Result<Vec<ConceptResolution>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let resp: DisambiguateResponse = self
            .post(
                "/disambiguate-concepts-batch",
                &DisambiguateRequest { context, terms },
            )
            .await?;
        Ok(resp.results)
    }

    async fn detect_relations(&self, adus: &[TextItem]) -> Result<Vec<ExtractedRelation>> {
        if adus.len() < 2 {
            return Ok(Vec::new());
        }

        let resp: RelationsResponse = self
            .post("/detect-relations", &RelationsRequest { adus })
            .await?;
        Ok(resp.relations)
    }
}
