use serde::{Deserialize, Serialize};

/// Engine readiness as reported by `/health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(alias = "modelsLoaded")]
    pub models_loaded: bool,
}

impl HealthStatus {
    pub fn is_ready(&self) -> bool {
        self.status == "ok" && self.models_loaded
    }
}

/// An identified piece of text sent to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextItem {
    pub id: String,
    pub text: String,
}

impl TextItem {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

// --- Embeddings ---

#[derive(Debug, Clone, Serialize)]
pub(crate) struct EmbedRequest<'a> {
    pub texts: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct EmbedResponse {
    pub embeddings: Vec<Vec<f32>>,
}

// --- ADU extraction ---

#[derive(Debug, Clone, Serialize)]
pub(crate) struct AnalyzeRequest<'a> {
    pub items: &'a [TextItem],
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AnalyzeResponse {
    pub adus: Vec<ExtractedAdu>,
}

/// One claim/premise/conclusion the engine found in an input item.
/// `adu_type` is passed through verbatim; callers validate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedAdu {
    /// Id of the input item this unit was extracted from.
    #[serde(alias = "itemId")]
    pub item_id: String,
    #[serde(alias = "type", alias = "aduType")]
    pub adu_type: String,
    pub text: String,
    #[serde(alias = "spanStart")]
    pub span_start: i32,
    #[serde(alias = "spanEnd")]
    pub span_end: i32,
    pub confidence: f64,
}

// --- Claim equivalence ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimCandidate {
    pub id: String,
    pub text: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ValidateEquivalenceRequest<'a> {
    pub claim_text: &'a str,
    pub candidates: &'a [ClaimCandidate],
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ValidateEquivalenceResponse {
    #[serde(default, alias = "matchedCandidateId")]
    pub matched_candidate_id: Option<String>,
}

// --- Concept disambiguation ---

#[derive(Debug, Clone, Serialize)]
pub(crate) struct DisambiguateRequest<'a> {
    pub context: &'a str,
    pub terms: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DisambiguateResponse {
    pub results: Vec<ConceptResolution>,
}

/// Either a match against a known concept or a freshly proposed definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptResolution {
    pub term: String,
    #[serde(default, alias = "matchedConceptId")]
    pub matched_concept_id: Option<String>,
    #[serde(default, alias = "newDefinition")]
    pub new_definition: Option<String>,
    pub confidence: f64,
}

// --- Relations ---

#[derive(Debug, Clone, Serialize)]
pub(crate) struct RelationsRequest<'a> {
    pub adus: &'a [TextItem],
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RelationsResponse {
    pub relations: Vec<ExtractedRelation>,
}

/// A support/attack edge between two input ADUs, referenced by their ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelation {
    #[serde(alias = "sourceId")]
    pub source_id: String,
    #[serde(alias = "targetId")]
    pub target_id: String,
    #[serde(alias = "type", alias = "relationType")]
    pub relation_type: String,
    pub confidence: f64,
}
