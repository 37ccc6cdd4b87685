//! In-process discourse engine for tests.
//!
//! Deterministic: sentences become ADUs, embeddings are derived from a hash of
//! the text (identical text, identical vector), and validator behaviour is
//! scripted per test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    ClaimCandidate, ConceptResolution, DiscourseEngine, DiscourseError, ExtractedAdu,
    ExtractedRelation, HealthStatus, Result, TextItem,
};

/// How `validate_claim_equivalence` answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorMode {
    /// Match the most similar candidate.
    MatchBest,
    /// Never match.
    NoMatch,
    /// Return an error.
    Fail,
}

pub struct FakeEngine {
    dimension: usize,
    /// Width actually returned; differs from `dimension` to simulate drift.
    returned_dimension: AtomicUsize,
    validator: Mutex<ValidatorMode>,
    embeddings: Mutex<HashMap<String, Vec<f32>>>,
    fail_analyze: AtomicBool,
    analyze_calls: AtomicUsize,
    validate_calls: AtomicUsize,
}

impl FakeEngine {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            returned_dimension: AtomicUsize::new(dimension),
            validator: Mutex::new(ValidatorMode::MatchBest),
            embeddings: Mutex::new(HashMap::new()),
            fail_analyze: AtomicBool::new(false),
            analyze_calls: AtomicUsize::new(0),
            validate_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_validator(&self, mode: ValidatorMode) {
        *self.validator.lock().unwrap() = mode;
    }

    /// Pin the embedding returned for an exact text.
    pub fn set_embedding(&self, text: impl Into<String>, embedding: Vec<f32>) {
        self.embeddings.lock().unwrap().insert(text.into(), embedding);
    }

    pub fn set_fail_analyze(&self, fail: bool) {
        self.fail_analyze.store(fail, Ordering::SeqCst);
    }

    pub fn set_returned_dimension(&self, width: usize) {
        self.returned_dimension.store(width, Ordering::SeqCst);
    }

    pub fn analyze_calls(&self) -> usize {
        self.analyze_calls.load(Ordering::SeqCst)
    }

    pub fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    fn embedding_for(&self, text: &str) -> Vec<f32> {
        let width = self.returned_dimension.load(Ordering::SeqCst);
        if let Some(pinned) = self.embeddings.lock().unwrap().get(text) {
            let mut v = pinned.clone();
            v.resize(width, 0.0);
            return v;
        }
        hashed_unit_vector(text, width)
    }
}

/// A unit vector seeded from the text bytes (FNV-1a + xorshift).
pub fn hashed_unit_vector(text: &str, width: usize) -> Vec<f32> {
    let mut state: u64 = 0xcbf2_9ce4_8422_2325;
    for b in text.bytes() {
        state ^= b as u64;
        state = state.wrapping_mul(0x0100_0000_01b3);
    }
    let mut v = Vec::with_capacity(width);
    for _ in 0..width {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        v.push(((state % 2000) as f32 / 1000.0) - 1.0);
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

/// Splits on '.', '!' and '?', returning (start, end, sentence) byte spans.
fn sentences(text: &str) -> Vec<(usize, usize, &str)> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?') {
            let end = i + c.len_utf8();
            push_trimmed(text, start, end, &mut out);
            start = end;
        }
    }
    push_trimmed(text, start, text.len(), &mut out);
    out
}

fn push_trimmed<'a>(
    text: &'a str,
    start: usize,
    end: usize,
    out: &mut Vec<(usize, usize, &'a str)>,
) {
    let raw = &text[start..end];
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return;
    }
    let offset = raw.find(trimmed).unwrap_or(0);
    let s = start + offset;
    out.push((s, s + trimmed.len(), trimmed));
}

#[async_trait]
impl DiscourseEngine for FakeEngine {
    async fn health_check(&self) -> Result<HealthStatus> {
        Ok(HealthStatus {
            status: "ok".to_string(),
            models_loaded: true,
        })
    }

    async fn embed_content(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let embeddings: Vec<Vec<f32>> = texts.iter().map(|t| self.embedding_for(t)).collect();
        crate::check_embeddings(&embeddings, texts.len(), self.dimension)?;
        Ok(embeddings)
    }

    async fn analyze_adus(&self, items: &[TextItem]) -> Result<Vec<ExtractedAdu>> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_analyze.load(Ordering::SeqCst) {
            return Err(DiscourseError::Api {
                status: 503,
                message: "models not loaded".to_string(),
            });
        }

        let mut adus = Vec::new();
        for item in items {
            for (start, end, sentence) in sentences(&item.text) {
                let lower = sentence.to_lowercase();
                let adu_type = if lower.starts_with("because") || lower.starts_with("since") {
                    "premise"
                } else if lower.starts_with("therefore") || lower.starts_with("so ") {
                    "conclusion"
                } else {
                    "claim"
                };
                adus.push(ExtractedAdu {
                    item_id: item.id.clone(),
                    adu_type: adu_type.to_string(),
                    text: sentence.to_string(),
                    span_start: start as i32,
                    span_end: end as i32,
                    confidence: 0.9,
                });
            }
        }
        Ok(adus)
    }

    async fn validate_claim_equivalence(
        &self,
        _claim_text: &str,
        candidates: &[ClaimCandidate],
    ) -> Result<Option<String>> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.validator.lock().unwrap();
        match mode {
            ValidatorMode::Fail => Err(DiscourseError::Timeout),
            ValidatorMode::NoMatch => Ok(None),
            ValidatorMode::MatchBest => Ok(candidates
                .iter()
                .max_by(|a, b| a.similarity.total_cmp(&b.similarity))
                .map(|c| c.id.clone())),
        }
    }

    async fn disambiguate_concepts_batch(
        &self,
        context: &str,
        terms: &[String],
    ) -> Result<Vec<ConceptResolution>> {
        Ok(terms
            .iter()
            .map(|term| ConceptResolution {
                term: term.clone(),
                matched_concept_id: None,
                new_definition: Some(format!("{term} as used in: {context}")),
                confidence: 0.5,
            })
            .collect())
    }

    /// Each premise supports the nearest preceding non-premise.
    async fn detect_relations(&self, adus: &[TextItem]) -> Result<Vec<ExtractedRelation>> {
        let mut relations = Vec::new();
        let mut last_claim: Option<&TextItem> = None;
        for adu in adus {
            let lower = adu.text.to_lowercase();
            if lower.starts_with("because") || lower.starts_with("since") {
                if let Some(target) = last_claim {
                    relations.push(ExtractedRelation {
                        source_id: adu.id.clone(),
                        target_id: target.id.clone(),
                        relation_type: "support".to_string(),
                        confidence: 0.8,
                    });
                }
            } else {
                last_claim = Some(adu);
            }
        }
        Ok(relations)
    }
}
