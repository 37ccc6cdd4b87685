//! Map a claim ADU onto a canonical claim: vector search for candidates, an
//! LLM equivalence check, then link or create.

use std::sync::Arc;

use anyhow::Result;
use dialectic_core::WorkerDeps;
use discourse_client::ClaimCandidate;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analysis::models::Adu;
use crate::claims::models::{CanonicalClaim, CanonicalMapping, SimilarClaim};

/// What the equivalence validator said about the candidate set.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Matched(String),
    NoMatch,
    /// The validator call failed; the claim is treated as novel.
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateReason {
    NoCandidates,
    Rejected,
    ValidatorUnavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Link { canonical_claim_id: Uuid, similarity: f64 },
    Create(CreateReason),
}

/// Pure link-or-create rule.
///
/// Links only when the validator named one of the candidates it was shown;
/// an id outside the set counts as a rejection.
pub fn decide(candidates: &[SimilarClaim], verdict: &Verdict) -> Decision {
    if candidates.is_empty() {
        return Decision::Create(CreateReason::NoCandidates);
    }
    match verdict {
        Verdict::Matched(id) => candidates
            .iter()
            .find(|c| c.id.to_string() == *id)
            .map(|c| Decision::Link {
                canonical_claim_id: c.id,
                similarity: c.similarity,
            })
            .unwrap_or(Decision::Create(CreateReason::Rejected)),
        Verdict::NoMatch => Decision::Create(CreateReason::Rejected),
        Verdict::Unavailable => Decision::Create(CreateReason::ValidatorUnavailable),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DedupOutcome {
    pub canonical_claim_id: Uuid,
    pub similarity: f64,
    /// True when this ADU produced a new canonical claim.
    pub created: bool,
}

pub struct ClaimDeduplicator {
    deps: Arc<WorkerDeps>,
}

impl ClaimDeduplicator {
    pub fn new(deps: Arc<WorkerDeps>) -> Self {
        Self { deps }
    }

    /// Resolve one claim ADU to its canonical claim, writing the mapping.
    pub async fn resolve(
        &self,
        adu: &Adu,
        embedding: &[f32],
        author_id: Option<Uuid>,
    ) -> Result<DedupOutcome> {
        let pool = self.deps.pool();
        let dedup = &self.deps.file_config.dedup;

        let candidates =
            CanonicalClaim::find_similar(embedding, dedup.top_k, dedup.similarity_floor, pool)
                .await?;

        let verdict = if candidates.is_empty() {
            Verdict::NoMatch
        } else {
            self.validate(adu, &candidates).await
        };

        match decide(&candidates, &verdict) {
            Decision::Link {
                canonical_claim_id,
                similarity,
            } => {
                CanonicalMapping::link(adu.id, canonical_claim_id, similarity, pool).await?;
                info!(
                    adu_id = %adu.id,
                    canonical_claim_id = %canonical_claim_id,
                    similarity,
                    "Linked claim to existing canonical claim"
                );
                Ok(DedupOutcome {
                    canonical_claim_id,
                    similarity,
                    created: false,
                })
            }
            Decision::Create(reason) => {
                let created =
                    CanonicalClaim::create_and_link(&adu.text, author_id, embedding, adu.id, pool)
                        .await?;
                debug!(
                    adu_id = %adu.id,
                    canonical_claim_id = %created.claim.id,
                    inserted = created.inserted,
                    ?reason,
                    "Canonical claim created"
                );
                Ok(DedupOutcome {
                    canonical_claim_id: created.claim.id,
                    similarity: 1.0,
                    created: created.inserted,
                })
            }
        }
    }

    async fn validate(&self, adu: &Adu, candidates: &[SimilarClaim]) -> Verdict {
        let shown: Vec<ClaimCandidate> = candidates
            .iter()
            .map(|c| ClaimCandidate {
                id: c.id.to_string(),
                text: c.representative_text.clone(),
                similarity: c.similarity,
            })
            .collect();

        match self
            .deps
            .engine
            .validate_claim_equivalence(&adu.text, &shown)
            .await
        {
            Ok(Some(id)) => Verdict::Matched(id),
            Ok(None) => Verdict::NoMatch,
            Err(e) => {
                warn!(
                    adu_id = %adu.id,
                    candidates = candidates.len(),
                    error = %e,
                    "Claim equivalence check failed, treating claim as novel"
                );
                Verdict::Unavailable
            }
        }
    }
}
