//! Checks on what the engine hands back before any of it is stored.

use std::collections::HashSet;

use dialectic_core::{AduType, ParseEnumError, PipelineError, RelationType};
use discourse_client::{ExtractedAdu, ExtractedRelation};
use uuid::Uuid;

use crate::analysis::models::{Adu, NewRelation};

#[derive(Debug, Clone, PartialEq)]
pub struct ValidAdu {
    pub adu_type: AduType,
    pub text: String,
    pub span_start: i32,
    pub span_end: i32,
    pub confidence: f64,
}

/// Parse ADU types and bounds-check spans against the analysed text.
pub fn validate_adus(
    extracted: &[ExtractedAdu],
    content: &str,
) -> Result<Vec<ValidAdu>, PipelineError> {
    let limit = content.len() as i64;
    extracted
        .iter()
        .map(|adu| {
            let adu_type: AduType = adu
                .adu_type
                .parse()
                .map_err(|e: ParseEnumError| PipelineError::Malformed(e.to_string()))?;
            let (start, end) = (adu.span_start as i64, adu.span_end as i64);
            if start < 0 || end < start || end > limit {
                return Err(PipelineError::Malformed(format!(
                    "ADU span {start}..{end} outside content of length {limit}"
                )));
            }
            if adu.text.trim().is_empty() {
                return Err(PipelineError::Malformed("ADU with empty text".into()));
            }
            Ok(ValidAdu {
                adu_type,
                text: adu.text.clone(),
                span_start: adu.span_start,
                span_end: adu.span_end,
                confidence: adu.confidence.clamp(0.0, 1.0),
            })
        })
        .collect()
}

/// Resolve relation endpoints against the run's stored ADUs.
///
/// Self-loops are dropped. An endpoint that is not one of `adus` means the
/// engine answered about something it was not asked.
pub fn map_relations(
    extracted: &[ExtractedRelation],
    adus: &[Adu],
) -> Result<Vec<NewRelation>, PipelineError> {
    let known: HashSet<Uuid> = adus.iter().map(|a| a.id).collect();
    let resolve = |raw: &str| -> Result<Uuid, PipelineError> {
        raw.parse::<Uuid>()
            .ok()
            .filter(|id| known.contains(id))
            .ok_or_else(|| {
                PipelineError::Malformed(format!("relation references unknown ADU {raw:?}"))
            })
    };

    let mut relations = Vec::with_capacity(extracted.len());
    for rel in extracted {
        let source_adu_id = resolve(&rel.source_id)?;
        let target_adu_id = resolve(&rel.target_id)?;
        if source_adu_id == target_adu_id {
            continue;
        }
        let relation_type: RelationType = rel
            .relation_type
            .parse()
            .map_err(|e: dialectic_core::ParseEnumError| PipelineError::Malformed(e.to_string()))?;
        relations.push(NewRelation {
            source_adu_id,
            target_adu_id,
            relation_type,
            confidence: rel.confidence.clamp(0.0, 1.0),
        });
    }
    Ok(relations)
}
