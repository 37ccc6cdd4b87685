//! Typed errors shared across the pipeline.

use discourse_client::DiscourseError;
use thiserror::Error;

/// A stored enum column held a value the code does not know.
#[derive(Debug, Clone, Error)]
#[error("invalid {field}: {value:?}")]
pub struct ParseEnumError {
    pub field: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(field: &'static str, value: impl Into<String>) -> Self {
        Self {
            field,
            value: value.into(),
        }
    }
}

/// Why one attempt at analysing a piece of content failed.
///
/// The `Display` text is what lands in `analysis_runs.error_message`.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Engine timeout, connection failure or 5xx. The queue retries.
    #[error("discourse engine unavailable: {0}")]
    Transient(#[source] DiscourseError),

    /// Engine answered, but the answer breaks the contract.
    #[error("malformed engine response: {0}")]
    Malformed(String),

    /// Database or transaction failure; nothing from the attempt was committed
    /// past the failing step.
    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),

    /// The whole job exceeded its time budget.
    #[error("job timed out after {0}s")]
    Timeout(u64),

    /// Another attempt is still processing different content for this source.
    #[error("analysis run {0} is still processing")]
    InProgress(uuid::Uuid),
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::Transient(_) | PipelineError::Timeout(_) | PipelineError::InProgress(_)
        )
    }
}

impl From<DiscourseError> for PipelineError {
    fn from(err: DiscourseError) -> Self {
        if err.is_transient() {
            PipelineError::Transient(err)
        } else {
            PipelineError::Malformed(err.to_string())
        }
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Store(err)
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Store(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_split_into_transient_and_malformed() {
        let transient: PipelineError = DiscourseError::Timeout.into();
        assert!(transient.is_transient());

        let malformed: PipelineError = DiscourseError::DimensionMismatch {
            expected: 768,
            actual: 512,
        }
        .into();
        assert!(!malformed.is_transient());
        assert_eq!(
            malformed.to_string(),
            "malformed engine response: embedding dimension mismatch: expected 768, got 512"
        );
    }
}
