use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscourseError>;

#[derive(Debug, Error)]
pub enum DiscourseError {
    #[error("discourse engine timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    /// Embedding width disagrees with the configured dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Response parsed but violates the contract (wrong counts, missing fields).
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl DiscourseError {
    /// Timeouts, connection failures and 5xx responses are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            DiscourseError::Timeout | DiscourseError::Network(_) => true,
            DiscourseError::Api { status, .. } => *status >= 500 || *status == 429,
            DiscourseError::Parse(_)
            | DiscourseError::DimensionMismatch { .. }
            | DiscourseError::Malformed(_) => false,
        }
    }
}

impl From<reqwest::Error> for DiscourseError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DiscourseError::Timeout
        } else if err.is_decode() {
            DiscourseError::Parse(err.to_string())
        } else {
            DiscourseError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DiscourseError {
    fn from(err: serde_json::Error) -> Self {
        DiscourseError::Parse(err.to_string())
    }
}
