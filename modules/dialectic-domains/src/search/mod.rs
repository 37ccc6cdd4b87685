pub mod content_embedding;

pub use content_embedding::{ContentEmbedding, SearchHit};
pub use dialectic_core::DEFAULT_SEARCH_THRESHOLD;
