pub mod config;
pub mod deps;
pub mod error;
pub mod file_config;
pub mod hashing;
pub mod types;

pub use config::AppConfig;
pub use deps::WorkerDeps;
pub use error::{ParseEnumError, PipelineError};
pub use file_config::{
    DedupConfig, EngineConfig, FileConfig, QueueConfig, SearchConfig, WorkerConfig,
    DEFAULT_SEARCH_THRESHOLD,
};
pub use hashing::{claim_text_hash, content_hash};
pub use types::*;
