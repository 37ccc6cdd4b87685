pub mod analysis;
pub mod claims;
pub mod content;
pub mod queue;
pub mod recovery;
pub mod runtime;
pub mod search;

#[cfg(feature = "test-utils")]
pub mod testutil;

pub use analysis::{AnalysisWorker, Outcome, RunSummary};
pub use content::{ContentItem, ContentSource, PgContentSource};
pub use queue::{JobHandle, JobQueue};
pub use recovery::{recover_orphaned_runs, RecoveryReport};
pub use runtime::{handle_job, WorkerRuntime};

/// Schema migrations for the analysis pipeline tables.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");
