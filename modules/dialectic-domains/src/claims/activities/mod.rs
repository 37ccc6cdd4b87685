pub mod deduplicate;

pub use deduplicate::{decide, ClaimDeduplicator, CreateReason, Decision, DedupOutcome, Verdict};
