pub mod activities;
pub mod models;
pub mod worker;

pub use worker::{AnalysisWorker, Outcome, RunSummary, UNCHANGED_NOTE};
