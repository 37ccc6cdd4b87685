pub mod adu;
pub mod adu_embedding;
pub mod analysis_run;
pub mod argument_relation;

pub use adu::{Adu, NewAdu};
pub use adu_embedding::AduEmbedding;
pub use analysis_run::{AnalysisRun, RunSlot};
pub use argument_relation::{ArgumentRelation, NewRelation};
