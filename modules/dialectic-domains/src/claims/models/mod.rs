pub mod canonical_claim;
pub mod canonical_mapping;

pub use canonical_claim::{CanonicalClaim, CreatedClaim, SimilarClaim};
pub use canonical_mapping::CanonicalMapping;
