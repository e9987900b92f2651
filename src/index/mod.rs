/// An exact, brute-force similarity index.
pub mod flat;

pub use flat::{MatchResult, SimilarityIndex};
