use std::fmt;
use std::io;
use thiserror::Error;

/// Faults of the index, its store, and its collaborators.
#[derive(Error, Debug)]
pub enum Error {
    /// A vector's length does not match the configured dimensionality.
    #[error("vector has {actual} dimensions, index expects {expected}")]
    DimensionMismatch {
        /// The configured dimensionality.
        expected: usize,
        /// The dimensionality of the offending vector.
        actual: usize,
    },

    /// The on-disk index could be read, but its contents are inconsistent.
    #[error("index store is corrupt: {0}")]
    IndexCorrupt(String),

    /// The on-disk index could not be read.
    #[error("index store is unreadable: {0}")]
    StoreUnreadable(#[source] io::Error),

    /// Writing the index to disk failed on every attempt.
    #[error("failed to persist index after {attempts} attempt(s): {source}")]
    Persist {
        /// How many writes were attempted.
        attempts: u32,
        /// The error of the final attempt.
        #[source]
        source: io::Error,
    },

    /// The index metadata could not be encoded.
    #[error("failed to encode index metadata: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// The index metadata could not be decoded.
    #[error("failed to decode index metadata: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// The employee & photo store failed.
    #[error("photo source failed: {0}")]
    Source(#[source] anyhow::Error),

    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// More photos were uploaded at once than allowed.
    #[error("at most {limit} photos may be enrolled at once, got {given}")]
    TooManyPhotos {
        /// The configured upload limit.
        limit: usize,
        /// The number of photos given.
        given: usize,
    },
}

/// The reason an image did not yield a face vector.
///
/// This is an expected outcome, not a fault: callers resolve it to a denial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoFace {
    /// No face region met the minimum detection confidence.
    NotDetected,
    /// Decoding, detection, or extraction failed.
    EmbeddingFailure(String),
    /// Embedding did not finish within its time budget.
    TimedOut,
}

impl NoFace {
    /// Whether this is a compute fault rather than an image without a face.
    pub fn is_failure(&self) -> bool {
        !matches!(self, NoFace::NotDetected)
    }
}

impl fmt::Display for NoFace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoFace::NotDetected => write!(f, "no face detected"),
            NoFace::EmbeddingFailure(reason) => write!(f, "embedding failed: {}", reason),
            NoFace::TimedOut => write!(f, "embedding timed out"),
        }
    }
}
