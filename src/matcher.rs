use crate::index::{MatchResult, SimilarityIndex};
use crate::{EmployeeId, FaceEmbedder, FaceVector, NoFace};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, warn};

/// The reason given when an image yields no face vector.
pub const REASON_NO_FACE: &str = "no face detected";

/// The reason given when embedding exceeds its time budget.
pub const REASON_TIMED_OUT: &str = "embedding timed out";

/// The reason given when there is nothing to match against.
pub const REASON_INDEX_EMPTY: &str = "index empty";

/// The reason given when the nearest stored face is too far away.
pub const REASON_BELOW_THRESHOLD: &str = "below threshold";

/// The reason given when access is granted.
pub const REASON_RECOGNIZED: &str = "recognized";

/// Whether access is granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Access is granted.
    Granted,
    /// Access is denied.
    Denied,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Granted => write!(f, "granted"),
            Outcome::Denied => write!(f, "denied"),
        }
    }
}

/// The verdict on a single recognition request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the face was matched to an employee.
    pub recognized: bool,
    /// The matched employee, if any.
    pub employee_id: Option<EmployeeId>,
    /// One minus the distance to the nearest stored face.
    ///
    /// This is not a probability: it is unbounded below and should be clamped before being shown as a percentage.
    pub score: Option<f64>,
    /// Whether access is granted.
    pub outcome: Outcome,
    /// A human-readable explanation.
    pub reason: String,
}

impl Decision {
    fn denied(score: Option<f64>, reason: impl Into<String>) -> Self {
        Self {
            recognized: false,
            employee_id: None,
            score,
            outcome: Outcome::Denied,
            reason: reason.into(),
        }
    }

    /// A denial for an image that yielded no face vector.
    pub fn no_face(no_face: &NoFace) -> Self {
        match no_face {
            NoFace::TimedOut => Self::denied(None, REASON_TIMED_OUT),
            NoFace::NotDetected | NoFace::EmbeddingFailure(_) => Self::denied(None, REASON_NO_FACE),
        }
    }

    /// A denial for a search against an empty index.
    pub fn index_empty() -> Self {
        Self::denied(None, REASON_INDEX_EMPTY)
    }

    /// Whether access is granted.
    pub fn is_granted(&self) -> bool {
        self.outcome == Outcome::Granted
    }
}

/// Applies the decision threshold to the nearest stored face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matcher {
    threshold: f64,
}

impl Matcher {
    /// Create a matcher.
    ///
    /// # Arguments
    ///
    /// * `threshold` - Faces strictly closer than this squared-euclidean distance are granted access.
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// The distance threshold.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Decide on the nearest stored face.
    ///
    /// The threshold bounds the raw distance, not the score: a match at exactly the threshold is denied.
    pub fn decide(&self, nearest: Option<&MatchResult>) -> Decision {
        let nearest = match nearest {
            Some(nearest) => nearest,
            None => return Decision::index_empty(),
        };
        let score = 1.0 - nearest.distance;
        match nearest.distance < self.threshold {
            true => Decision {
                recognized: true,
                employee_id: Some(nearest.employee_id),
                score: Some(score),
                outcome: Outcome::Granted,
                reason: REASON_RECOGNIZED.to_string(),
            },
            false => Decision::denied(Some(score), REASON_BELOW_THRESHOLD),
        }
    }

    /// Decide on an embedding attempt.
    ///
    /// # Arguments
    ///
    /// * `embedding` - The query vector, or the reason there is none.
    ///
    /// * `index` - The stored faces.
    pub fn verdict(
        &self,
        embedding: Result<FaceVector, NoFace>,
        index: &SimilarityIndex,
    ) -> Decision {
        let vector = match embedding {
            Ok(vector) => vector,
            Err(no_face) => {
                if no_face.is_failure() {
                    warn!(reason = %no_face, "could not embed recognition image");
                }
                return Decision::no_face(&no_face);
            }
        };
        match index.search(&vector, 1) {
            Ok(nearest) => self.decide(nearest.first()),
            Err(e) => {
                error!(error = %e, "recognition search failed");
                Decision::denied(None, e.to_string())
            }
        }
    }

    /// Identify the face in an image.
    ///
    /// # Arguments
    ///
    /// * `embedder` - Computes the query vector.
    ///
    /// * `index` - The stored faces.
    ///
    /// * `image` - The encoded bytes of the captured image.
    pub fn recognize(
        &self,
        embedder: &dyn FaceEmbedder,
        index: &SimilarityIndex,
        image: &[u8],
    ) -> Decision {
        self.verdict(embedder.embed(image), index)
    }
}
