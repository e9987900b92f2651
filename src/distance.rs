use crate::{EmbeddingPrecision, FaceVector};
use serde::{Deserialize, Serialize};
use simsimd::SpatialSimilarity;
use space::Metric;

/// The data type representing the distance between two embeddings.
///
/// Distances are non-negative floats stored as their bit patterns,
/// which order the same way as the floats themselves.
pub type DistanceUnit = u64;

/// Convert a non-negative distance to its totally-ordered representation.
pub fn to_unit(distance: f64) -> DistanceUnit {
    // Folds -0.0 into 0.0; NaN sorts after every real distance.
    if distance > 0.0 {
        distance.to_bits()
    } else if distance.is_nan() {
        f64::INFINITY.to_bits()
    } else {
        0.0f64.to_bits()
    }
}

/// Recover a distance from its totally-ordered representation.
pub fn from_unit(unit: DistanceUnit) -> f64 {
    f64::from_bits(unit)
}

#[derive(Default, Debug, Clone, Copy, Serialize, Deserialize)]
/// The L2-squared distance metric.
pub struct L2SquaredDistance;

impl L2SquaredDistance {
    /// The squared euclidean distance between two equally long slices.
    pub fn between(a: &[EmbeddingPrecision], b: &[EmbeddingPrecision]) -> f64 {
        f32::sqeuclidean(a, b).unwrap_or(f64::INFINITY)
    }

    /// The squared euclidean distance between two equally long slices, as a [`DistanceUnit`].
    pub fn unit(a: &[EmbeddingPrecision], b: &[EmbeddingPrecision]) -> DistanceUnit {
        to_unit(Self::between(a, b))
    }
}

impl<'a> Metric<&'a [EmbeddingPrecision]> for L2SquaredDistance {
    type Unit = DistanceUnit;
    fn distance(&self, a: &&'a [EmbeddingPrecision], b: &&'a [EmbeddingPrecision]) -> Self::Unit {
        Self::unit(a, b)
    }
}

impl Metric<FaceVector> for L2SquaredDistance {
    type Unit = DistanceUnit;
    fn distance(&self, a: &FaceVector, b: &FaceVector) -> Self::Unit {
        Self::unit(a, b)
    }
}
