use crate::{EmbeddingPrecision, NoFace};
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// A unit-length face signature of fixed dimensionality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceVector(Vec<EmbeddingPrecision>);

impl FaceVector {
    /// L2-normalise a raw feature vector.
    ///
    /// # Arguments
    ///
    /// * `raw` - The unnormalised output of a feature extractor.
    ///
    /// # Returns
    ///
    /// A unit-length vector, or `None` if `raw` is empty, has zero length, or contains non-finite values.
    pub fn normalize(mut raw: Vec<EmbeddingPrecision>) -> Option<Self> {
        if raw.is_empty() || raw.iter().any(|x| !x.is_finite()) {
            return None;
        }
        let norm = raw
            .iter()
            .map(|x| (*x as f64) * (*x as f64))
            .sum::<f64>()
            .sqrt();
        if norm == 0.0 || !norm.is_finite() {
            return None;
        }
        for x in raw.iter_mut() {
            *x = (*x as f64 / norm) as EmbeddingPrecision;
        }
        Some(Self(raw))
    }

    /// The dimensionality of the vector.
    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    /// The euclidean length of the vector; one within floating-point tolerance.
    pub fn norm(&self) -> f64 {
        self.0
            .iter()
            .map(|x| (*x as f64) * (*x as f64))
            .sum::<f64>()
            .sqrt()
    }

    /// The components of the vector.
    pub fn as_slice(&self) -> &[EmbeddingPrecision] {
        &self.0
    }

    /// Take ownership of the components of the vector.
    pub fn into_inner(self) -> Vec<EmbeddingPrecision> {
        self.0
    }
}

impl Deref for FaceVector {
    type Target = [EmbeddingPrecision];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Turns an image into a face vector.
///
/// Implementations hold their model weights for the lifetime of the process and are shared between requests.
pub trait FaceEmbedder: Send + Sync {
    /// The dimensionality of the vectors produced by this embedder.
    fn dimension(&self) -> usize;

    /// Embed the most probable face in an image.
    ///
    /// # Arguments
    ///
    /// * `image` – The encoded bytes of a raster image.
    ///
    /// # Returns
    ///
    /// A unit-length vector of [`FaceEmbedder::dimension`] components, or the reason no vector could be produced.
    fn embed(&self, image: &[u8]) -> Result<FaceVector, NoFace>;
}
