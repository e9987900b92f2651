use crate::distance::{from_unit, DistanceUnit, L2SquaredDistance};
use crate::{EmbeddingPrecision, EmployeeId, Error, FaceVector, Slot};
use rayon::iter::{IndexedParallelIterator, ParallelIterator};
use rayon::slice::ParallelSlice;
use serde::{Deserialize, Serialize};
use space::Metric;
use std::collections::HashSet;

/// A stored vector near a query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// The employee the stored vector belongs to.
    pub employee_id: EmployeeId,
    /// The squared euclidean distance between the query and the stored vector.
    pub distance: f64,
    /// The slot of the stored vector.
    pub slot: Slot,
}

/// An in-memory collection of face vectors, each owned by an employee.
///
/// Vectors are kept contiguously, one run of `dimension` components per slot.
/// Slots are assigned in insertion order and never reused; individual vectors cannot be removed, so the index is rebuilt instead.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityIndex {
    dimension: usize,
    vectors: Vec<EmbeddingPrecision>,
    owners: Vec<EmployeeId>,
}

impl SimilarityIndex {
    /// Create an empty index.
    ///
    /// # Arguments
    ///
    /// * `dimension` - The dimensionality of every vector in the index.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: Vec::new(),
            owners: Vec::new(),
        }
    }

    /// Reassemble an index from its raw parts.
    ///
    /// # Arguments
    ///
    /// * `dimension` - The dimensionality of every vector in the index.
    ///
    /// * `vectors` - The components of every vector, slot by slot.
    ///
    /// * `owners` - The employee owning each slot.
    pub fn from_parts(
        dimension: usize,
        vectors: Vec<EmbeddingPrecision>,
        owners: Vec<EmployeeId>,
    ) -> Result<Self, Error> {
        if dimension == 0 {
            return Err(Error::IndexCorrupt("zero dimensionality".into()));
        }
        let expected = owners.len().checked_mul(dimension);
        if expected != Some(vectors.len()) {
            return Err(Error::IndexCorrupt(format!(
                "{} components cannot hold {} vectors of {} dimensions",
                vectors.len(),
                owners.len(),
                dimension
            )));
        }
        Ok(Self {
            dimension,
            vectors,
            owners,
        })
    }

    /// The dimensionality of every vector in the index.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// The number of vectors in the index.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// Whether the index holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// The number of distinct employees with at least one vector in the index.
    pub fn employee_count(&self) -> usize {
        self.owners.iter().collect::<HashSet<_>>().len()
    }

    /// The components of every vector, slot by slot.
    pub fn raw_vectors(&self) -> &[EmbeddingPrecision] {
        &self.vectors
    }

    /// The employee owning each slot.
    pub fn owners(&self) -> &[EmployeeId] {
        &self.owners
    }

    /// The vector stored at a slot.
    pub fn vector(&self, slot: Slot) -> Option<&[EmbeddingPrecision]> {
        let start = slot.checked_mul(self.dimension)?;
        self.vectors.get(start..start + self.dimension)
    }

    /// The employee owning a slot.
    pub fn employee(&self, slot: Slot) -> Option<EmployeeId> {
        self.owners.get(slot).copied()
    }

    fn check_dimension(&self, actual: usize) -> Result<(), Error> {
        match actual == self.dimension {
            true => Ok(()),
            false => Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual,
            }),
        }
    }

    /// Append a vector to the index.
    ///
    /// # Arguments
    ///
    /// * `employee_id` - The employee the vector belongs to.
    ///
    /// * `vector` - The vector to append.
    ///
    /// # Returns
    ///
    /// The slot the vector was stored at.
    pub fn add(&mut self, employee_id: EmployeeId, vector: &FaceVector) -> Result<Slot, Error> {
        self.check_dimension(vector.dimension())?;
        let slot = self.owners.len();
        self.vectors.extend_from_slice(vector.as_slice());
        self.owners.push(employee_id);
        Ok(slot)
    }

    /// Perform an exact *k* nearest neighbours search.
    ///
    /// # Arguments
    ///
    /// * `query` - The query vector.
    ///
    /// * `top_k` - The maximum number of neighbours to return.
    ///
    /// # Returns
    ///
    /// Up to `top_k` stored vectors ordered by ascending distance from the query; equal distances are ordered by slot.
    pub fn search(
        &self,
        query: &[EmbeddingPrecision],
        top_k: usize,
    ) -> Result<Vec<MatchResult>, Error> {
        self.check_dimension(query.len())?;
        if top_k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<(DistanceUnit, Slot)> = self
            .vectors
            .par_chunks_exact(self.dimension)
            .enumerate()
            .map(|(slot, stored)| (L2SquaredDistance.distance(&query, &stored), slot))
            .collect();
        if top_k < candidates.len() {
            candidates.select_nth_unstable(top_k - 1);
            candidates.truncate(top_k);
        }
        candidates.sort_unstable();

        Ok(candidates
            .into_iter()
            .map(|(distance, slot)| MatchResult {
                employee_id: self.owners[slot],
                distance: from_unit(distance),
                slot,
            })
            .collect())
    }
}
