use crate::index::SimilarityIndex;
use crate::source::{EmployeePhotoSource, PhotoRef};
use crate::{EmployeeId, Error, FaceEmbedder, FaceVector, NoFace, Slot};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use tracing::{debug, info};

/// Why a photo contributed no vector to a rebuilt index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The employee's photos could not be listed.
    Unlisted(String),
    /// The photo could not be read.
    Unreadable(String),
    /// The photo yielded no face vector.
    NoFace(NoFace),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Unlisted(reason) => write!(f, "photos not listed: {}", reason),
            SkipReason::Unreadable(reason) => write!(f, "photo not readable: {}", reason),
            SkipReason::NoFace(no_face) => write!(f, "{}", no_face),
        }
    }
}

/// A photo, or an employee's whole photo set, left out of a rebuilt index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPhoto {
    /// The employee pictured.
    pub employee_id: EmployeeId,
    /// The photo, or `None` when the employee's photos could not be listed.
    pub path: Option<PathBuf>,
    /// Why it was left out.
    pub reason: SkipReason,
}

/// The result of embedding one photo during a rebuild.
#[derive(Debug, Clone, PartialEq)]
pub enum PhotoOutcome {
    /// The photo was embedded and stored at a slot.
    Embedded(Slot),
    /// The photo was left out.
    Skipped(SkipReason),
}

/// A summary of a rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// The number of active employees.
    pub employees: usize,
    /// The number of reference photos listed.
    pub photos: usize,
    /// The number of vectors in the rebuilt index.
    pub embedded: usize,
    /// Every photo left out, in source order.
    pub skipped: Vec<SkippedPhoto>,
}

/// Regenerates a [`SimilarityIndex`] from the authoritative set of employees and photos.
pub struct IndexBuilder<'a> {
    embedder: &'a dyn FaceEmbedder,
    dimension: usize,
}

impl<'a> IndexBuilder<'a> {
    /// Create a builder.
    ///
    /// # Arguments
    ///
    /// * `embedder` - Computes a vector for each photo.
    ///
    /// * `dimension` - The dimensionality of the rebuilt index.
    pub fn new(embedder: &'a dyn FaceEmbedder, dimension: usize) -> Self {
        Self {
            embedder,
            dimension,
        }
    }

    fn embed_photo(
        &self,
        source: &dyn EmployeePhotoSource,
        photo: &PhotoRef,
    ) -> Result<FaceVector, SkipReason> {
        let bytes = source
            .read_photo(photo)
            .map_err(|e| SkipReason::Unreadable(format!("{:#}", e)))?;
        match panic::catch_unwind(AssertUnwindSafe(|| self.embedder.embed(&bytes))) {
            Ok(embedding) => embedding.map_err(SkipReason::NoFace),
            Err(_) => Err(SkipReason::NoFace(NoFace::EmbeddingFailure(
                "embedding panicked".into(),
            ))),
        }
    }

    /// Build a fresh index holding one vector per usable photo of every active employee.
    ///
    /// A photo that cannot be read or embedded, or whose embedding panics, is skipped and reported,
    /// never aborting the rebuild.
    /// Slots follow the source's employee order, then its photo order.
    ///
    /// # Arguments
    ///
    /// * `source` - The authoritative employees and photos.
    ///
    /// # Returns
    ///
    /// The new index, which may be empty, and a report of what went into it.
    pub fn rebuild(
        &self,
        source: &dyn EmployeePhotoSource,
    ) -> Result<(SimilarityIndex, RebuildReport), Error> {
        let employees = source.list_active_employees().map_err(Error::Source)?;
        let mut report = RebuildReport {
            employees: employees.len(),
            ..Default::default()
        };

        let mut photos = Vec::new();
        for employee in &employees {
            match source.list_photos(employee.id) {
                Ok(listed) => photos.extend(listed),
                Err(e) => {
                    debug!(employee_id = employee.id, error = %e, "skipping employee photos");
                    report.skipped.push(SkippedPhoto {
                        employee_id: employee.id,
                        path: None,
                        reason: SkipReason::Unlisted(format!("{:#}", e)),
                    });
                }
            }
        }
        report.photos = photos.len();

        let embeddings: Vec<Result<FaceVector, SkipReason>> = photos
            .par_iter()
            .map(|photo| self.embed_photo(source, photo))
            .collect();

        let mut index = SimilarityIndex::new(self.dimension);
        for (photo, embedding) in photos.into_iter().zip(embeddings) {
            match self.outcome(&mut index, &photo, embedding)? {
                PhotoOutcome::Embedded(_) => report.embedded += 1,
                PhotoOutcome::Skipped(reason) => report.skipped.push(SkippedPhoto {
                    employee_id: photo.employee_id,
                    path: Some(photo.path),
                    reason,
                }),
            }
        }

        info!(
            employees = report.employees,
            photos = report.photos,
            embedded = report.embedded,
            skipped = report.skipped.len(),
            "rebuilt face index"
        );
        Ok((index, report))
    }

    fn outcome(
        &self,
        index: &mut SimilarityIndex,
        photo: &PhotoRef,
        embedding: Result<FaceVector, SkipReason>,
    ) -> Result<PhotoOutcome, Error> {
        match embedding {
            Ok(vector) => Ok(PhotoOutcome::Embedded(index.add(photo.employee_id, &vector)?)),
            Err(reason) => {
                match &reason {
                    SkipReason::NoFace(no_face) if no_face.is_failure() => debug!(
                        employee_id = photo.employee_id,
                        path = %photo.path.display(),
                        error = %no_face,
                        "embedding failed, skipping photo"
                    ),
                    _ => debug!(
                        employee_id = photo.employee_id,
                        path = %photo.path.display(),
                        reason = %reason,
                        "skipping photo"
                    ),
                }
                Ok(PhotoOutcome::Skipped(reason))
            }
        }
    }
}
