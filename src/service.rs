use crate::builder::{IndexBuilder, RebuildReport};
use crate::index::SimilarityIndex;
use crate::matcher::Matcher;
use crate::source::EmployeePhotoSource;
use crate::store::IndexStore;
use crate::{Config, Decision, EmployeeId, Error, FaceEmbedder, FaceVector, NoFace, Slot};
use bytes::Bytes;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::thread;
use tracing::{error, info, warn};

/// The result of enrolling one photo.
#[derive(Debug, Clone, PartialEq)]
pub enum Enrollment {
    /// The photo's face was added to the index.
    Enrolled {
        /// The slot the face was stored at.
        slot: Slot,
        /// The face's vector.
        vector: FaceVector,
    },
    /// The photo yielded no face; the index is unchanged.
    NoFace(NoFace),
}

impl Enrollment {
    /// The enrolled face's vector, if any.
    pub fn vector(&self) -> Option<&FaceVector> {
        match self {
            Enrollment::Enrolled { vector, .. } => Some(vector),
            Enrollment::NoFace(_) => None,
        }
    }
}

/// A summary of a batch enrollment.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentReport {
    /// The employee enrolled.
    pub employee_id: EmployeeId,
    /// The slots of the enrolled faces, in upload order.
    pub enrolled: Vec<Slot>,
    /// The position in the upload of every photo without a usable face.
    pub skipped: Vec<(usize, NoFace)>,
}

/// Counts an embedding as pending until dropped, even if the embedding panics.
struct PendingEmbedding(Arc<AtomicUsize>);

impl Drop for PendingEmbedding {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The long-lived recognition engine shared by every request.
///
/// Searches run concurrently against a consistent index.
/// Appends, persists, and rebuilds are serialised by a single writer lock;
/// a rebuild constructs a new index while the old one keeps answering, then swaps it in.
pub struct RecognitionService {
    config: Config,
    embedder: Arc<dyn FaceEmbedder>,
    matcher: Matcher,
    store: IndexStore,
    index: RwLock<SimilarityIndex>,
    writer: Mutex<()>,
    pending: Arc<AtomicUsize>,
}

impl RecognitionService {
    /// Start the service, loading the index from disk or starting empty.
    ///
    /// # Arguments
    ///
    /// * `config` - The process configuration.
    ///
    /// * `embedder` - The embedder, initialised once and reused for every request.
    pub fn open(config: Config, embedder: Arc<dyn FaceEmbedder>) -> Result<Self, Error> {
        config.validate()?;
        if embedder.dimension() != config.dimension {
            return Err(Error::DimensionMismatch {
                expected: config.dimension,
                actual: embedder.dimension(),
            });
        }
        let store = IndexStore::new(config.index_path.clone(), config.mapping_path.clone());
        let index = store.load(config.dimension);
        Ok(Self {
            matcher: Matcher::new(config.similarity_threshold),
            embedder,
            store,
            index: RwLock::new(index),
            writer: Mutex::new(()),
            pending: Arc::new(AtomicUsize::new(0)),
            config,
        })
    }

    /// The process configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The on-disk store of the index.
    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    /// The number of vectors in the index.
    pub fn len(&self) -> usize {
        self.read_index().len()
    }

    /// Whether the index holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.read_index().is_empty()
    }

    /// The number of distinct employees in the index.
    pub fn employee_count(&self) -> usize {
        self.read_index().employee_count()
    }

    /// A copy of the current index.
    pub fn snapshot(&self) -> SimilarityIndex {
        self.read_index().clone()
    }

    fn read_index(&self) -> RwLockReadGuard<'_, SimilarityIndex> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, SimilarityIndex> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Embed an image within the configured time budget.
    ///
    /// The embedding runs on its own thread; if the budget runs out, the thread is abandoned and its result discarded.
    /// Abandoned threads count against `max_pending_embeddings` until they finish, so a hung model
    /// turns further requests away instead of accumulating threads.
    pub fn embed(&self, image: Bytes) -> Result<FaceVector, NoFace> {
        let limit = self.config.max_pending_embeddings;
        if self.pending.fetch_add(1, Ordering::SeqCst) >= limit {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!(limit, "too many embeddings in flight");
            return Err(NoFace::EmbeddingFailure(format!(
                "more than {} embeddings in flight",
                limit
            )));
        }
        let pending = PendingEmbedding(Arc::clone(&self.pending));

        let (sender, receiver) = mpsc::sync_channel(1);
        let embedder = Arc::clone(&self.embedder);
        let spawned = thread::Builder::new()
            .name("facegate-embed".into())
            .spawn(move || {
                let embedding = embedder.embed(&image);
                drop(pending);
                let _ = sender.send(embedding);
            });
        if let Err(e) = spawned {
            return Err(NoFace::EmbeddingFailure(format!(
                "cannot start embedding: {}",
                e
            )));
        }
        match receiver.recv_timeout(self.config.embed_timeout()) {
            Ok(embedding) => embedding,
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout_ms = self.config.embed_timeout_ms, "embedding timed out");
                Err(NoFace::TimedOut)
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(NoFace::EmbeddingFailure("embedding panicked".into()))
            }
        }
    }

    /// Identify the face in a captured image.
    ///
    /// Anything short of a confident match is a denial. The caller is responsible for logging the decision.
    pub fn recognize(&self, image: Bytes) -> Decision {
        let embedding = self.embed(image);
        let decision = self.matcher.verdict(embedding, &self.read_index());
        info!(
            outcome = %decision.outcome,
            employee_id = ?decision.employee_id,
            score = ?decision.score,
            reason = %decision.reason,
            "recognition"
        );
        decision
    }

    /// Add a reference photo of an employee to the index.
    ///
    /// # Returns
    ///
    /// The enrolled vector and its slot, or why the photo yielded none. An error means the vector could not be added or persisted;
    /// a vector added in memory but not persisted remains searchable and is written with the next successful persist.
    pub fn enroll(&self, employee_id: EmployeeId, image: Bytes) -> Result<Enrollment, Error> {
        let vector = match self.embed(image) {
            Ok(vector) => vector,
            Err(no_face) => {
                info!(employee_id, reason = %no_face, "photo not enrolled");
                return Ok(Enrollment::NoFace(no_face));
            }
        };
        let _writer = self.lock_writer();
        let slot = self.write_index().add(employee_id, &vector)?;
        info!(employee_id, slot, "enrolled face");
        self.persist()?;
        Ok(Enrollment::Enrolled { slot, vector })
    }

    /// Add several reference photos of an employee to the index, persisting once.
    ///
    /// # Arguments
    ///
    /// * `employee_id` - The employee pictured.
    ///
    /// * `images` - At most `max_photos_per_upload` encoded images.
    pub fn enroll_batch(
        &self,
        employee_id: EmployeeId,
        images: &[Bytes],
    ) -> Result<EnrollmentReport, Error> {
        if images.len() > self.config.max_photos_per_upload {
            return Err(Error::TooManyPhotos {
                limit: self.config.max_photos_per_upload,
                given: images.len(),
            });
        }
        let embeddings: Vec<Result<FaceVector, NoFace>> = images
            .par_iter()
            .map(|image| self.embed(image.clone()))
            .collect();

        let mut report = EnrollmentReport {
            employee_id,
            enrolled: Vec::new(),
            skipped: Vec::new(),
        };
        let _writer = self.lock_writer();
        {
            let mut index = self.write_index();
            for (position, embedding) in embeddings.into_iter().enumerate() {
                match embedding {
                    Ok(vector) => report.enrolled.push(index.add(employee_id, &vector)?),
                    Err(no_face) => report.skipped.push((position, no_face)),
                }
            }
        }
        info!(
            employee_id,
            enrolled = report.enrolled.len(),
            skipped = report.skipped.len(),
            "enrolled photos"
        );
        if !report.enrolled.is_empty() {
            self.persist()?;
        }
        Ok(report)
    }

    /// Replace the index with one built from the authoritative employees and photos.
    ///
    /// Searches keep using the previous index until the new one is complete. If the source cannot be listed, the previous index is kept.
    pub fn rebuild(&self, source: &dyn EmployeePhotoSource) -> Result<RebuildReport, Error> {
        let _writer = self.lock_writer();
        let (index, report) =
            IndexBuilder::new(self.embedder.as_ref(), self.config.dimension).rebuild(source)?;
        *self.write_index() = index;
        self.persist()?;
        Ok(report)
    }

    /// Write the current index to disk, retrying on failure. Callers hold the writer lock.
    fn persist(&self) -> Result<(), Error> {
        let encoded = self.store.encode(&self.read_index())?;
        let mut attempt = 1;
        loop {
            match self.store.write(&encoded) {
                Ok(()) => return Ok(()),
                Err(source) if attempt < self.config.persist_attempts => {
                    warn!(attempt, error = %source, "failed to persist face index, retrying");
                    thread::sleep(self.config.persist_backoff(attempt));
                    attempt += 1;
                }
                Err(source) => {
                    error!(attempts = attempt, error = %source, "failed to persist face index");
                    return Err(Error::Persist {
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }
}
