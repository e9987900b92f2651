#![doc = "An embedding index and matching engine for face-recognition access control."]
#![warn(missing_docs)]

/// Rebuilding the index from the authoritative set of employees and photos.
pub mod builder;
/// Runtime configuration.
pub mod config;
/// Distance metrics between face vectors.
pub mod distance;
/// Errors and expected non-results.
pub mod error;
/// The in-memory similarity index.
pub mod index;
/// Threshold-based access decisions.
pub mod matcher;
/// Face embedding models.
pub mod model;
/// The shared recognition service.
pub mod service;
/// The employee & photo collaborator.
pub mod source;
/// Durable on-disk representation of the index.
pub mod store;

pub use config::Config;
pub use error::{Error, NoFace};
pub use matcher::{Decision, Outcome};
pub use model::core::{FaceEmbedder, FaceVector};
pub use service::RecognitionService;

/// The identifier of an employee in the external employee store.
pub type EmployeeId = i64;

/// A dense, zero-based position of a vector within the index.
pub type Slot = usize;

/// The precision of face vector components.
pub type EmbeddingPrecision = f32;

/// The default dimensionality of face vectors.
pub const DEFAULT_DIMENSION: usize = 512;

/// The default maximum distance below which two faces are considered the same identity.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.6;
