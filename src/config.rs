use crate::{Error, DEFAULT_DIMENSION, DEFAULT_SIMILARITY_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs};

/// The prefix of environment variables overriding the configuration.
pub const ENV_PREFIX: &str = "FACEGATE_";

/// Settings supplied at startup and fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The dimensionality of face vectors.
    pub dimension: usize,
    /// Faces closer than this squared-euclidean distance are granted access.
    pub similarity_threshold: f64,
    /// The minimum confidence of a face detection.
    pub min_detection_confidence: f32,
    /// The minimum width and height of a face detection, in pixels.
    pub min_face_size: u32,
    /// The file holding the raw vectors of the index.
    pub index_path: PathBuf,
    /// The file holding the slot-to-employee mapping of the index.
    pub mapping_path: PathBuf,
    /// The time budget of embedding a single image, in milliseconds.
    pub embed_timeout_ms: u64,
    /// How many embeddings may run at once, counting those abandoned after their time budget ran out.
    pub max_pending_embeddings: usize,
    /// How many times a failed persist is attempted.
    pub persist_attempts: u32,
    /// The delay between persist attempts, multiplied by the attempt number, in milliseconds.
    pub persist_backoff_ms: u64,
    /// The maximum number of photos enrolled in one batch.
    pub max_photos_per_upload: usize,
    /// The root of the employee photo directories.
    pub photos_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_DIMENSION,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            min_detection_confidence: 0.7,
            min_face_size: 20,
            index_path: PathBuf::from("models/face_index.vectors"),
            mapping_path: PathBuf::from("models/face_index.meta"),
            embed_timeout_ms: 5000,
            max_pending_embeddings: 32,
            persist_attempts: 3,
            persist_backoff_ms: 50,
            max_photos_per_upload: 10,
            photos_dir: PathBuf::from("uploads"),
        }
    }
}

impl Config {
    /// Load the configuration.
    ///
    /// # Arguments
    ///
    /// * `path` - An optional JSON file; missing fields take their defaults.
    ///
    /// # Returns
    ///
    /// The file's settings with `FACEGATE_*` environment overrides applied.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let mut config = match path {
            Some(path) => {
                let bytes = fs::read(path).map_err(|e| {
                    Error::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
                })?;
                serde_json::from_slice(&bytes).map_err(|e| {
                    Error::InvalidConfig(format!("cannot parse {}: {}", path.display(), e))
                })?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), Error> {
        if let Some(dimension) = env_var("DIMENSION")? {
            self.dimension = dimension;
        }
        if let Some(threshold) = env_var("SIMILARITY_THRESHOLD")? {
            self.similarity_threshold = threshold;
        }
        if let Some(timeout) = env_var("EMBED_TIMEOUT_MS")? {
            self.embed_timeout_ms = timeout;
        }
        if let Some(path) = env_var("INDEX_PATH")? {
            self.index_path = path;
        }
        if let Some(path) = env_var("MAPPING_PATH")? {
            self.mapping_path = path;
        }
        if let Some(path) = env_var("PHOTOS_DIR")? {
            self.photos_dir = path;
        }
        Ok(())
    }

    /// Check that the settings are usable.
    pub fn validate(&self) -> Result<(), Error> {
        if self.dimension == 0 {
            return Err(Error::InvalidConfig("dimension must be positive".into()));
        }
        if !self.similarity_threshold.is_finite() || self.similarity_threshold <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "similarity threshold must be a positive number, got {}",
                self.similarity_threshold
            )));
        }
        if self.max_pending_embeddings == 0 {
            return Err(Error::InvalidConfig(
                "at least one pending embedding is required".into(),
            ));
        }
        if self.persist_attempts == 0 {
            return Err(Error::InvalidConfig(
                "at least one persist attempt is required".into(),
            ));
        }
        if self.index_path == self.mapping_path {
            return Err(Error::InvalidConfig(
                "index and mapping paths must differ".into(),
            ));
        }
        Ok(())
    }

    /// The time budget of embedding a single image.
    pub fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }

    /// The delay before the given retry of a persist.
    pub fn persist_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.persist_backoff_ms.saturating_mul(attempt as u64))
    }
}

fn env_var<T: FromStr>(name: &str) -> Result<Option<T>, Error>
where
    T::Err: std::fmt::Display,
{
    let key = format!("{}{}", ENV_PREFIX, name);
    match env::var(&key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", key, e))),
        Err(_) => Ok(None),
    }
}
