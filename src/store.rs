use crate::index::SimilarityIndex;
use crate::{EmbeddingPrecision, EmployeeId, Error};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The first bytes of a vector file.
pub const VECTORS_MAGIC: &[u8; 4] = b"FGVX";

/// The version of the on-disk layout.
pub const FORMAT_VERSION: u32 = 1;

/// magic + version + generation + dimension + count
const HEADER_LEN: usize = 4 + 4 + 16 + 8 + 8;

const COMPONENT_LEN: usize = std::mem::size_of::<EmbeddingPrecision>();

#[derive(Debug, Serialize, Deserialize)]
struct IndexMetadata {
    format: u32,
    generation: [u8; 16],
    dimension: usize,
    owners: Vec<EmployeeId>,
}

/// The bytes of both index files, ready to be written.
///
/// Both files carry the same generation; a vector file and a mapping file from different writes are rejected on load.
#[derive(Debug, Clone)]
pub struct EncodedIndex {
    generation: Uuid,
    vectors: Vec<u8>,
    mapping: Vec<u8>,
}

impl EncodedIndex {
    /// The identifier shared by both files of this write.
    pub fn generation(&self) -> Uuid {
        self.generation
    }
}

/// The durable on-disk form of a [`SimilarityIndex`].
///
/// Two files are kept: the raw vectors (count × dimension little-endian floats behind a short header) and the slot-to-employee mapping.
#[derive(Debug, Clone)]
pub struct IndexStore {
    vectors_path: PathBuf,
    mapping_path: PathBuf,
}

impl IndexStore {
    /// Create a store over a pair of files.
    ///
    /// # Arguments
    ///
    /// * `vectors_path` - The file holding the raw vectors.
    ///
    /// * `mapping_path` - The file holding the slot-to-employee mapping.
    pub fn new(vectors_path: impl Into<PathBuf>, mapping_path: impl Into<PathBuf>) -> Self {
        Self {
            vectors_path: vectors_path.into(),
            mapping_path: mapping_path.into(),
        }
    }

    /// The file holding the raw vectors.
    pub fn vectors_path(&self) -> &Path {
        &self.vectors_path
    }

    /// The file holding the slot-to-employee mapping.
    pub fn mapping_path(&self) -> &Path {
        &self.mapping_path
    }

    /// Load the index from disk, or start empty.
    ///
    /// Missing, unreadable, or inconsistent files are never fatal; the index starts empty and should be rebuilt.
    ///
    /// # Arguments
    ///
    /// * `dimension` - The configured dimensionality; an index of another dimensionality is discarded.
    pub fn load(&self, dimension: usize) -> SimilarityIndex {
        match self.try_load(dimension) {
            Ok(Some(index)) => {
                info!(
                    vectors = index.len(),
                    employees = index.employee_count(),
                    path = %self.vectors_path.display(),
                    "loaded face index"
                );
                index
            }
            Ok(None) => {
                info!(path = %self.vectors_path.display(), "no face index on disk, starting empty");
                SimilarityIndex::new(dimension)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %self.vectors_path.display(),
                    "discarding face index, starting empty"
                );
                SimilarityIndex::new(dimension)
            }
        }
    }

    /// Load the index from disk.
    ///
    /// # Returns
    ///
    /// The stored index, `None` if neither file exists, or an error if the files cannot be read or disagree.
    pub fn try_load(&self, dimension: usize) -> Result<Option<SimilarityIndex>, Error> {
        let (vectors, mapping) = match (
            read_if_exists(&self.vectors_path)?,
            read_if_exists(&self.mapping_path)?,
        ) {
            (None, None) => return Ok(None),
            (Some(vectors), Some(mapping)) => (vectors, mapping),
            (Some(_), None) => {
                return Err(Error::IndexCorrupt("vector file has no mapping file".into()))
            }
            (None, Some(_)) => {
                return Err(Error::IndexCorrupt("mapping file has no vector file".into()))
            }
        };

        let (metadata, _): (IndexMetadata, usize) =
            bincode::serde::decode_from_slice(&mapping, bincode::config::legacy())?;
        if metadata.format != FORMAT_VERSION {
            return Err(Error::IndexCorrupt(format!(
                "unsupported mapping format {}",
                metadata.format
            )));
        }
        if metadata.dimension != dimension {
            return Err(Error::IndexCorrupt(format!(
                "stored index has {} dimensions, expected {}",
                metadata.dimension, dimension
            )));
        }

        let header = VectorsHeader::parse(&vectors)?;
        if header.generation.as_bytes() != &metadata.generation {
            return Err(Error::IndexCorrupt(
                "vector and mapping files come from different writes".into(),
            ));
        }
        if header.dimension != metadata.dimension || header.count != metadata.owners.len() {
            return Err(Error::IndexCorrupt(format!(
                "vector file holds {} vectors of {} dimensions, mapping holds {} slots",
                header.count,
                header.dimension,
                metadata.owners.len()
            )));
        }
        let body = &vectors[HEADER_LEN..];
        let expected_len = header
            .count
            .checked_mul(header.dimension)
            .and_then(|n| n.checked_mul(COMPONENT_LEN));
        if expected_len != Some(body.len()) {
            return Err(Error::IndexCorrupt(format!(
                "vector file body is {} bytes, expected {:?}",
                body.len(),
                expected_len
            )));
        }
        let components = body
            .chunks_exact(COMPONENT_LEN)
            .map(|bytes| {
                EmbeddingPrecision::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            })
            .collect();

        debug!(generation = %header.generation, "decoded face index");
        SimilarityIndex::from_parts(dimension, components, metadata.owners).map(Some)
    }

    /// Serialise an index into the bytes of both files.
    pub fn encode(&self, index: &SimilarityIndex) -> Result<EncodedIndex, Error> {
        let generation = Uuid::now_v7();
        let raw = index.raw_vectors();

        let mut vectors = Vec::with_capacity(HEADER_LEN + raw.len() * COMPONENT_LEN);
        vectors.extend_from_slice(VECTORS_MAGIC);
        vectors.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        vectors.extend_from_slice(generation.as_bytes());
        vectors.extend_from_slice(&(index.dimension() as u64).to_le_bytes());
        vectors.extend_from_slice(&(index.len() as u64).to_le_bytes());
        for component in raw {
            vectors.extend_from_slice(&component.to_le_bytes());
        }

        let metadata = IndexMetadata {
            format: FORMAT_VERSION,
            generation: generation.into_bytes(),
            dimension: index.dimension(),
            owners: index.owners().to_vec(),
        };
        let mapping = bincode::serde::encode_to_vec(&metadata, bincode::config::legacy())?;

        Ok(EncodedIndex {
            generation,
            vectors,
            mapping,
        })
    }

    /// Write both files.
    ///
    /// Each file is written in full to a temporary sibling and synced before either is renamed into place.
    pub fn write(&self, encoded: &EncodedIndex) -> io::Result<()> {
        let vectors_tmp = temporary_path(&self.vectors_path);
        let mapping_tmp = temporary_path(&self.mapping_path);
        let written = write_synced(&vectors_tmp, &encoded.vectors)
            .and_then(|_| write_synced(&mapping_tmp, &encoded.mapping));
        if let Err(e) = written {
            let _ = fs::remove_file(&vectors_tmp);
            let _ = fs::remove_file(&mapping_tmp);
            return Err(e);
        }
        fs::rename(&vectors_tmp, &self.vectors_path)?;
        fs::rename(&mapping_tmp, &self.mapping_path)?;
        sync_parent(&self.vectors_path);
        sync_parent(&self.mapping_path);
        debug!(generation = %encoded.generation, "persisted face index");
        Ok(())
    }

    /// Serialise and write an index in one step.
    pub fn persist(&self, index: &SimilarityIndex) -> Result<(), Error> {
        let encoded = self.encode(index)?;
        self.write(&encoded)
            .map_err(|source| Error::Persist { attempts: 1, source })
    }
}

struct VectorsHeader {
    generation: Uuid,
    dimension: usize,
    count: usize,
}

impl VectorsHeader {
    fn parse(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::IndexCorrupt("vector file is truncated".into()));
        }
        if &bytes[0..4] != VECTORS_MAGIC {
            return Err(Error::IndexCorrupt("vector file has no magic number".into()));
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != FORMAT_VERSION {
            return Err(Error::IndexCorrupt(format!(
                "unsupported vector format {}",
                version
            )));
        }
        let generation = Uuid::from_slice(&bytes[8..24])
            .map_err(|e| Error::IndexCorrupt(e.to_string()))?;
        let dimension = read_u64(&bytes[24..32]);
        let count = read_u64(&bytes[32..40]);
        Ok(Self {
            generation,
            dimension: usize::try_from(dimension)
                .map_err(|e| Error::IndexCorrupt(e.to_string()))?,
            count: usize::try_from(count).map_err(|e| Error::IndexCorrupt(e.to_string()))?,
        })
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>, Error> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::StoreUnreadable(e)),
    }
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn sync_parent(path: &Path) {
    let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent,
        None => Path::new("."),
    };
    // Directories cannot be opened for syncing on every platform.
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
}
