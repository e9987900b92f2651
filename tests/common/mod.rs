#![allow(dead_code)]

use bytes::Bytes;
use candle_core::Tensor;
use facegate::model::pipeline::{
    FaceDetector, FacePipeline, FaceRegion, FeatureExtractor, FullFrameDetector,
};
use facegate::source::{Employee, EmployeePhotoSource, PhotoRef};
use facegate::{Config, EmployeeId, FaceEmbedder, FaceVector, NoFace};
use image::{DynamicImage, ImageFormat, RgbImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

pub const DIM: usize = 16;

pub const FACE_SIZE: u32 = 32;

/// A configuration for a small index kept in `dir`.
pub fn config(dir: &Path) -> Config {
    Config {
        dimension: DIM,
        index_path: dir.join("face_index.vectors"),
        mapping_path: dir.join("face_index.meta"),
        embed_timeout_ms: 10_000,
        persist_backoff_ms: 1,
        photos_dir: dir.join("uploads"),
        ..Config::default()
    }
}

/// A patterned image; each seed gives a different picture.
pub fn rgb_image(width: u32, height: u32, seed: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([
            ((x * seed * 13 + y * 7 + seed * 31) % 256) as u8,
            ((x * 3 + y * seed * 5 + seed * 17) % 256) as u8,
            ((x * y + seed * 59) % 256) as u8,
        ])
    }))
}

/// Encode an image as PNG.
pub fn png_of(image: &DynamicImage) -> Bytes {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .expect("encode png");
    Bytes::from(buffer.into_inner())
}

/// A PNG photo large enough to contain a face.
pub fn face_photo(seed: u32) -> Bytes {
    png_of(&rgb_image(64, 64, seed))
}

/// A PNG photo smaller than the minimum face size.
pub fn faceless_photo() -> Bytes {
    png_of(&rgb_image(8, 8, 1))
}

/// Averages the face crop over `DIM` contiguous runs of values.
pub struct PatchExtractor;

impl FeatureExtractor for PatchExtractor {
    fn dimension(&self) -> usize {
        DIM
    }

    fn input_size(&self) -> u32 {
        FACE_SIZE
    }

    fn extract(&self, face: &Tensor) -> anyhow::Result<Vec<f32>> {
        let values = face.flatten_all()?.to_vec1::<f32>()?;
        let run = values.len() / DIM;
        Ok(values
            .chunks(run)
            .take(DIM)
            .enumerate()
            .map(|(i, chunk)| chunk.iter().sum::<f32>() / chunk.len() as f32 + 0.01 * i as f32)
            .collect())
    }
}

/// An extractor producing the wrong number of features.
pub struct ShortExtractor;

impl FeatureExtractor for ShortExtractor {
    fn dimension(&self) -> usize {
        DIM
    }

    fn input_size(&self) -> u32 {
        FACE_SIZE
    }

    fn extract(&self, _face: &Tensor) -> anyhow::Result<Vec<f32>> {
        Ok(vec![1.0; DIM - 1])
    }
}

/// A detector returning fixed regions.
pub struct ScriptedDetector(pub Vec<FaceRegion>);

impl FaceDetector for ScriptedDetector {
    fn detect(&self, _image: &DynamicImage) -> anyhow::Result<Vec<FaceRegion>> {
        Ok(self.0.clone())
    }
}

/// A detector that always fails.
pub struct BrokenDetector;

impl FaceDetector for BrokenDetector {
    fn detect(&self, _image: &DynamicImage) -> anyhow::Result<Vec<FaceRegion>> {
        anyhow::bail!("detector unavailable")
    }
}

pub fn region(x: u32, y: u32, size: u32, confidence: f32) -> FaceRegion {
    FaceRegion {
        x,
        y,
        width: size,
        height: size,
        confidence,
    }
}

/// The embedder used by most tests: whole-frame detection and patch averaging.
pub fn pipeline(config: &Config) -> FacePipeline<FullFrameDetector, PatchExtractor> {
    FacePipeline::new(FullFrameDetector, PatchExtractor, config).expect("pipeline")
}

pub fn embedder(config: &Config) -> Arc<dyn FaceEmbedder> {
    Arc::new(pipeline(config))
}

/// Wraps an embedder, sleeping before each call and counting calls.
pub struct SlowEmbedder<E: FaceEmbedder> {
    pub inner: E,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl<E: FaceEmbedder> FaceEmbedder for SlowEmbedder<E> {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn embed(&self, image: &[u8]) -> Result<FaceVector, NoFace> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.inner.embed(image)
    }
}

/// An embedder that panics.
pub struct PanickingEmbedder;

impl FaceEmbedder for PanickingEmbedder {
    fn dimension(&self) -> usize {
        DIM
    }

    fn embed(&self, _image: &[u8]) -> Result<FaceVector, NoFace> {
        panic!("model crashed")
    }
}

/// Wraps an embedder, panicking on one particular image.
pub struct CrashingOn<E: FaceEmbedder> {
    pub inner: E,
    pub trigger: Bytes,
}

impl<E: FaceEmbedder> FaceEmbedder for CrashingOn<E> {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn embed(&self, image: &[u8]) -> Result<FaceVector, NoFace> {
        if image == self.trigger.as_ref() {
            panic!("model crashed on {} bytes", image.len());
        }
        self.inner.embed(image)
    }
}

/// Wraps an embedder, holding back one particular image until released.
pub struct GatedEmbedder<E: FaceEmbedder> {
    inner: E,
    gated: Bytes,
    open: Mutex<bool>,
    opened: Condvar,
    waiting: AtomicUsize,
}

impl<E: FaceEmbedder> GatedEmbedder<E> {
    pub fn new(inner: E, gated: Bytes) -> Self {
        Self {
            inner,
            gated,
            open: Mutex::new(false),
            opened: Condvar::new(),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Block until an embedding is held at the gate.
    pub fn wait_for_held(&self) {
        while self.waiting.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }
}

impl<E: FaceEmbedder> FaceEmbedder for GatedEmbedder<E> {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn embed(&self, image: &[u8]) -> Result<FaceVector, NoFace> {
        if image == self.gated.as_ref() {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.opened.wait(open).unwrap();
            }
        }
        self.inner.embed(image)
    }
}

/// An in-memory employee & photo store.
#[derive(Default)]
pub struct MemorySource {
    pub employees: Vec<(EmployeeId, bool)>,
    pub photos: HashMap<PathBuf, Bytes>,
    pub listing: HashMap<EmployeeId, Vec<PathBuf>>,
    pub unlistable: Vec<EmployeeId>,
    pub fail_employees: bool,
}

impl MemorySource {
    pub fn employee(mut self, id: EmployeeId, active: bool) -> Self {
        self.employees.push((id, active));
        self
    }

    pub fn photo(mut self, id: EmployeeId, name: &str, bytes: Bytes) -> Self {
        let path = PathBuf::from(format!("employee_{}/{}", id, name));
        self.photos.insert(path.clone(), bytes);
        self.listing.entry(id).or_default().push(path);
        self
    }

    /// A photo listed for an employee but absent from storage.
    pub fn missing_photo(mut self, id: EmployeeId, name: &str) -> Self {
        let path = PathBuf::from(format!("employee_{}/{}", id, name));
        self.listing.entry(id).or_default().push(path);
        self
    }
}

impl EmployeePhotoSource for MemorySource {
    fn list_active_employees(&self) -> anyhow::Result<Vec<Employee>> {
        if self.fail_employees {
            anyhow::bail!("employee store offline");
        }
        Ok(self
            .employees
            .iter()
            .filter(|(_, active)| *active)
            .map(|(id, _)| Employee { id: *id })
            .collect())
    }

    fn list_photos(&self, employee_id: EmployeeId) -> anyhow::Result<Vec<PhotoRef>> {
        if self.unlistable.contains(&employee_id) {
            anyhow::bail!("photo table locked");
        }
        Ok(self
            .listing
            .get(&employee_id)
            .map(|paths| {
                paths
                    .iter()
                    .map(|path| PhotoRef {
                        employee_id,
                        path: path.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn read_photo(&self, photo: &PhotoRef) -> anyhow::Result<Bytes> {
        self.photos
            .get(&photo.path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("{} not found", photo.path.display()))
    }
}

/// A random unit vector.
pub fn random_vector(dimension: usize) -> FaceVector {
    use rand::Rng;
    let mut rng = rand::rng();
    loop {
        let raw: Vec<f32> = (0..dimension).map(|_| rng.random_range(-1.0..1.0)).collect();
        if let Some(vector) = FaceVector::normalize(raw) {
            return vector;
        }
    }
}

/// The unit vector along an axis.
pub fn axis(dimension: usize, i: usize) -> FaceVector {
    let mut raw = vec![0.0; dimension];
    raw[i] = 1.0;
    FaceVector::normalize(raw).expect("axis")
}
