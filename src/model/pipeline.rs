use super::core::{FaceEmbedder, FaceVector};
use crate::{Config, EmbeddingPrecision, Error, NoFace};
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, ImageReader};
use std::io::Cursor;
use tracing::{debug, error};

/// A rectangular region of an image believed to contain a face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceRegion {
    /// The left edge of the region, in pixels.
    pub x: u32,
    /// The top edge of the region, in pixels.
    pub y: u32,
    /// The width of the region, in pixels.
    pub width: u32,
    /// The height of the region, in pixels.
    pub height: u32,
    /// The detector's confidence that the region contains a face.
    pub confidence: f32,
}

impl FaceRegion {
    /// Restrict the region to the bounds of an image.
    ///
    /// # Arguments
    ///
    /// * `image_width` - The width of the image.
    ///
    /// * `image_height` - The height of the image.
    ///
    /// # Returns
    ///
    /// The part of the region inside the image, or `None` if there is no such part.
    pub fn clamped(&self, image_width: u32, image_height: u32) -> Option<Self> {
        if self.x >= image_width || self.y >= image_height {
            return None;
        }
        let width = self.width.min(image_width - self.x);
        let height = self.height.min(image_height - self.y);
        (width > 0 && height > 0).then_some(Self {
            width,
            height,
            ..*self
        })
    }
}

/// Locates faces in an image.
pub trait FaceDetector: Send + Sync {
    /// Detect faces.
    ///
    /// # Arguments
    ///
    /// * `image` - A decoded image.
    ///
    /// # Returns
    ///
    /// Every candidate region, in the detector's output order.
    fn detect(&self, image: &DynamicImage) -> anyhow::Result<Vec<FaceRegion>>;
}

/// A detector for photos that are already cropped to a single face; the whole frame is the face.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullFrameDetector;

impl FaceDetector for FullFrameDetector {
    fn detect(&self, image: &DynamicImage) -> anyhow::Result<Vec<FaceRegion>> {
        Ok(vec![FaceRegion {
            x: 0,
            y: 0,
            width: image.width(),
            height: image.height(),
            confidence: 1.0,
        }])
    }
}

/// Stands in for a face detector when none is available; it finds no faces, so every image is refused.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoDetector;

impl FaceDetector for NoDetector {
    fn detect(&self, _image: &DynamicImage) -> anyhow::Result<Vec<FaceRegion>> {
        Ok(Vec::new())
    }
}

/// Computes a raw feature vector from a normalised face crop.
pub trait FeatureExtractor: Send + Sync {
    /// The number of features produced.
    fn dimension(&self) -> usize;

    /// The width and height of the face crops this extractor accepts.
    fn input_size(&self) -> u32;

    /// Extract features.
    ///
    /// # Arguments
    ///
    /// * `face` - A tensor with the shape [3 `input_size` `input_size`], values centred on zero.
    ///
    /// # Returns
    ///
    /// An unnormalised feature vector.
    fn extract(&self, face: &Tensor) -> anyhow::Result<Vec<EmbeddingPrecision>>;
}

/// Decode an image from raw bytes, guessing its format.
pub fn decode_image(bytes: &[u8]) -> anyhow::Result<DynamicImage> {
    Ok(ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .decode()?)
}

/// Crops a face region and brings it to the canonical size & colour scale.
///
/// Returns a tensor with the shape [3 `size` `size`].
///
/// Pixel values are mapped from [0, 255] to (x - 127.5) / 128.
pub fn load_face(image: &DynamicImage, region: &FaceRegion, size: u32) -> anyhow::Result<Tensor> {
    let face = image
        .crop_imm(region.x, region.y, region.width, region.height)
        .resize_exact(size, size, image::imageops::FilterType::Triangle)
        .to_rgb8();
    let res = size as usize;
    let data = Tensor::from_vec(face.into_raw(), (res, res, 3), &Device::Cpu)?.permute((2, 0, 1))?;
    Ok(data
        .to_dtype(DType::F32)?
        .affine(1.0 / 128.0, -127.5 / 128.0)?)
}

/// Choose the face to embed.
///
/// Regions outside the image, smaller than `min_face_size` on either side, or without a finite confidence are ignored.
/// Of the rest, the most confident wins; ties go to the earliest in detector order.
///
/// # Returns
///
/// The chosen region, or `None` if it does not reach `min_confidence`.
pub fn select_region(
    regions: &[FaceRegion],
    image_width: u32,
    image_height: u32,
    min_confidence: f32,
    min_face_size: u32,
) -> Option<FaceRegion> {
    let mut best: Option<FaceRegion> = None;
    for region in regions
        .iter()
        .filter_map(|r| r.clamped(image_width, image_height))
        .filter(|r| r.width >= min_face_size && r.height >= min_face_size)
        .filter(|r| r.confidence.is_finite())
    {
        match best {
            Some(current) if region.confidence <= current.confidence => {}
            _ => best = Some(region),
        }
    }
    best.filter(|r| r.confidence >= min_confidence)
}

/// A two-stage embedder: a face detector followed by a feature extractor.
pub struct FacePipeline<D: FaceDetector, X: FeatureExtractor> {
    detector: D,
    extractor: X,
    min_confidence: f32,
    min_face_size: u32,
}

impl<D: FaceDetector, X: FeatureExtractor> FacePipeline<D, X> {
    /// Assemble a pipeline.
    ///
    /// # Arguments
    ///
    /// * `detector` - Locates faces.
    ///
    /// * `extractor` - Computes features from face crops; must produce `config.dimension` features.
    ///
    /// * `config` - Detection thresholds and the expected dimensionality.
    pub fn new(detector: D, extractor: X, config: &Config) -> Result<Self, Error> {
        if extractor.dimension() != config.dimension {
            return Err(Error::DimensionMismatch {
                expected: config.dimension,
                actual: extractor.dimension(),
            });
        }
        Ok(Self {
            detector,
            extractor,
            min_confidence: config.min_detection_confidence,
            min_face_size: config.min_face_size,
        })
    }
}

fn failure(stage: &str, error: impl std::fmt::Display) -> NoFace {
    NoFace::EmbeddingFailure(format!("{}: {}", stage, error))
}

impl<D: FaceDetector, X: FeatureExtractor> FaceEmbedder for FacePipeline<D, X> {
    fn dimension(&self) -> usize {
        self.extractor.dimension()
    }

    fn embed(&self, image: &[u8]) -> Result<FaceVector, NoFace> {
        let image = decode_image(image).map_err(|e| failure("decode", e))?;
        let regions = self
            .detector
            .detect(&image)
            .map_err(|e| failure("detect", e))?;
        let region = select_region(
            &regions,
            image.width(),
            image.height(),
            self.min_confidence,
            self.min_face_size,
        )
        .ok_or(NoFace::NotDetected)?;
        debug!(?region, candidates = regions.len(), "selected face region");

        let face = load_face(&image, &region, self.extractor.input_size())
            .map_err(|e| failure("align", e))?;
        let raw = self
            .extractor
            .extract(&face)
            .map_err(|e| failure("extract", e))?;
        if raw.len() != self.dimension() {
            error!(
                expected = self.dimension(),
                actual = raw.len(),
                "feature extractor returned a vector of the wrong dimensionality"
            );
            return Err(failure(
                "extract",
                Error::DimensionMismatch {
                    expected: self.dimension(),
                    actual: raw.len(),
                },
            ));
        }
        FaceVector::normalize(raw).ok_or_else(|| failure("extract", "degenerate feature vector"))
    }
}
