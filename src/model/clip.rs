use super::pipeline::FeatureExtractor;
use crate::EmbeddingPrecision;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use hf_hub::{Repo, RepoType};
use tracing::info;

/// The Hugging Face repository holding the CLIP weights.
pub const CLIP_MODEL_ID: &str = "openai/clip-vit-base-patch32";

/// The revision of [`CLIP_MODEL_ID`] providing `model.safetensors`.
pub const CLIP_REVISION: &str = "refs/pr/15";

/// The width and height of images accepted by the CLIP ViT-B/32 image tower.
pub const CLIP_IMAGE_SIZE: u32 = 224;

/// The dimensionality of the CLIP ViT-B/32 image projection.
pub const CLIP_DIMENSION: usize = 512;

/// A feature extractor backed by the image tower of CLIP ViT-B/32.
///
/// The weights are fetched once and kept on the chosen device for the lifetime of the extractor.
pub struct ClipExtractor {
    model: ClipModel,
    device: Device,
}

impl ClipExtractor {
    /// Load the model.
    ///
    /// # Arguments
    ///
    /// * `cpu` - Whether to skip accelerator detection and run on the CPU.
    ///
    /// # Returns
    ///
    /// An extractor running on a CUDA or Metal device when one is available, otherwise on the CPU.
    pub fn new(cpu: bool) -> anyhow::Result<Self> {
        let device = candle_examples::device(cpu)?;
        let api = hf_hub::api::sync::Api::new()?;
        let api = api.repo(Repo::with_revision(
            CLIP_MODEL_ID.into(),
            RepoType::Model,
            CLIP_REVISION.into(),
        ));
        let model_file = api.get("model.safetensors")?;
        let varbuilder =
            unsafe { VarBuilder::from_mmaped_safetensors(&[model_file], DType::F32, &device)? };
        let model = ClipModel::new(varbuilder, &ClipConfig::vit_base_patch32())?;
        info!(model = CLIP_MODEL_ID, ?device, "loaded feature extractor");
        Ok(Self { model, device })
    }
}

impl FeatureExtractor for ClipExtractor {
    fn dimension(&self) -> usize {
        CLIP_DIMENSION
    }

    fn input_size(&self) -> u32 {
        CLIP_IMAGE_SIZE
    }

    fn extract(&self, face: &Tensor) -> anyhow::Result<Vec<EmbeddingPrecision>> {
        let face = face.to_device(&self.device)?.unsqueeze(0)?;
        let features = self.model.get_image_features(&face)?;
        Ok(features
            .flatten_all()?
            .to_dtype(DType::F32)?
            .to_vec1::<EmbeddingPrecision>()?)
    }
}
