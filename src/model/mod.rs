/// A CLIP image tower used as a feature extractor.
pub mod clip;
/// Core embedding implementation.
pub mod core;
/// Face detection, alignment, and feature extraction.
pub mod pipeline;
