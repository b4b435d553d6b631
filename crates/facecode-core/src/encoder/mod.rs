//! Feature encoding.
//!
//! An encoder turns the selected face region into a raw vector. [`finalize`]
//! then enforces the configured dimension and L2-normalizes, so every encoder
//! goes through the same post-processing.

pub mod hog;
pub mod onnx;

use crate::config::{EncoderKind, PipelineConfig, EMBEDDING_MODEL_FILE};
use crate::normalize::CanonicalImage;
use crate::types::{FaceRegion, FeatureVector};
use thiserror::Error;

pub use hog::HogEncoder;
pub use onnx::EmbeddingEncoder;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0} (place it in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region {0:?} does not fit the image")]
    InvalidRegion(FaceRegion),
    #[error("encoder produced no feature vector")]
    NoEmbedding,
    #[error("expected a {expected}-dimensional feature vector, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces a raw feature vector for one face region.
pub trait FeatureEncoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Encode `region` of `image`. The output is not yet normalized.
    fn encode(&self, image: &CanonicalImage, region: &FaceRegion) -> Result<Vec<f32>, EncoderError>;
}

/// Check the raw vector against `expected_dim` and L2-normalize it.
///
/// A mismatched length is an error; vectors are never padded or truncated here.
pub fn finalize(raw: Vec<f32>, expected_dim: usize) -> Result<FeatureVector, EncoderError> {
    if raw.is_empty() {
        return Err(EncoderError::NoEmbedding);
    }
    if raw.len() != expected_dim {
        return Err(EncoderError::DimensionMismatch {
            expected: expected_dim,
            actual: raw.len(),
        });
    }
    Ok(FeatureVector::normalized(raw))
}

/// Build the configured encoder.
pub fn load(config: &PipelineConfig) -> Result<Box<dyn FeatureEncoder>, EncoderError> {
    let encoder: Box<dyn FeatureEncoder> = match config.encoder.kind {
        EncoderKind::Onnx => Box::new(EmbeddingEncoder::load(
            &config.model_path(EMBEDDING_MODEL_FILE),
            &config.encoder.onnx,
        )?),
        EncoderKind::Hog => Box::new(HogEncoder::new(config.encoder.dimension)),
    };
    tracing::info!(encoder = encoder.name(), dimension = config.encoder.dimension, "encoder ready");
    Ok(encoder)
}
