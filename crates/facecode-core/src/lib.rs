//! facecode-core: face localization and feature encoding.
//!
//! Decodes an image, finds faces with a fallback cascade (SCRFD, SeetaFace,
//! Haar), encodes the largest one into a unit-norm feature vector and scores
//! its quality. Models are loaded once into an [`Extractor`] that is shared
//! across threads.

pub mod align;
pub mod config;
pub mod detector;
pub mod encoder;
pub mod normalize;
pub mod pipeline;
pub mod quality;
pub mod select;
pub mod types;

pub use config::{ConfigError, PipelineConfig, FEATURE_DIM};
pub use normalize::{CanonicalImage, Normalizer, RawImage};
pub use pipeline::{ExtractError, Extraction, Extractor, LoadError};
pub use types::{
    compare, compare_codes, Comparison, ExtractionResult, FaceRegion, FeatureCodeError,
    FeatureVector, Landmarks, MATCH_THRESHOLD,
};
