//! Extraction orchestrator.
//!
//! `decode -> detect -> select -> (encode || score)`, with an early exit on the
//! first failing stage. Every public entry point returns an
//! [`ExtractionResult`]; errors and panics never escape.

use crate::config::{ConfigError, PipelineConfig};
use crate::detector::{DetectorCascade, DetectorError};
use crate::encoder::{self, EncoderError, FeatureEncoder};
use crate::normalize::{NormalizeError, Normalizer, RawImage};
use crate::quality::QualityScorer;
use crate::select::largest_face;
use crate::types::{ExtractionResult, FaceRegion, FeatureVector};
use rayon::prelude::*;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("image decode failed: {0}")]
    Decode(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("feature dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("feature encoding failed: {0}")]
    Encoding(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<NormalizeError> for ExtractError {
    fn from(e: NormalizeError) -> Self {
        ExtractError::Decode(e.to_string())
    }
}

impl From<EncoderError> for ExtractError {
    fn from(e: EncoderError) -> Self {
        match e {
            EncoderError::DimensionMismatch { expected, actual } => {
                ExtractError::DimensionMismatch { expected, actual }
            }
            EncoderError::InvalidRegion(_) | EncoderError::ModelNotFound(_) => {
                ExtractError::Internal(e.to_string())
            }
            other => ExtractError::Encoding(other.to_string()),
        }
    }
}

impl ExtractError {
    /// Caller-facing message. Internal and encoder detail stays in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ExtractError::Internal(_) => "internal error".to_string(),
            ExtractError::Encoding(_) => "feature encoding failed".to_string(),
            other => other.to_string(),
        }
    }
}

/// Startup failure while loading models or configuration.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("encoder: {0}")]
    Encoder(#[from] EncoderError),
}

/// Successful pipeline run, before conversion to an [`ExtractionResult`].
#[derive(Debug, Clone)]
pub struct Extraction {
    pub region: FaceRegion,
    /// Detection strategy that found the face.
    pub strategy: &'static str,
    pub features: FeatureVector,
    pub quality: f64,
}

/// Loaded pipeline. Shared read-only across threads.
pub struct Extractor {
    normalizer: Normalizer,
    cascade: DetectorCascade,
    encoder: Box<dyn FeatureEncoder>,
    scorer: QualityScorer,
    dimension: usize,
}

impl Extractor {
    pub fn new(
        normalizer: Normalizer,
        cascade: DetectorCascade,
        encoder: Box<dyn FeatureEncoder>,
        scorer: QualityScorer,
        dimension: usize,
    ) -> Self {
        Self {
            normalizer,
            cascade,
            encoder,
            scorer,
            dimension,
        }
    }

    /// Load every configured model, failing on the first missing file.
    pub fn load(config: &PipelineConfig) -> Result<Self, LoadError> {
        config.validate()?;
        let cascade = DetectorCascade::load(config)?;
        let encoder = encoder::load(config)?;

        Ok(Self::new(
            Normalizer::new(config.normalizer.min_dimension).with_max_dimensions(
                config.normalizer.max_image_width,
                config.normalizer.max_image_height,
            ),
            cascade,
            encoder,
            QualityScorer::from(&config.quality),
            config.encoder.dimension,
        ))
    }

    pub fn encoder_name(&self) -> &'static str {
        self.encoder.name()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.cascade.strategy_names()
    }

    /// Run the pipeline stages, surfacing the first failure.
    pub fn run(&self, raw: &RawImage) -> Result<Extraction, ExtractError> {
        let image = self.normalizer.normalize(raw)?;

        let detection = self.cascade.detect(&image).ok_or(ExtractError::NoFaceDetected)?;
        let region = largest_face(&detection.regions).ok_or(ExtractError::NoFaceDetected)?;
        let area_ratio = region.area_ratio(image.width(), image.height());

        let (encoded, quality) = rayon::join(
            || self.encoder.encode(&image, &region),
            || self.scorer.score(&image, &region, area_ratio),
        );
        let features = encoder::finalize(encoded?, self.dimension)?;

        Ok(Extraction {
            region,
            strategy: detection.strategy,
            features,
            quality,
        })
    }

    /// Extract from encoded image bytes.
    pub fn extract(&self, bytes: &[u8]) -> ExtractionResult {
        self.extract_raw(&RawImage::new(bytes.to_vec()))
    }

    pub fn extract_raw(&self, raw: &RawImage) -> ExtractionResult {
        self.extract_detailed(raw).0
    }

    /// Like [`extract_raw`](Self::extract_raw), also returning the selected region.
    pub fn extract_detailed(&self, raw: &RawImage) -> (ExtractionResult, Option<FaceRegion>) {
        self.extract_since(raw, Instant::now())
    }

    /// Run the pipeline behind the panic boundary, timing from `started`.
    fn extract_since(&self, raw: &RawImage, started: Instant) -> (ExtractionResult, Option<FaceRegion>) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.run(raw)))
            .unwrap_or_else(|panic| Err(ExtractError::Internal(panic_message(panic.as_ref()))));
        let elapsed = started.elapsed();

        match outcome {
            Ok(extraction) => {
                tracing::debug!(
                    strategy = extraction.strategy,
                    region = ?extraction.region,
                    quality = extraction.quality,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "feature extraction succeeded"
                );
                (
                    ExtractionResult::succeeded(&extraction.features, extraction.quality, elapsed),
                    Some(extraction.region),
                )
            }
            Err(e) => (ExtractionResult::failed(report_failure(&e), elapsed), None),
        }
    }

    /// Extract from a base64 payload (an optional `data:` URL prefix is accepted).
    pub fn extract_base64(&self, data: &str) -> ExtractionResult {
        let started = Instant::now();
        match RawImage::from_base64(data) {
            Ok(raw) => self.extract_since(&raw, started).0,
            Err(e) => failed_since(ExtractError::from(e), started),
        }
    }

    pub fn extract_file(&self, path: &Path) -> ExtractionResult {
        let started = Instant::now();
        match std::fs::read(path) {
            Ok(bytes) => self.extract_since(&RawImage::new(bytes), started).0,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "failed to read input file");
                ExtractionResult::failed(
                    format!("failed to read input file {}: {e}", path.display()),
                    started.elapsed(),
                )
            }
        }
    }

    /// Extract every item independently and in parallel; results keep input order.
    pub fn extract_batch<I: AsRef<[u8]> + Sync>(&self, images: &[I]) -> Vec<ExtractionResult> {
        images.par_iter().map(|bytes| self.extract(bytes.as_ref())).collect()
    }

    /// Batch variant of [`extract_base64`](Self::extract_base64).
    pub fn extract_batch_base64<S: AsRef<str> + Sync>(&self, images: &[S]) -> Vec<ExtractionResult> {
        images.par_iter().map(|data| self.extract_base64(data.as_ref())).collect()
    }
}

fn failed_since(error: ExtractError, started: Instant) -> ExtractionResult {
    ExtractionResult::failed(report_failure(&error), started.elapsed())
}

/// Log the full failure and return the message placed in the result.
fn report_failure(error: &ExtractError) -> String {
    match error {
        ExtractError::Internal(_) | ExtractError::Encoding(_) => {
            tracing::warn!(error = %error, "feature extraction failed")
        }
        _ => tracing::debug!(error = %error, "feature extraction failed"),
    }
    error.public_message()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "pipeline stage panicked".to_string()
    }
}
