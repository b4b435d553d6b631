//! Face localization cascade.
//!
//! Strategies are tried in priority order; the first one that returns at
//! least one region wins. A strategy that errors, panics or finds nothing is
//! logged and skipped. Only exhausting every strategy is a failure.

pub mod haar;
pub mod scrfd;
pub mod seeta;

use crate::config::{
    DetectorConfig, PipelineConfig, StrategyKind, HAAR_CASCADE_FILE, SCRFD_MODEL_FILE,
    SEETA_MODEL_FILE,
};
use crate::normalize::CanonicalImage;
use crate::types::FaceRegion;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub use haar::HaarDetector;
pub use scrfd::ScrfdDetector;
pub use seeta::SeetaDetector;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (place it in the model directory)")]
    ModelNotFound(String),
    #[error("invalid model {path}: {reason}")]
    InvalidModel { path: String, reason: String },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// One way of localizing faces in a canonical image.
///
/// Implementations hold only read-only state (or lock internally) so a
/// single instance can serve concurrent extractions.
pub trait DetectionStrategy: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Detect faces. An empty vector means "nothing found, try the next strategy".
    fn detect(&self, image: &CanonicalImage) -> Result<Vec<FaceRegion>, DetectorError>;
}

/// Regions found by the first successful strategy.
#[derive(Debug, Clone)]
pub struct Detection {
    pub strategy: &'static str,
    pub regions: Vec<FaceRegion>,
}

/// Ordered list of fallback strategies.
pub struct DetectorCascade {
    strategies: Vec<Box<dyn DetectionStrategy>>,
    diagnostics_dir: Option<PathBuf>,
}

impl DetectorCascade {
    pub fn new(strategies: Vec<Box<dyn DetectionStrategy>>) -> Self {
        Self {
            strategies,
            diagnostics_dir: None,
        }
    }

    /// Save images that no strategy could localize a face in under `dir`.
    pub fn with_diagnostics_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.diagnostics_dir = Some(dir.into());
        self
    }

    /// Load every configured strategy from the model directory.
    pub fn load(config: &PipelineConfig) -> Result<Self, DetectorError> {
        let detector: &DetectorConfig = &config.detector;
        let mut strategies: Vec<Box<dyn DetectionStrategy>> = Vec::new();

        for kind in &detector.strategies {
            let strategy: Box<dyn DetectionStrategy> = match kind {
                StrategyKind::Scrfd => Box::new(ScrfdDetector::load(
                    &config.model_path(SCRFD_MODEL_FILE),
                    &detector.scrfd,
                )?),
                StrategyKind::Seeta => Box::new(SeetaDetector::load(
                    &config.model_path(SEETA_MODEL_FILE),
                    &detector.seeta,
                )?),
                StrategyKind::Haar => Box::new(HaarDetector::load(
                    &config.model_path(HAAR_CASCADE_FILE),
                    &detector.haar,
                )?),
            };
            strategies.push(strategy);
        }

        let mut cascade = Self::new(strategies);
        cascade.diagnostics_dir = detector.diagnostics_dir.clone();
        tracing::info!(strategies = ?cascade.strategy_names(), "detector cascade ready");
        Ok(cascade)
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Run strategies in order until one finds a face.
    ///
    /// Returns `None` once every strategy has been exhausted.
    pub fn detect(&self, image: &CanonicalImage) -> Option<Detection> {
        for strategy in &self.strategies {
            let name = strategy.name();
            match catch_unwind(AssertUnwindSafe(|| strategy.detect(image))) {
                Ok(Ok(regions)) if !regions.is_empty() => {
                    tracing::debug!(strategy = name, count = regions.len(), "faces detected");
                    return Some(Detection {
                        strategy: name,
                        regions,
                    });
                }
                Ok(Ok(_)) => {
                    tracing::debug!(strategy = name, "no face found, trying next strategy");
                }
                Ok(Err(e)) => {
                    tracing::warn!(strategy = name, error = %e, "detection strategy failed");
                }
                Err(_) => {
                    tracing::warn!(strategy = name, "detection strategy panicked");
                }
            }
        }

        if let Some(dir) = &self.diagnostics_dir {
            persist_failed_image(dir, image);
        }
        None
    }
}

/// Best-effort save of an undetectable image as `failed_<unix_millis>.jpg`.
fn persist_failed_image(dir: &Path, image: &CanonicalImage) {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let path = dir.join(format!("failed_{millis}.jpg"));

    let saved = std::fs::create_dir_all(dir)
        .ok()
        .and_then(|_| image.as_rgb().save_with_format(&path, image::ImageFormat::Jpeg).ok());
    if saved.is_some() {
        tracing::debug!(path = %path.display(), "saved undetectable image");
    }
}
