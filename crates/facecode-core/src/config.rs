//! Pipeline configuration.
//!
//! Every field has a default, so an empty TOML document (or no file at all)
//! yields a working configuration. Example:
//!
//! ```toml
//! model_dir = "/var/lib/facecode/models"
//!
//! [detector]
//! strategies = ["scrfd", "haar"]
//!
//! [encoder]
//! kind = "hog"
//!
//! [quality]
//! clarity_scale = 500.0
//! ```

use crate::normalize::{DEFAULT_MAX_DIMENSION, DEFAULT_MIN_DIMENSION};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const SEETA_MODEL_FILE: &str = "seeta_fd_frontal_v1.0.bin";
pub const HAAR_CASCADE_FILE: &str = "haarcascade_frontalface_default.xml";
pub const EMBEDDING_MODEL_FILE: &str = "face_recognition_sface_2021dec.onnx";

/// Default dimension of every feature vector the pipeline emits.
pub const FEATURE_DIM: usize = 128;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Default model directory: `$FACECODE_MODEL_DIR`, then
/// `$XDG_DATA_HOME/facecode/models`, then `~/.local/share/facecode/models`.
pub fn default_model_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FACECODE_MODEL_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facecode")
        .join("models")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub model_dir: PathBuf,
    pub normalizer: NormalizerConfig,
    pub detector: DetectorConfig,
    pub encoder: EncoderConfig,
    pub quality: QualityConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            normalizer: NormalizerConfig::default(),
            detector: DetectorConfig::default(),
            encoder: EncoderConfig::default(),
            quality: QualityConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&src)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.normalizer.min_dimension == 0 {
            return Err(ConfigError::Invalid("normalizer.min_dimension must be > 0".into()));
        }
        let normalizer = &self.normalizer;
        if normalizer.max_image_width < normalizer.min_dimension
            || normalizer.max_image_height < normalizer.min_dimension
        {
            return Err(ConfigError::Invalid(
                "normalizer.max_image_width and max_image_height must be >= min_dimension".into(),
            ));
        }
        if self.detector.strategies.is_empty() {
            return Err(ConfigError::Invalid("detector.strategies must not be empty".into()));
        }
        if self.detector.haar.scale_factor <= 1.0 {
            return Err(ConfigError::Invalid("detector.haar.scale_factor must be > 1.0".into()));
        }
        let seeta = &self.detector.seeta;
        if seeta.min_face_size < 20 {
            return Err(ConfigError::Invalid("detector.seeta.min_face_size must be >= 20".into()));
        }
        if !(seeta.pyramid_scale_factor > 0.01 && seeta.pyramid_scale_factor < 0.99) {
            return Err(ConfigError::Invalid(
                "detector.seeta.pyramid_scale_factor must be in (0.01, 0.99)".into(),
            ));
        }
        if seeta.slide_window_step == 0 {
            return Err(ConfigError::Invalid("detector.seeta.slide_window_step must be > 0".into()));
        }
        if self.encoder.dimension == 0 {
            return Err(ConfigError::Invalid("encoder.dimension must be > 0".into()));
        }
        if self.encoder.onnx.input_size == 0 {
            return Err(ConfigError::Invalid("encoder.onnx.input_size must be > 0".into()));
        }
        if self.encoder.onnx.std == 0.0 {
            return Err(ConfigError::Invalid("encoder.onnx.std must be non-zero".into()));
        }
        if self.quality.clarity_scale <= 0.0 || self.quality.size_scale <= 0.0 {
            return Err(ConfigError::Invalid("quality scales must be > 0".into()));
        }
        Ok(())
    }

    pub fn model_path(&self, file: &str) -> PathBuf {
        self.model_dir.join(file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Both image sides are upsampled to at least this many pixels.
    pub min_dimension: u32,
    /// Images declaring a larger width are rejected before decoding.
    pub max_image_width: u32,
    pub max_image_height: u32,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            min_dimension: DEFAULT_MIN_DIMENSION,
            max_image_width: DEFAULT_MAX_DIMENSION,
            max_image_height: DEFAULT_MAX_DIMENSION,
        }
    }
}

/// A face localization strategy, tried in the configured order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Scrfd,
    Seeta,
    Haar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub strategies: Vec<StrategyKind>,
    /// Where undetectable images are saved for offline inspection.
    /// `None` disables persistence.
    pub diagnostics_dir: Option<PathBuf>,
    pub scrfd: ScrfdConfig,
    pub seeta: SeetaConfig,
    pub haar: HaarConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            strategies: vec![StrategyKind::Scrfd, StrategyKind::Seeta, StrategyKind::Haar],
            diagnostics_dir: Some(PathBuf::from("./debug")),
            scrfd: ScrfdConfig::default(),
            seeta: SeetaConfig::default(),
            haar: HaarConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrfdConfig {
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
}

impl Default for ScrfdConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeetaConfig {
    pub min_face_size: u32,
    pub score_threshold: f64,
    pub pyramid_scale_factor: f32,
    pub slide_window_step: u32,
}

impl Default for SeetaConfig {
    fn default() -> Self {
        Self {
            min_face_size: 20,
            score_threshold: 2.0,
            pyramid_scale_factor: 0.8,
            slide_window_step: 4,
        }
    }
}

/// Relaxed Viola-Jones parameters, tuned for small or hard faces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HaarConfig {
    pub scale_factor: f64,
    pub min_neighbors: usize,
    pub min_size: u32,
}

impl Default for HaarConfig {
    fn default() -> Self {
        Self {
            scale_factor: 1.05,
            min_neighbors: 3,
            min_size: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    /// Pre-trained embedding network.
    Onnx,
    /// HOG descriptor substitute; needs no model file.
    Hog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub kind: EncoderKind,
    /// Length every emitted feature vector must have.
    pub dimension: usize,
    pub onnx: OnnxEncoderConfig,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            kind: EncoderKind::Onnx,
            dimension: FEATURE_DIM,
            onnx: OnnxEncoderConfig::default(),
        }
    }
}

/// Input geometry and normalization of the embedding network.
///
/// Defaults match SFace: 112×112 RGB, raw 0-255 values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnnxEncoderConfig {
    pub input_size: u32,
    pub mean: f32,
    pub std: f32,
}

impl Default for OnnxEncoderConfig {
    fn default() -> Self {
        Self {
            input_size: 112,
            mean: 0.0,
            std: 1.0,
        }
    }
}

/// Calibration constants of the quality heuristic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Laplacian variance that maps to a clarity of 1.0.
    pub clarity_scale: f64,
    /// Multiplier on the face-area ratio; 0.1 of the frame maps to 1.0 by default.
    pub size_scale: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            clarity_scale: 1000.0,
            size_scale: 10.0,
        }
    }
}
