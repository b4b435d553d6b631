use super::{DetectionStrategy, DetectorError};
use crate::config::SeetaConfig;
use crate::normalize::CanonicalImage;
use crate::types::FaceRegion;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Classical funnel-structured cascade detector backed by `rustface` (SeetaFace).
///
/// Runs on luminance only and needs no inference runtime, so it serves as the
/// fast fallback when the network detector finds nothing.
pub struct SeetaDetector {
    model: rustface::Model,
    config: SeetaConfig,
}

impl SeetaDetector {
    pub fn load(model_path: &Path, config: &SeetaConfig) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }
        let invalid = |reason: String| DetectorError::InvalidModel {
            path: model_path.display().to_string(),
            reason,
        };

        let file = File::open(model_path).map_err(|e| invalid(e.to_string()))?;
        let model = rustface::read_model(BufReader::new(file)).map_err(|e| invalid(e.to_string()))?;
        tracing::info!(path = %model_path.display(), "loaded SeetaFace model");

        Ok(Self {
            model,
            config: config.clone(),
        })
    }
}

impl DetectionStrategy for SeetaDetector {
    fn name(&self) -> &'static str {
        "seeta"
    }

    fn detect(&self, image: &CanonicalImage) -> Result<Vec<FaceRegion>, DetectorError> {
        let gray = image.to_luma();
        let (width, height) = gray.dimensions();

        // Detector state is per-call; the model itself is shared read-only.
        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(self.config.min_face_size);
        detector.set_score_thresh(self.config.score_threshold);
        detector.set_pyramid_scale_factor(self.config.pyramid_scale_factor);
        detector.set_slide_window_step(self.config.slide_window_step, self.config.slide_window_step);

        let faces = detector.detect(&rustface::ImageData::new(gray.as_raw(), width, height));

        Ok(faces
            .iter()
            .filter_map(|face| {
                let bbox = face.bbox();
                FaceRegion::from_xywh(
                    bbox.x() as f32,
                    bbox.y() as f32,
                    bbox.width() as f32,
                    bbox.height() as f32,
                    width,
                    height,
                )
            })
            .collect())
    }
}
