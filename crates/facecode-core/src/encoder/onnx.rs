//! Face embedding network via ONNX Runtime.
//!
//! Faces with landmarks are warped onto the reference layout at the network's
//! input size; faces without them fall back to the resized box crop. Returns
//! the raw embedding. The default geometry targets SFace (112×112, 128-d output).

use super::{EncoderError, FeatureEncoder};
use crate::align;
use crate::config::OnnxEncoderConfig;
use crate::normalize::CanonicalImage;
use crate::types::FaceRegion;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

pub struct EmbeddingEncoder {
    session: Mutex<Session>,
    input_size: u32,
    mean: f32,
    std: f32,
}

impl EmbeddingEncoder {
    pub fn load(model_path: &Path, config: &OnnxEncoderConfig) -> Result<Self, EncoderError> {
        if !model_path.exists() {
            return Err(EncoderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_size: config.input_size,
            mean: config.mean,
            std: config.std,
        })
    }
}

impl FeatureEncoder for EmbeddingEncoder {
    fn name(&self) -> &'static str {
        "onnx"
    }

    fn encode(&self, image: &CanonicalImage, region: &FaceRegion) -> Result<Vec<f32>, EncoderError> {
        let face = face_input(image, region, self.input_size)?;
        let input = preprocess(&face, self.input_size, self.mean, self.std);

        let mut session = self
            .session
            .lock()
            .map_err(|_| EncoderError::InferenceFailed("embedding session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        Ok(raw.to_vec())
    }
}

/// Aligned face when the region carries usable landmarks, else the box crop.
fn face_input(image: &CanonicalImage, region: &FaceRegion, size: u32) -> Result<RgbImage, EncoderError> {
    if let Some(landmarks) = &region.landmarks {
        if let Some(aligned) = align::align_face(image.as_rgb(), landmarks, size) {
            return Ok(aligned);
        }
        tracing::debug!(?region, "degenerate landmarks, encoding the unaligned crop");
    }
    image.crop(region).ok_or(EncoderError::InvalidRegion(*region))
}

/// Resize an RGB face to `size`² (if needed) and pack it as a NCHW float
/// tensor of `(pixel - mean) / std`.
fn preprocess(face: &RgbImage, size: u32, mean: f32, std: f32) -> Array4<f32> {
    let scaled;
    let resized = if face.dimensions() == (size, size) {
        face
    } else {
        scaled = image::imageops::resize(face, size, size, FilterType::Triangle);
        &scaled
    };
    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));

    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - mean) / std;
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let crop = RgbImage::from_pixel(37, 51, Rgb([128, 128, 128]));
        let tensor = preprocess(&crop, 112, 0.0, 1.0);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let crop = RgbImage::from_pixel(112, 112, Rgb([128, 128, 128]));
        let tensor = preprocess(&crop, 112, 127.5, 127.5);
        let expected = (128.0 - 127.5) / 127.5;
        let val = tensor[[0, 0, 0, 0]];
        assert!((val - expected).abs() < 1e-6, "got {val}, expected {expected}");
    }

    #[test]
    fn test_preprocess_keeps_channel_order() {
        let crop = RgbImage::from_pixel(20, 20, Rgb([200, 100, 10]));
        let tensor = preprocess(&crop, 8, 0.0, 1.0);
        assert_eq!(tensor[[0, 0, 4, 4]], 200.0);
        assert_eq!(tensor[[0, 1, 4, 4]], 100.0);
        assert_eq!(tensor[[0, 2, 4, 4]], 10.0);
    }

    #[test]
    fn test_face_input_aligns_when_landmarks_present() {
        let image = CanonicalImage::from_rgb(RgbImage::from_fn(200, 160, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 60])
        }));
        let region = FaceRegion::new(20, 150, 140, 50).unwrap();

        let crop = face_input(&image, &region, 112).unwrap();
        assert_eq!(crop.dimensions(), (100, 120));

        let landmarks = [(80.0, 60.0), (120.0, 60.0), (100.0, 85.0), (85.0, 110.0), (115.0, 110.0)];
        let aligned = face_input(&image, &region.with_landmarks(Some(landmarks)), 112).unwrap();
        assert_eq!(aligned.dimensions(), (112, 112));
        assert_ne!(aligned.as_raw(), &image::imageops::resize(&crop, 112, 112, FilterType::Triangle).into_raw());
    }

    #[test]
    fn test_face_input_falls_back_on_degenerate_landmarks() {
        let image = CanonicalImage::from_rgb(RgbImage::from_pixel(100, 100, Rgb([9, 9, 9])));
        let region = FaceRegion::new(10, 60, 70, 20).unwrap().with_landmarks(Some([(30.0, 30.0); 5]));
        assert_eq!(face_input(&image, &region, 112).unwrap().dimensions(), (40, 60));

        let outside = FaceRegion::new(10, 160, 70, 20).unwrap();
        assert!(matches!(
            face_input(&image, &outside, 112),
            Err(EncoderError::InvalidRegion(_))
        ));
    }

    #[test]
    fn test_load_missing_model() {
        let err = EmbeddingEncoder::load(Path::new("/nonexistent/sface.onnx"), &OnnxEncoderConfig::default());
        assert!(matches!(err, Err(EncoderError::ModelNotFound(_))));
    }
}
