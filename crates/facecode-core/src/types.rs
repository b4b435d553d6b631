use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Euclidean distance below which two feature vectors are reported as a match.
pub const MATCH_THRESHOLD: f32 = 0.6;

/// Size in bytes of one serialized feature component (little-endian f32).
const COMPONENT_BYTES: usize = 4;

#[derive(Error, Debug)]
pub enum FeatureCodeError {
    #[error("feature code is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("feature code is empty")]
    Empty,
    #[error("feature code length {0} is not a multiple of 4 bytes")]
    Misaligned(usize),
    #[error("feature vectors differ in dimension: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

/// Five facial landmarks in image pixels: left eye, right eye, nose tip,
/// left and right mouth corners.
pub type Landmarks = [(f32, f32); 5];

/// A face bounding region in `(top, right, bottom, left)` pixel offsets.
///
/// Always satisfies `top < bottom` and `left < right`; regions produced by
/// [`FaceRegion::from_xywh`] additionally lie inside the image they came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
    /// Set by detectors that regress landmarks; used to align the face before encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<Landmarks>,
}

impl FaceRegion {
    /// Build a region from canonical offsets, rejecting empty or inverted boxes.
    pub fn new(top: u32, right: u32, bottom: u32, left: u32) -> Option<Self> {
        (top < bottom && left < right).then_some(Self {
            top,
            right,
            bottom,
            left,
            landmarks: None,
        })
    }

    /// Attach landmarks, dropping them unless every coordinate is finite.
    pub fn with_landmarks(mut self, landmarks: Option<Landmarks>) -> Self {
        self.landmarks = landmarks.filter(|pts| pts.iter().all(|(x, y)| x.is_finite() && y.is_finite()));
        self
    }

    /// Translate an `(x, y, width, height)` box into canonical offsets,
    /// clamped to an image of `image_width` × `image_height`.
    ///
    /// Returns `None` when nothing of the box survives clamping.
    pub fn from_xywh(
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        image_width: u32,
        image_height: u32,
    ) -> Option<Self> {
        if !(x.is_finite() && y.is_finite() && width.is_finite() && height.is_finite()) {
            return None;
        }
        let clamp_x = |v: f32| v.round().clamp(0.0, image_width as f32) as u32;
        let clamp_y = |v: f32| v.round().clamp(0.0, image_height as f32) as u32;

        Self::new(clamp_y(y), clamp_x(x + width), clamp_y(y + height), clamp_x(x))
    }

    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// Face pixel area divided by the image pixel area (0.0 for an empty image).
    pub fn area_ratio(&self, image_width: u32, image_height: u32) -> f64 {
        let image_area = image_width as u64 * image_height as u64;
        if image_area == 0 {
            return 0.0;
        }
        self.area() as f64 / image_area as f64
    }

    /// Whether the region lies entirely inside an image of the given size.
    pub fn fits(&self, image_width: u32, image_height: u32) -> bool {
        self.right <= image_width && self.bottom <= image_height
    }
}

/// Fixed-dimension face feature vector.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: Vec<f32>,
}

impl FeatureVector {
    /// L2-normalize raw encoder output.
    ///
    /// A zero vector is passed through unchanged rather than divided by zero.
    pub fn normalized(raw: Vec<f32>) -> Self {
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Byte-exact little-endian f32 layout.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Base64 transport form of [`to_le_bytes`](Self::to_le_bytes).
    pub fn to_feature_code(&self) -> String {
        STANDARD.encode(self.to_le_bytes())
    }

    /// Decode a feature code produced by [`to_feature_code`](Self::to_feature_code).
    ///
    /// Values are taken verbatim; no renormalization happens here.
    pub fn from_feature_code(code: &str) -> Result<Self, FeatureCodeError> {
        let bytes = STANDARD.decode(code.trim())?;
        Self::from_le_bytes(&bytes)
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, FeatureCodeError> {
        if bytes.is_empty() {
            return Err(FeatureCodeError::Empty);
        }
        if bytes.len() % COMPONENT_BYTES != 0 {
            return Err(FeatureCodeError::Misaligned(bytes.len()));
        }
        let values = bytes
            .chunks_exact(COMPONENT_BYTES)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { values })
    }

    /// Compute Euclidean distance between two feature vectors.
    pub fn euclidean_distance(&self, other: &FeatureVector) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Outcome of comparing two feature vectors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub distance: f32,
    /// `1 - min(distance, 1)`.
    pub similarity: f32,
    #[serde(rename = "match")]
    pub matched: bool,
}

/// Compare two equal-dimension feature vectors.
///
/// `matched` uses the fixed [`MATCH_THRESHOLD`]; callers wanting another
/// operating point should threshold `distance` themselves.
pub fn compare(a: &FeatureVector, b: &FeatureVector) -> Result<Comparison, FeatureCodeError> {
    if a.len() != b.len() {
        return Err(FeatureCodeError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    let distance = a.euclidean_distance(b);
    Ok(Comparison {
        distance,
        similarity: 1.0 - distance.min(1.0),
        matched: distance < MATCH_THRESHOLD,
    })
}

/// Compare two base64 feature codes.
pub fn compare_codes(a: &str, b: &str) -> Result<Comparison, FeatureCodeError> {
    compare(
        &FeatureVector::from_feature_code(a)?,
        &FeatureVector::from_feature_code(b)?,
    )
}

/// Boundary result of one extraction call.
///
/// Built only through [`ExtractionResult::succeeded`] or
/// [`ExtractionResult::failed`], so a failure never carries a feature code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub success: bool,
    pub feature_code: String,
    pub quality: f64,
    #[serde(rename = "process_time")]
    pub process_time_ms: f64,
    pub message: String,
}

impl ExtractionResult {
    pub const SUCCESS_MESSAGE: &'static str = "feature extraction succeeded";

    pub fn succeeded(features: &FeatureVector, quality: f64, elapsed: Duration) -> Self {
        Self {
            success: true,
            feature_code: features.to_feature_code(),
            quality,
            process_time_ms: elapsed.as_secs_f64() * 1000.0,
            message: Self::SUCCESS_MESSAGE.to_string(),
        }
    }

    pub fn failed(message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            feature_code: String::new(),
            quality: 0.0,
            process_time_ms: elapsed.as_secs_f64() * 1000.0,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_rejects_degenerate() {
        assert!(FaceRegion::new(10, 20, 10, 5).is_none());
        assert!(FaceRegion::new(10, 5, 20, 5).is_none());
        assert!(FaceRegion::new(0, 1, 1, 0).is_some());
    }

    #[test]
    fn test_region_from_xywh_translates_convention() {
        // (x, y, w, h) = (12, 30, 40, 50) -> (top, right, bottom, left)
        let r = FaceRegion::from_xywh(12.0, 30.0, 40.0, 50.0, 200, 200).unwrap();
        assert_eq!(r, FaceRegion { top: 30, right: 52, bottom: 80, left: 12, landmarks: None });
    }

    #[test]
    fn test_region_from_xywh_clamps_to_image() {
        let r = FaceRegion::from_xywh(-10.0, -5.0, 50.0, 300.0, 100, 120).unwrap();
        assert_eq!(r, FaceRegion { top: 0, right: 40, bottom: 120, left: 0, landmarks: None });
        assert!(r.fits(100, 120));
    }

    #[test]
    fn test_region_from_xywh_outside_image() {
        assert!(FaceRegion::from_xywh(150.0, 10.0, 20.0, 20.0, 100, 100).is_none());
        assert!(FaceRegion::from_xywh(f32::NAN, 0.0, 10.0, 10.0, 100, 100).is_none());
    }

    #[test]
    fn test_region_area_ratio() {
        let r = FaceRegion::new(0, 10, 10, 0).unwrap();
        assert_eq!(r.area(), 100);
        assert!((r.area_ratio(100, 100) - 0.01).abs() < 1e-12);
        assert_eq!(r.area_ratio(0, 0), 0.0);
    }

    #[test]
    fn test_normalized_unit_norm() {
        let v = FeatureVector::normalized(vec![3.0, 4.0, 0.0]);
        assert!((v.norm() - 1.0).abs() < 1e-6);
        assert!((v.values()[0] - 0.6).abs() < 1e-6);
        assert!((v.values()[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_zero_vector_passes_through() {
        let v = FeatureVector::normalized(vec![0.0; 8]);
        assert_eq!(v.values(), &[0.0; 8]);
    }

    #[test]
    fn test_le_bytes_layout() {
        let v = FeatureVector::normalized(vec![1.0, 0.0]);
        assert_eq!(v.to_le_bytes(), vec![0x00, 0x00, 0x80, 0x3f, 0, 0, 0, 0]);
    }

    #[test]
    fn test_feature_code_is_exact() {
        let raw: Vec<f32> = (0..128).map(|i| (i as f32 * 0.37).sin()).collect();
        let v = FeatureVector::normalized(raw);
        let decoded = FeatureVector::from_feature_code(&v.to_feature_code()).unwrap();
        assert_eq!(decoded.values(), v.values());
        assert!((decoded.norm() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_feature_code_rejects_misaligned() {
        let code = STANDARD.encode([1u8, 2, 3]);
        assert!(matches!(
            FeatureVector::from_feature_code(&code),
            Err(FeatureCodeError::Misaligned(3))
        ));
        assert!(matches!(
            FeatureVector::from_feature_code(""),
            Err(FeatureCodeError::Empty)
        ));
        assert!(FeatureVector::from_feature_code("not base64!").is_err());
    }

    #[test]
    fn test_compare_self() {
        let v = FeatureVector::normalized((0..128).map(|i| i as f32).collect());
        let c = compare(&v, &v).unwrap();
        assert!(c.distance.abs() < 1e-6);
        assert!((c.similarity - 1.0).abs() < 1e-6);
        assert!(c.matched);
    }

    #[test]
    fn test_compare_orthogonal() {
        let a = FeatureVector::normalized(vec![1.0, 0.0]);
        let b = FeatureVector::normalized(vec![0.0, 1.0]);
        let c = compare(&a, &b).unwrap();
        assert!((c.distance - 2f32.sqrt()).abs() < 1e-6);
        assert_eq!(c.similarity, 0.0);
        assert!(!c.matched);
    }

    #[test]
    fn test_compare_dimension_mismatch() {
        let a = FeatureVector::normalized(vec![1.0, 0.0]);
        let b = FeatureVector::normalized(vec![1.0, 0.0, 0.0]);
        assert!(matches!(
            compare(&a, &b),
            Err(FeatureCodeError::DimensionMismatch { left: 2, right: 3 })
        ));
    }

    #[test]
    fn test_comparison_serializes_match_key() {
        let c = Comparison { distance: 0.1, similarity: 0.9, matched: true };
        let json = serde_json::to_value(c).unwrap();
        assert_eq!(json["match"], true);
    }

    #[test]
    fn test_failed_result_shape() {
        let r = ExtractionResult::failed("no face detected", Duration::from_millis(12));
        assert!(!r.success);
        assert!(r.feature_code.is_empty());
        assert_eq!(r.quality, 0.0);
        assert!((r.process_time_ms - 12.0).abs() < 1e-9);

        let json = serde_json::to_value(&r).unwrap();
        let keys: Vec<&str> = json.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        assert_eq!(keys.len(), 5);
        for key in ["success", "feature_code", "quality", "process_time", "message"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }
}
