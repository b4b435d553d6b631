//! SCRFD face detector via ONNX Runtime.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor-free decoding and NMS post-processing.
//! The 640×640 letterbox resize doubles as the upsampling pass for small images.

use super::{DetectionStrategy, DetectorError};
use crate::config::ScrfdConfig;
use crate::normalize::CanonicalImage;
use crate::types::{FaceRegion, Landmarks};
use image::imageops::FilterType;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

// --- Named constants (no magic numbers) ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const SCRFD_KPS_PER_ANCHOR: usize = 10;

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Raw detection in original image coordinates, before conversion to a region.
#[derive(Debug, Clone)]
struct ScoredBox {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    confidence: f32,
    landmarks: Option<Landmarks>,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based face detector. The primary strategy of the cascade.
pub struct ScrfdDetector {
    session: Mutex<Session>,
    input_size: usize,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    /// Discovered by name at load time; falls back to positional ordering.
    stride_indices: [StrideOutputIndices; 3],
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, config: &ScrfdConfig) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if num_outputs < 9 {
            return Err(DetectorError::InvalidModel {
                path: model_path.display().to_string(),
                reason: format!(
                    "SCRFD requires 9 outputs (3 strides × score/bbox/kps), got {num_outputs}"
                ),
            });
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session: Mutex::new(session),
            input_size: SCRFD_INPUT_SIZE,
            stride_indices,
            confidence_threshold: config.confidence_threshold,
            nms_threshold: config.nms_threshold,
        })
    }

    /// Detect faces, returning boxes sorted by confidence.
    fn detect_boxes(&self, image: &CanonicalImage) -> Result<Vec<ScoredBox>, DetectorError> {
        let (input, letterbox) = preprocess(image, self.input_size);

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::InferenceFailed("SCRFD session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            all_detections.extend(decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                self.input_size,
                &letterbox,
                self.confidence_threshold,
            ));
        }

        let mut result = nms(all_detections, self.nms_threshold);
        result.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(result)
    }
}

impl DetectionStrategy for ScrfdDetector {
    fn name(&self) -> &'static str {
        "scrfd"
    }

    fn detect(&self, image: &CanonicalImage) -> Result<Vec<FaceRegion>, DetectorError> {
        let (width, height) = (image.width(), image.height());
        Ok(self
            .detect_boxes(image)?
            .into_iter()
            .filter_map(|b| {
                FaceRegion::from_xywh(b.x, b.y, b.width, b.height, width, height)
                    .map(|region| region.with_landmarks(b.landmarks))
            })
            .collect())
    }
}

/// Letterbox an RGB image into a NCHW float tensor of `input_size`².
///
/// The image is scaled to fit (up or down), centered, and padded with the
/// mean value so padding normalizes to 0.0.
fn preprocess(image: &CanonicalImage, input_size: usize) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let scale = (input_size as f32 / width as f32).min(input_size as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as usize).clamp(1, input_size);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, input_size);
    let pad_x = (input_size - new_w) as f32 / 2.0;
    let pad_y = (input_size - new_h) as f32 / 2.0;

    let resized = image::imageops::resize(
        image.as_rgb(),
        new_w as u32,
        new_h as u32,
        FilterType::Triangle,
    );

    let pad_x_start = pad_x.floor() as usize;
    let pad_y_start = pad_y.floor() as usize;

    // Zero is the normalized value of a SCRFD_MEAN pad pixel.
    let mut tensor = Array4::<f32>::zeros((1, 3, input_size, input_size));

    for (x, y, pixel) in resized.enumerate_pixels() {
        let ty = pad_y_start + y as usize;
        let tx = pad_x_start + x as usize;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (
        tensor,
        LetterboxInfo {
            scale,
            pad_x: pad_x_start as f32,
            pad_y: pad_y_start as f32,
        },
    )
}

/// Discover output tensor ordering by name.
///
/// SCRFD models may export tensors with named outputs ("score_8", "bbox_16", ...) or
/// generic numeric names. If named pattern is detected, maps them to stride slots.
/// Otherwise falls back to the standard positional ordering:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
///   [6-8] = kps    (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named {
        Some(indices) => {
            tracing::debug!("SCRFD: using name-based output tensor mapping");
            [indices[0], indices[1], indices[2]]
        }
        None => {
            tracing::debug!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping"
            );
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode detections for a single stride level.
///
/// Landmarks are left empty when the kps tensor is too short for the anchor.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<ScoredBox> {
    let grid = input_size / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid * stride) as f32;
        let anchor_cy = (anchor_idx / grid * stride) as f32;

        // bbox: [left, top, right, bottom] distances from the anchor, in strides
        let off = idx * 4;
        let Some(d) = bboxes.get(off..off + 4) else {
            continue;
        };
        let s = stride as f32;
        let x1 = (anchor_cx - d[0] * s - letterbox.pad_x) / letterbox.scale;
        let y1 = (anchor_cy - d[1] * s - letterbox.pad_y) / letterbox.scale;
        let x2 = (anchor_cx + d[2] * s - letterbox.pad_x) / letterbox.scale;
        let y2 = (anchor_cy + d[3] * s - letterbox.pad_y) / letterbox.scale;

        // kps: five (dx, dy) offsets from the anchor, in strides
        let kps_off = idx * SCRFD_KPS_PER_ANCHOR;
        let landmarks = kps.get(kps_off..kps_off + SCRFD_KPS_PER_ANCHOR).map(|k| {
            let mut points = [(0.0f32, 0.0f32); 5];
            for (point, offset) in points.iter_mut().zip(k.chunks_exact(2)) {
                *point = (
                    (anchor_cx + offset[0] * s - letterbox.pad_x) / letterbox.scale,
                    (anchor_cy + offset[1] * s - letterbox.pad_y) / letterbox.scale,
                );
            }
            points
        });

        detections.push(ScoredBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }

    detections
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<ScoredBox>, iou_threshold: f32) -> Vec<ScoredBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if !suppressed[j] && iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Intersection-over-Union between two boxes.
fn iou(a: &ScoredBox, b: &ScoredBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.width * a.height + b.width * b.height - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn make_box(x: f32, y: f32, w: f32, h: f32, conf: f32) -> ScoredBox {
        ScoredBox { x, y, width: w, height: h, confidence: conf, landmarks: None }
    }

    #[test]
    fn test_iou_identical() {
        let a = make_box(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = make_box(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_box(5.0, 0.0, 10.0, 10.0, 1.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            make_box(5.0, 5.0, 100.0, 100.0, 0.8),
            make_box(0.0, 0.0, 100.0, 100.0, 0.9),
            make_box(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_preprocess_letterbox_small_image_upsampled() {
        let img = CanonicalImage::from_rgb(RgbImage::from_pixel(160, 80, Rgb([255, 0, 0])));
        let (tensor, lb) = preprocess(&img, 640);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((lb.scale - 4.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 160.0);

        // Padding normalizes to 0.0, content keeps channel order.
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let red = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        let zero = (0.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 0, 320, 320]] - red).abs() < 1e-3);
        assert!((tensor[[0, 1, 320, 320]] - zero).abs() < 1e-3);
    }

    #[test]
    fn test_decode_stride_maps_back_through_letterbox() {
        // One anchor above threshold at grid cell (1, 2) of stride 32.
        let stride = 32;
        let grid = 640 / stride;
        let mut scores = vec![0.0f32; grid * grid * 2];
        let anchor = 2 * grid + 1;
        let idx = anchor * 2;
        scores[idx] = 0.9;
        let mut bboxes = vec![0.0f32; scores.len() * 4];
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[0.5, 0.5, 0.5, 0.5]);

        let lb = LetterboxInfo { scale: 2.0, pad_x: 0.0, pad_y: 10.0 };
        let dets = decode_stride(&scores, &bboxes, &[], stride, 640, &lb, 0.5);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        // anchor center (32, 64), half-extent 16 -> letterboxed (16,48)-(48,80)
        assert!((d.x - 8.0).abs() < 1e-4);
        assert!((d.y - 19.0).abs() < 1e-4);
        assert!((d.width - 16.0).abs() < 1e-4);
        assert!((d.height - 16.0).abs() < 1e-4);
        assert!(d.landmarks.is_none());
    }

    #[test]
    fn test_decode_stride_landmarks() {
        let stride = 16;
        let grid = 640 / stride;
        let mut scores = vec![0.0f32; grid * grid * 2];
        // Second anchor of grid cell (3, 1)
        let idx = (grid + 3) * 2 + 1;
        scores[idx] = 0.8;
        let mut bboxes = vec![0.0f32; scores.len() * 4];
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);
        let mut kps = vec![0.0f32; scores.len() * 10];
        kps[idx * 10..idx * 10 + 10]
            .copy_from_slice(&[-0.5, -0.25, 0.5, -0.25, 0.0, 0.0, -0.25, 0.5, 0.25, 0.5]);

        let lb = LetterboxInfo { scale: 2.0, pad_x: 4.0, pad_y: 0.0 };
        let dets = decode_stride(&scores, &bboxes, &kps, stride, 640, &lb, 0.5);
        assert_eq!(dets.len(), 1);
        let points = dets[0].landmarks.unwrap();

        // Anchor center (48, 16) in letterbox space
        let expected = [(18.0, 6.0), (26.0, 6.0), (22.0, 8.0), (20.0, 12.0), (24.0, 12.0)];
        for (got, want) in points.iter().zip(expected) {
            assert!((got.0 - want.0).abs() < 1e-4 && (got.1 - want.1).abs() < 1e-4, "{got:?} vs {want:?}");
        }

        let region = FaceRegion::from_xywh(dets[0].x, dets[0].y, dets[0].width, dets[0].height, 200, 200)
            .map(|r| r.with_landmarks(dets[0].landmarks))
            .unwrap();
        assert_eq!(region.landmarks, Some(points));
        assert_eq!((region.left, region.top, region.right, region.bottom), (14, 0, 30, 16));
    }

    #[test]
    fn test_decode_stride_threshold() {
        let scores = vec![0.5f32; 20 * 20 * 2];
        let bboxes = vec![1.0f32; scores.len() * 4];
        let lb = LetterboxInfo { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        assert!(decode_stride(&scores, &bboxes, &[], 32, 640, &lb, 0.5).is_empty());
    }

    #[test]
    fn test_discover_output_indices_shuffled_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();

        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_load_missing_model() {
        let err = ScrfdDetector::load(Path::new("/nonexistent/det.onnx"), &ScrfdConfig::default());
        assert!(matches!(err, Err(DetectorError::ModelNotFound(_))));
    }
}
