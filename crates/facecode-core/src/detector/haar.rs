//! Viola-Jones Haar cascade detector.
//!
//! The last-resort strategy: slow but dependency-free and tolerant of small
//! or low-contrast faces when run with relaxed parameters. Cascades are read
//! from OpenCV's XML storage format (`haarcascade_frontalface_default.xml`
//! as shipped with OpenCV), restricted to upright stump classifiers:
//!
//! ```xml
//! <opencv_storage>
//! <cascade type_id="opencv-cascade-classifier">
//!   <featureType>HAAR</featureType>
//!   <height>24</height>
//!   <width>24</width>
//!   <stages>
//!     <_>
//!       <stageThreshold>-0.82</stageThreshold>
//!       <weakClassifiers>
//!         <_>
//!           <internalNodes>0 -1 0 0.004</internalNodes>
//!           <leafValues>0.03 -0.8</leafValues></_></weakClassifiers></_></stages>
//!   <features>
//!     <_>
//!       <rects>
//!         <_>6 4 12 9 -1.</_>
//!         <_>6 7 12 3 3.</_></rects></_></features></cascade>
//! </opencv_storage>
//! ```

use super::{DetectionStrategy, DetectorError};
use crate::config::HaarConfig;
use crate::normalize::CanonicalImage;
use crate::types::FaceRegion;
use image::imageops::FilterType;
use image::GrayImage;
use rayon::prelude::*;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;

/// Relative tolerance used when merging overlapping hits.
const GROUP_EPS: f64 = 0.2;
/// Stage thresholds are relaxed by this much to absorb float rounding.
const STAGE_THRESHOLD_EPS: f32 = 1e-5;

#[derive(Debug, Clone)]
pub struct HaarCascade {
    pub width: u32,
    pub height: u32,
    pub stages: Vec<HaarStage>,
    pub features: Vec<HaarFeature>,
}

#[derive(Debug, Clone)]
pub struct HaarStage {
    pub threshold: f32,
    pub classifiers: Vec<HaarStump>,
}

/// Single-split weak classifier.
#[derive(Debug, Clone)]
pub struct HaarStump {
    pub feature: usize,
    pub threshold: f32,
    pub left: f32,
    pub right: f32,
}

#[derive(Debug, Clone)]
pub struct HaarFeature {
    /// `(x, y, width, height, weight)` in window coordinates.
    pub rects: Vec<(u32, u32, u32, u32, f32)>,
    pub tilted: bool,
}

/// OpenCV `FileStorage` layout. Sequences are runs of `<_>` elements.
mod xml {
    use super::Deserialize;

    #[derive(Deserialize)]
    pub struct Storage {
        pub cascade: Cascade,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Cascade {
        #[serde(default)]
        pub stage_type: Option<String>,
        #[serde(default)]
        pub feature_type: Option<String>,
        pub height: u32,
        pub width: u32,
        pub stages: Seq<Stage>,
        pub features: Seq<Feature>,
    }

    #[derive(Deserialize)]
    pub struct Seq<T> {
        #[serde(rename = "_", default = "Vec::new")]
        pub items: Vec<T>,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Stage {
        pub stage_threshold: f32,
        #[serde(default)]
        pub weak_classifiers: Option<Seq<WeakClassifier>>,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct WeakClassifier {
        pub internal_nodes: String,
        pub leaf_values: String,
    }

    #[derive(Deserialize)]
    pub struct Feature {
        pub rects: Seq<String>,
        #[serde(default)]
        pub tilted: Option<u8>,
    }
}

/// Parse every whitespace-separated token of `text` as `T`.
fn numbers<T: FromStr>(text: &str, what: &str) -> Result<Vec<T>, String> {
    text.split_whitespace()
        .map(|tok| tok.parse::<T>().map_err(|_| format!("{what}: bad number {tok:?}")))
        .collect()
}

impl HaarCascade {
    /// Parse an OpenCV XML cascade (the format written by `opencv_traincascade`).
    pub fn from_xml(src: &str) -> Result<Self, String> {
        let storage: xml::Storage = quick_xml::de::from_str(src).map_err(|e| e.to_string())?;
        let cascade = storage.cascade;

        if let Some(kind) = cascade.stage_type.as_deref() {
            if kind != "BOOST" {
                return Err(format!("unsupported stage type {kind}"));
            }
        }
        if let Some(kind) = cascade.feature_type.as_deref() {
            if kind != "HAAR" {
                return Err(format!("unsupported feature type {kind}"));
            }
        }

        let stages = cascade
            .stages
            .items
            .into_iter()
            .enumerate()
            .map(|(s, stage)| -> Result<HaarStage, String> {
                let classifiers = stage
                    .weak_classifiers
                    .map(|seq| seq.items)
                    .unwrap_or_default()
                    .iter()
                    .map(|weak| parse_stump(weak).map_err(|e| format!("stage {s}: {e}")))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(HaarStage {
                    threshold: stage.stage_threshold,
                    classifiers,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let features = cascade
            .features
            .items
            .into_iter()
            .enumerate()
            .map(|(i, feature)| -> Result<HaarFeature, String> {
                let rects = feature
                    .rects
                    .items
                    .iter()
                    .map(|text| -> Result<(u32, u32, u32, u32, f32), String> {
                        match numbers::<f32>(text, "rect")?.as_slice() {
                            &[x, y, w, h, weight] if [x, y, w, h].iter().all(|v| *v >= 0.0) => {
                                Ok((x as u32, y as u32, w as u32, h as u32, weight))
                            }
                            _ => Err(format!("feature {i}: malformed rect {:?}", text.trim())),
                        }
                    })
                    .collect::<Result<Vec<_>, String>>()?;
                Ok(HaarFeature {
                    rects,
                    tilted: feature.tilted.unwrap_or(0) != 0,
                })
            })
            .collect::<Result<Vec<_>, String>>()?;

        let cascade = Self {
            width: cascade.width,
            height: cascade.height,
            stages,
            features,
        };
        cascade.validate()?;
        Ok(cascade)
    }

    fn validate(&self) -> Result<(), String> {
        if self.width < 3 || self.height < 3 {
            return Err(format!("window {}x{} too small", self.width, self.height));
        }
        if self.stages.is_empty() {
            return Err("cascade has no stages".into());
        }
        for (i, feature) in self.features.iter().enumerate() {
            if feature.tilted {
                return Err(format!("feature {i}: tilted features are not supported"));
            }
            if feature.rects.is_empty() {
                return Err(format!("feature {i}: no rectangles"));
            }
            for &(x, y, w, h, _) in &feature.rects {
                if x + w > self.width || y + h > self.height {
                    return Err(format!("feature {i}: rectangle outside the window"));
                }
            }
        }
        for (s, stage) in self.stages.iter().enumerate() {
            if let Some(stump) = stage.classifiers.iter().find(|c| c.feature >= self.features.len()) {
                return Err(format!("stage {s}: unknown feature {}", stump.feature));
            }
        }
        Ok(())
    }
}

/// `internalNodes` of a stump is `left right feature threshold`; deeper trees
/// carry more nodes and are rejected.
fn parse_stump(weak: &xml::WeakClassifier) -> Result<HaarStump, String> {
    let nodes: Vec<&str> = weak.internal_nodes.split_whitespace().collect();
    let [_, _, feature, threshold] = nodes.as_slice() else {
        return Err(format!("only stump classifiers are supported, got {} node values", nodes.len()));
    };
    let feature = feature
        .parse::<usize>()
        .map_err(|_| format!("bad feature index {feature:?}"))?;
    let threshold = threshold
        .parse::<f32>()
        .map_err(|_| format!("bad node threshold {threshold:?}"))?;

    match numbers::<f32>(&weak.leaf_values, "leafValues")?.as_slice() {
        &[left, right] => Ok(HaarStump {
            feature,
            threshold,
            left,
            right,
        }),
        leaves => Err(format!("expected 2 leaf values, got {}", leaves.len())),
    }
}

/// Summed-area tables of pixel values and squared pixel values.
struct IntegralImage {
    stride: usize,
    sum: Vec<u64>,
    sqsum: Vec<u64>,
}

impl IntegralImage {
    fn new(gray: &GrayImage) -> Self {
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sqsum = vec![0u64; stride * (h + 1)];

        for y in 0..h {
            let (mut row, mut row_sq) = (0u64, 0u64);
            for x in 0..w {
                let v = gray.get_pixel(x as u32, y as u32)[0] as u64;
                row += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row;
                sqsum[(y + 1) * stride + x + 1] = sqsum[y * stride + x + 1] + row_sq;
            }
        }
        Self { stride, sum, sqsum }
    }

    fn rect(table: &[u64], stride: usize, x: usize, y: usize, w: usize, h: usize) -> f64 {
        let a = table[y * stride + x];
        let b = table[y * stride + x + w];
        let c = table[(y + h) * stride + x];
        let d = table[(y + h) * stride + x + w];
        (d + a) as f64 - (b + c) as f64
    }

    fn sum(&self, x: usize, y: usize, w: usize, h: usize) -> f64 {
        Self::rect(&self.sum, self.stride, x, y, w, h)
    }

    fn sqsum(&self, x: usize, y: usize, w: usize, h: usize) -> f64 {
        Self::rect(&self.sqsum, self.stride, x, y, w, h)
    }
}

/// Integer rectangle in image coordinates used during grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    x: i32,
    y: i32,
    w: i32,
    h: i32,
}

pub struct HaarDetector {
    cascade: HaarCascade,
    scale_factor: f64,
    min_neighbors: usize,
    min_size: u32,
}

impl HaarDetector {
    pub fn load(path: &Path, config: &HaarConfig) -> Result<Self, DetectorError> {
        if !path.exists() {
            return Err(DetectorError::ModelNotFound(path.display().to_string()));
        }
        let invalid = |reason: String| DetectorError::InvalidModel {
            path: path.display().to_string(),
            reason,
        };
        let src = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        let cascade = HaarCascade::from_xml(&src).map_err(invalid)?;

        tracing::info!(
            path = %path.display(),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );
        Ok(Self::new(cascade, config))
    }

    pub fn new(cascade: HaarCascade, config: &HaarConfig) -> Self {
        Self {
            cascade,
            scale_factor: config.scale_factor,
            min_neighbors: config.min_neighbors,
            min_size: config.min_size,
        }
    }

    /// Pyramid factors whose window is at least `min_size` and fits the image.
    fn scales(&self, width: u32, height: u32) -> Vec<f64> {
        let (win_w, win_h) = (self.cascade.width as f64, self.cascade.height as f64);
        let mut scales = Vec::new();
        let mut factor = 1.0f64;
        loop {
            let scaled_w = (width as f64 / factor).round();
            let scaled_h = (height as f64 / factor).round();
            if scaled_w - win_w <= 0.0 || scaled_h - win_h <= 0.0 {
                break;
            }
            let window_w = (win_w * factor).round() as u32;
            let window_h = (win_h * factor).round() as u32;
            if window_w >= self.min_size && window_h >= self.min_size {
                scales.push(factor);
            }
            factor *= self.scale_factor;
        }
        scales
    }

    /// Raw window hits at one pyramid level, in original image coordinates.
    fn scan_level(&self, gray: &GrayImage, factor: f64) -> Vec<Rect> {
        let scaled_w = (gray.width() as f64 / factor).round() as u32;
        let scaled_h = (gray.height() as f64 / factor).round() as u32;
        let scaled;
        let level = if scaled_w == gray.width() && scaled_h == gray.height() {
            gray
        } else {
            scaled = image::imageops::resize(gray, scaled_w, scaled_h, FilterType::Triangle);
            &scaled
        };

        let integral = IntegralImage::new(level);
        let (win_w, win_h) = (self.cascade.width, self.cascade.height);
        let window = Rect {
            x: 0,
            y: 0,
            w: (win_w as f64 * factor).round() as i32,
            h: (win_h as f64 * factor).round() as i32,
        };
        let step = if factor > 2.0 { 1 } else { 2 };

        let mut hits = Vec::new();
        for y in (0..(scaled_h - win_h) as usize).step_by(step) {
            for x in (0..(scaled_w - win_w) as usize).step_by(step) {
                if self.classify(&integral, x, y) {
                    hits.push(Rect {
                        x: (x as f64 * factor).round() as i32,
                        y: (y as f64 * factor).round() as i32,
                        ..window
                    });
                }
            }
        }
        hits
    }

    /// Run every stage on the window at `(x, y)`; true if all accept.
    fn classify(&self, integral: &IntegralImage, x: usize, y: usize) -> bool {
        let cascade = &self.cascade;
        let (norm_w, norm_h) = (cascade.width as usize - 2, cascade.height as usize - 2);
        let area = (norm_w * norm_h) as f64;
        let sum = integral.sum(x + 1, y + 1, norm_w, norm_h);
        let sqsum = integral.sqsum(x + 1, y + 1, norm_w, norm_h);
        let variance = area * sqsum - sum * sum;
        let norm = if variance > 0.0 { variance.sqrt() } else { 1.0 };
        let inv_norm = (1.0 / norm) as f32;

        cascade.stages.iter().all(|stage| {
            let score: f32 = stage
                .classifiers
                .iter()
                .map(|stump| {
                    let feature = &cascade.features[stump.feature];
                    let value: f64 = feature
                        .rects
                        .iter()
                        .map(|&(rx, ry, rw, rh, weight)| {
                            weight as f64
                                * integral.sum(x + rx as usize, y + ry as usize, rw as usize, rh as usize)
                        })
                        .sum();
                    if (value as f32) * inv_norm < stump.threshold {
                        stump.left
                    } else {
                        stump.right
                    }
                })
                .sum();
            score >= stage.threshold - STAGE_THRESHOLD_EPS
        })
    }
}

impl DetectionStrategy for HaarDetector {
    fn name(&self) -> &'static str {
        "haar"
    }

    fn detect(&self, image: &CanonicalImage) -> Result<Vec<FaceRegion>, DetectorError> {
        let gray = image.to_luma();
        let (width, height) = gray.dimensions();

        let hits: Vec<Rect> = self
            .scales(width, height)
            .into_par_iter()
            .flat_map_iter(|factor| self.scan_level(&gray, factor))
            .collect();
        tracing::trace!(hits = hits.len(), "haar raw windows");

        Ok(group_rectangles(hits, self.min_neighbors, GROUP_EPS)
            .into_iter()
            .filter_map(|r| {
                FaceRegion::from_xywh(r.x as f32, r.y as f32, r.w as f32, r.h as f32, width, height)
            })
            .collect())
    }
}

fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * (a.w.min(b.w) + a.h.min(b.h)) as f64 * 0.5;
    ((a.x - b.x).abs() as f64) <= delta
        && ((a.y - b.y).abs() as f64) <= delta
        && ((a.x + a.w - b.x - b.w).abs() as f64) <= delta
        && ((a.y + a.h - b.y - b.h).abs() as f64) <= delta
}

/// Label equivalence classes of `rects` under [`similar`], in order of first appearance.
fn partition(rects: &[Rect], eps: f64) -> (Vec<usize>, usize) {
    let mut parent: Vec<usize> = (0..rects.len()).collect();

    fn root(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..rects.len() {
        for j in (i + 1)..rects.len() {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (root(&mut parent, i), root(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    let mut class_of_root = vec![usize::MAX; rects.len()];
    let mut classes = 0;
    let labels = (0..rects.len())
        .map(|i| {
            let r = root(&mut parent, i);
            if class_of_root[r] == usize::MAX {
                class_of_root[r] = classes;
                classes += 1;
            }
            class_of_root[r]
        })
        .collect();
    (labels, classes)
}

/// Merge overlapping hits and drop clusters backed by `min_neighbors` or fewer.
///
/// `min_neighbors == 0` returns the raw hits untouched.
fn group_rectangles(rects: Vec<Rect>, min_neighbors: usize, eps: f64) -> Vec<Rect> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects;
    }

    let (labels, classes) = partition(&rects, eps);
    let mut totals = vec![(0i64, 0i64, 0i64, 0i64); classes];
    let mut counts = vec![0usize; classes];
    for (rect, &label) in rects.iter().zip(&labels) {
        let t = &mut totals[label];
        t.0 += rect.x as i64;
        t.1 += rect.y as i64;
        t.2 += rect.w as i64;
        t.3 += rect.h as i64;
        counts[label] += 1;
    }

    let averaged: Vec<Rect> = totals
        .iter()
        .zip(&counts)
        .map(|(t, &n)| {
            let s = 1.0 / n as f64;
            Rect {
                x: (t.0 as f64 * s).round() as i32,
                y: (t.1 as f64 * s).round() as i32,
                w: (t.2 as f64 * s).round() as i32,
                h: (t.3 as f64 * s).round() as i32,
            }
        })
        .collect();

    let mut grouped = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = counts[i];
        if n1 <= min_neighbors {
            continue;
        }

        // Drop small clusters nested inside a better-supported bigger one.
        let nested = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = counts[j];
            if j == i || n2 <= min_neighbors {
                return false;
            }
            let dx = (r2.w as f64 * eps).round() as i32;
            let dy = (r2.h as f64 * eps).round() as i32;
            r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.x + r1.w <= r2.x + r2.w + dx
                && r1.y + r1.h <= r2.y + r2.h + dy
                && (n2 > n1.max(3) || n1 < 3)
        });
        if !nested {
            grouped.push(*r1);
        }
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};

    /// Wrap stage and feature XML in an 8x8 cascade document.
    fn cascade_xml(stages: &str, features: &str) -> String {
        format!(
            r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier"><stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>8</height>
  <width>8</width>
  <stageParams>
    <boostType>GAB</boostType>
    <maxWeakCount>1</maxWeakCount></stageParams>
  <featureParams>
    <maxCatCount>0</maxCatCount></featureParams>
  <stageNum>1</stageNum>
  <stages>{stages}</stages>
  <features>{features}</features></cascade>
</opencv_storage>
"#
        )
    }

    const EDGE_STAGE: &str = r#"
    <!-- stage 0 -->
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 1.0000000149011612e-01</internalNodes>
          <leafValues>
            -1. 1.</leafValues></_></weakClassifiers></_>"#;

    const EDGE_FEATURE: &str = r#"
    <_>
      <rects>
        <_>
          0 0 8 4 -1.</_>
        <_>
          0 4 8 4 1.</_></rects></_>"#;

    /// One stage, one stump: fires when the bottom half of the window is brighter.
    fn edge_cascade() -> HaarCascade {
        HaarCascade::from_xml(&cascade_xml(EDGE_STAGE, EDGE_FEATURE)).unwrap()
    }

    fn config(min_neighbors: usize) -> HaarConfig {
        HaarConfig {
            scale_factor: 1.25,
            min_neighbors,
            min_size: 8,
        }
    }

    fn rect(x: i32, y: i32, w: i32, h: i32) -> Rect {
        Rect { x, y, w, h }
    }

    #[test]
    fn test_uniform_image_has_no_faces() {
        let detector = HaarDetector::new(edge_cascade(), &config(0));
        let image = CanonicalImage::from_rgb(RgbImage::from_pixel(40, 40, Rgb([128, 128, 128])));
        assert!(detector.detect(&image).unwrap().is_empty());
    }

    #[test]
    fn test_edge_image_fires() {
        let detector = HaarDetector::new(edge_cascade(), &config(0));
        let image = CanonicalImage::from_rgb(RgbImage::from_fn(40, 40, |_, y| {
            if y < 20 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        }));
        let regions = detector.detect(&image).unwrap();
        assert!(!regions.is_empty());
        // Every hit sits on the dark/bright boundary (resampling blurs it by a row).
        for r in &regions {
            assert!(r.top <= 20 && r.bottom > 20, "{r:?}");
        }
    }

    #[test]
    fn test_integral_sums() {
        let gray = GrayImage::from_fn(4, 3, |x, y| Luma([(x + y * 4) as u8]));
        let integral = IntegralImage::new(&gray);
        assert_eq!(integral.sum(0, 0, 4, 3), (0..12).sum::<u32>() as f64);
        // Pixels 5, 6, 9, 10
        assert_eq!(integral.sum(1, 1, 2, 2), 30.0);
        assert_eq!(integral.sqsum(1, 1, 2, 2), (25 + 36 + 81 + 100) as f64);
    }

    #[test]
    fn test_scales_respect_min_size_and_image() {
        let detector = HaarDetector::new(
            edge_cascade(),
            &HaarConfig {
                scale_factor: 2.0,
                min_neighbors: 0,
                min_size: 16,
            },
        );
        // Windows 8, 16, 32; 8 is below min_size and 64 no longer fits.
        assert_eq!(detector.scales(64, 64), vec![2.0, 4.0]);
    }

    #[test]
    fn test_group_rectangles_merges_and_filters() {
        let hits = vec![
            rect(10, 10, 50, 50),
            rect(11, 10, 50, 50),
            rect(10, 11, 50, 50),
            rect(12, 12, 50, 50),
            // Isolated single hit
            rect(200, 200, 30, 30),
        ];
        let grouped = group_rectangles(hits, 3, GROUP_EPS);
        assert_eq!(grouped, vec![rect(11, 11, 50, 50)]);
    }

    #[test]
    fn test_group_rectangles_zero_neighbors_passthrough() {
        let hits = vec![rect(0, 0, 10, 10), rect(1, 1, 10, 10)];
        assert_eq!(group_rectangles(hits.clone(), 0, GROUP_EPS), hits);
    }

    #[test]
    fn test_group_rectangles_drops_nested_cluster() {
        let mut hits = Vec::new();
        // Small cluster of 2 inside a big cluster of 5.
        for i in 0..5 {
            hits.push(rect(i, 0, 100, 100));
        }
        for i in 0..2 {
            hits.push(rect(40 + i, 40, 20, 20));
        }
        let grouped = group_rectangles(hits, 1, GROUP_EPS);
        assert_eq!(grouped, vec![rect(2, 0, 100, 100)]);
    }

    #[test]
    fn test_parses_opencv_xml() {
        let cascade = edge_cascade();
        assert_eq!((cascade.width, cascade.height), (8, 8));
        assert_eq!(cascade.stages.len(), 1);
        assert_eq!(cascade.stages[0].threshold, 0.0);

        let stump = &cascade.stages[0].classifiers[0];
        assert_eq!(stump.feature, 0);
        assert!((stump.threshold - 0.1).abs() < 1e-6);
        assert_eq!((stump.left, stump.right), (-1.0, 1.0));

        assert_eq!(cascade.features[0].rects, vec![(0, 0, 8, 4, -1.0), (0, 4, 8, 4, 1.0)]);
        assert!(!cascade.features[0].tilted);
    }

    #[test]
    fn test_empty_stage_and_explicit_untilted() {
        let stage = "<_><maxWeakCount>0</maxWeakCount><stageThreshold>-1.5</stageThreshold>\
                     <weakClassifiers></weakClassifiers></_>";
        let feature = "<_><rects><_>0 0 2 2 1.</_></rects><tilted>0</tilted></_>";
        let cascade = HaarCascade::from_xml(&cascade_xml(stage, feature)).unwrap();
        assert!(cascade.stages[0].classifiers.is_empty());
        assert_eq!(cascade.stages[0].threshold, -1.5);
        assert!(!cascade.features[0].tilted);
    }

    #[test]
    fn test_rejects_unsupported_cascades() {
        let tilted = "<_><rects><_>0 0 2 2 1.</_></rects><tilted>1</tilted></_>";
        let err = HaarCascade::from_xml(&cascade_xml(EDGE_STAGE, tilted)).unwrap_err();
        assert!(err.contains("tilted"), "{err}");

        let outside = "<_><rects><_>6 0 4 2 1.</_></rects></_>";
        assert!(HaarCascade::from_xml(&cascade_xml(EDGE_STAGE, outside)).is_err());

        let unknown = EDGE_STAGE.replace("0 -1 0 1.0000000149011612e-01", "0 -1 3 0.1");
        let err = HaarCascade::from_xml(&cascade_xml(&unknown, EDGE_FEATURE)).unwrap_err();
        assert!(err.contains("unknown feature"), "{err}");

        let tree = EDGE_STAGE.replace("0 -1 0 1.0000000149011612e-01", "1 -1 0 0.1 0 -2 0 0.2");
        let err = HaarCascade::from_xml(&cascade_xml(&tree, EDGE_FEATURE)).unwrap_err();
        assert!(err.contains("only stump classifiers"), "{err}");

        let lbp = cascade_xml(EDGE_STAGE, EDGE_FEATURE).replace(">HAAR<", ">LBP<");
        let err = HaarCascade::from_xml(&lbp).unwrap_err();
        assert!(err.contains("unsupported feature type LBP"), "{err}");

        let short_rect = "<_><rects><_>0 0 2 2</_></rects></_>";
        let err = HaarCascade::from_xml(&cascade_xml(EDGE_STAGE, short_rect)).unwrap_err();
        assert!(err.contains("malformed rect"), "{err}");
    }

    #[test]
    fn test_load_errors() {
        let missing = HaarDetector::load(Path::new("/nonexistent/cascade.xml"), &HaarConfig::default());
        assert!(matches!(missing, Err(DetectorError::ModelNotFound(_))));

        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "<opencv_storage/>").unwrap();
        let garbage = HaarDetector::load(file.path(), &HaarConfig::default());
        assert!(matches!(garbage, Err(DetectorError::InvalidModel { .. })));

        std::fs::write(file.path(), cascade_xml(EDGE_STAGE, EDGE_FEATURE)).unwrap();
        let loaded = HaarDetector::load(file.path(), &HaarConfig::default()).unwrap();
        assert_eq!(loaded.cascade.features.len(), 1);
    }
}
