//! Composite face quality heuristic.
//!
//! `quality = 0.5·clarity + 0.3·size + 0.2·brightness`, each sub-score in
//! `[0, 1]`:
//! - clarity: variance of the 3×3 Laplacian over the face luminance, divided
//!   by `clarity_scale`;
//! - size: face-area ratio times `size_scale`;
//! - brightness: `1 - 2·|mean/255 - 0.5|`, peaking at mid-gray.
//!
//! Scoring never fails: anything that cannot be measured yields
//! [`NEUTRAL_QUALITY`].

use crate::config::QualityConfig;
use crate::normalize::{reflect_101, CanonicalImage};
use crate::types::FaceRegion;
use image::GrayImage;
use serde::Serialize;

/// Score reported when the region cannot be measured.
pub const NEUTRAL_QUALITY: f64 = 0.5;

const CLARITY_WEIGHT: f64 = 0.5;
const SIZE_WEIGHT: f64 = 0.3;
const BRIGHTNESS_WEIGHT: f64 = 0.2;

/// Sub-scores behind one quality value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityBreakdown {
    pub clarity: f64,
    pub size: f64,
    pub brightness: f64,
    pub overall: f64,
}

#[derive(Debug, Clone)]
pub struct QualityScorer {
    clarity_scale: f64,
    size_scale: f64,
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self::from(&QualityConfig::default())
    }
}

impl From<&QualityConfig> for QualityScorer {
    fn from(config: &QualityConfig) -> Self {
        Self::new(config.clarity_scale, config.size_scale)
    }
}

impl QualityScorer {
    pub fn new(clarity_scale: f64, size_scale: f64) -> Self {
        Self {
            clarity_scale,
            size_scale,
        }
    }

    /// Quality in `[0, 1]` of `region`, whose area is `area_ratio` of the image.
    pub fn score(&self, image: &CanonicalImage, region: &FaceRegion, area_ratio: f64) -> f64 {
        match self.breakdown(image, region, area_ratio) {
            Some(b) => b.overall,
            None => {
                tracing::debug!(?region, "quality not measurable, using neutral score");
                NEUTRAL_QUALITY
            }
        }
    }

    /// Sub-scores, or `None` if the region is degenerate or a value is not finite.
    pub fn breakdown(
        &self,
        image: &CanonicalImage,
        region: &FaceRegion,
        area_ratio: f64,
    ) -> Option<QualityBreakdown> {
        if !area_ratio.is_finite() {
            return None;
        }
        let face = image.crop_luma(region)?;
        if face.width() == 0 || face.height() == 0 {
            return None;
        }

        let clarity = (laplacian_variance(&face) / self.clarity_scale).min(1.0);
        let size = (area_ratio * self.size_scale).min(1.0);
        let brightness = (1.0 - 2.0 * (mean_luma(&face) / 255.0 - 0.5).abs()).clamp(0.0, 1.0);
        let overall =
            CLARITY_WEIGHT * clarity + SIZE_WEIGHT * size + BRIGHTNESS_WEIGHT * brightness;

        [clarity, size, brightness, overall]
            .iter()
            .all(|v| v.is_finite())
            .then_some(QualityBreakdown {
                clarity: clarity.max(0.0),
                size: size.max(0.0),
                brightness,
                overall: overall.clamp(0.0, 1.0),
            })
    }
}

/// Variance of the `[0,1,0; 1,-4,1; 0,1,0]` response over every pixel,
/// with reflect-101 borders.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    if w == 0 || h == 0 {
        return 0.0;
    }
    let pixel = |x: usize, y: usize| gray.get_pixel(x as u32, y as u32)[0] as f64;

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for y in 0..h {
        for x in 0..w {
            let (xi, yi) = (x as isize, y as isize);
            let laplacian = pixel(x, reflect_101(yi - 1, h))
                + pixel(x, reflect_101(yi + 1, h))
                + pixel(reflect_101(xi - 1, w), y)
                + pixel(reflect_101(xi + 1, w), y)
                - 4.0 * pixel(x, y);
            sum += laplacian;
            sum_sq += laplacian * laplacian;
        }
    }

    let count = (w * h) as f64;
    let mean = sum / count;
    (sum_sq / count - mean * mean).max(0.0)
}

fn mean_luma(gray: &GrayImage) -> f64 {
    let count = gray.pixels().len() as f64;
    gray.pixels().map(|p| p[0] as f64).sum::<f64>() / count
}
