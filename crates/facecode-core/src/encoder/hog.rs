//! Histogram-of-oriented-gradients encoder.
//!
//! A model-free substitute for the embedding network: the face crop is
//! resized to 64×64 luminance and described by 8×8-pixel cells with 9
//! unsigned orientation bins, grouped into 16×16 blocks at an 8-pixel stride
//! and L2-Hys normalized. The 1764-value descriptor is cut (or zero-padded)
//! to the configured dimension.

use super::{EncoderError, FeatureEncoder};
use crate::normalize::{reflect_101, CanonicalImage};
use crate::types::FaceRegion;
use image::imageops::FilterType;
use image::GrayImage;
use std::f32::consts::PI;

const WINDOW: usize = 64;
const CELL: usize = 8;
const BLOCK_CELLS: usize = 2;
const BINS: usize = 9;
const CELLS_PER_SIDE: usize = WINDOW / CELL;
const BLOCKS_PER_SIDE: usize = CELLS_PER_SIDE - BLOCK_CELLS + 1;
const L2_HYS_CLIP: f32 = 0.2;

/// Full descriptor length: 7×7 blocks of 2×2 cells of 9 bins.
pub const DESCRIPTOR_LEN: usize = BLOCKS_PER_SIDE * BLOCKS_PER_SIDE * BLOCK_CELLS * BLOCK_CELLS * BINS;

pub struct HogEncoder {
    dimension: usize,
}

impl HogEncoder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl FeatureEncoder for HogEncoder {
    fn name(&self) -> &'static str {
        "hog"
    }

    fn encode(&self, image: &CanonicalImage, region: &FaceRegion) -> Result<Vec<f32>, EncoderError> {
        let face = image.crop_luma(region).ok_or(EncoderError::InvalidRegion(*region))?;
        let window = image::imageops::resize(&face, WINDOW as u32, WINDOW as u32, FilterType::Triangle);

        let mut descriptor = hog_descriptor(&window);
        descriptor.resize(self.dimension, 0.0);
        Ok(descriptor)
    }
}

/// Describe a 64×64 luminance window. Larger inputs are read from the top-left corner.
pub fn hog_descriptor(window: &GrayImage) -> Vec<f32> {
    let cells = cell_histograms(window);
    let mut descriptor = Vec::with_capacity(DESCRIPTOR_LEN);

    for bx in 0..BLOCKS_PER_SIDE {
        for by in 0..BLOCKS_PER_SIDE {
            let mut block = Vec::with_capacity(BLOCK_CELLS * BLOCK_CELLS * BINS);
            for cx in bx..bx + BLOCK_CELLS {
                for cy in by..by + BLOCK_CELLS {
                    block.extend_from_slice(&cells[cy][cx]);
                }
            }
            l2_hys(&mut block);
            descriptor.extend(block);
        }
    }
    descriptor
}

/// Per-cell orientation histograms with linear interpolation between adjacent bins.
fn cell_histograms(window: &GrayImage) -> Vec<Vec<[f32; BINS]>> {
    let (w, h) = (window.width() as usize, window.height() as usize);
    let pixel = |x: usize, y: usize| window.get_pixel(x as u32, y as u32)[0] as f32;
    let mut cells = vec![vec![[0f32; BINS]; CELLS_PER_SIDE]; CELLS_PER_SIDE];
    let bin_width = PI / BINS as f32;

    for y in 0..WINDOW.min(h) {
        for x in 0..WINDOW.min(w) {
            let dx = pixel(reflect_101(x as isize + 1, w), y) - pixel(reflect_101(x as isize - 1, w), y);
            let dy = pixel(x, reflect_101(y as isize + 1, h)) - pixel(x, reflect_101(y as isize - 1, h));
            let magnitude = (dx * dx + dy * dy).sqrt();
            if magnitude == 0.0 {
                continue;
            }

            let angle = dy.atan2(dx).rem_euclid(PI);
            let position = angle / bin_width - 0.5;
            let lower = position.floor();
            let frac = position - lower;
            let lo = (lower as isize).rem_euclid(BINS as isize) as usize;
            let hi = (lo + 1) % BINS;

            let hist = &mut cells[y / CELL][x / CELL];
            hist[lo] += magnitude * (1.0 - frac);
            hist[hi] += magnitude * frac;
        }
    }
    cells
}

fn l2_hys(block: &mut [f32]) {
    let norm = block.iter().map(|v| v * v).sum::<f32>().sqrt();
    let scale = 1.0 / (norm + block.len() as f32 * 0.1);
    for v in block.iter_mut() {
        *v = (*v * scale).min(L2_HYS_CLIP);
    }
    let norm = block.iter().map(|v| v * v).sum::<f32>().sqrt();
    let scale = 1.0 / (norm + 1e-3);
    for v in block.iter_mut() {
        *v *= scale;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::finalize;
    use image::{Luma, Rgb, RgbImage};

    fn face() -> FaceRegion {
        FaceRegion::new(10, 90, 90, 10).unwrap()
    }

    #[test]
    fn test_descriptor_len() {
        assert_eq!(DESCRIPTOR_LEN, 1764);
        let window = GrayImage::from_fn(64, 64, |x, y| Luma([((x * 7 + y * 3) % 256) as u8]));
        assert_eq!(hog_descriptor(&window).len(), DESCRIPTOR_LEN);
    }

    #[test]
    fn test_uniform_window_is_zero() {
        let window = GrayImage::from_pixel(64, 64, Luma([90]));
        assert!(hog_descriptor(&window).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_vertical_edge_uses_horizontal_bins() {
        // Horizontal gradient only: angle 0 splits between the first and last bin.
        let window = GrayImage::from_fn(64, 64, |x, _| Luma([if x < 28 { 20 } else { 220 }]));
        let descriptor = hog_descriptor(&window);
        assert!(descriptor.iter().any(|&v| v > 0.0));
        for hist in descriptor.chunks(BINS) {
            assert!(hist[1..BINS - 1].iter().all(|&v| v == 0.0), "{hist:?}");
        }
    }

    #[test]
    fn test_block_values_bounded() {
        let window = GrayImage::from_fn(64, 64, |x, y| Luma([((x * x + y * 5) % 256) as u8]));
        for block in hog_descriptor(&window).chunks(BLOCK_CELLS * BLOCK_CELLS * BINS) {
            let norm = block.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!(norm <= 1.0 + 1e-4);
            assert!(block.iter().all(|&v| (0.0..=1.0).contains(&v)));
        }
    }

    #[test]
    fn test_encode_truncates_to_dimension() {
        let image = CanonicalImage::from_rgb(RgbImage::from_fn(100, 100, |x, y| {
            Rgb([(x * 2) as u8, (y * 2) as u8, ((x + y) % 256) as u8])
        }));
        let encoder = HogEncoder::new(128);
        let raw = encoder.encode(&image, &face()).unwrap();
        assert_eq!(raw.len(), 128);

        let v = finalize(raw, 128).unwrap();
        assert!((v.norm() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_encode_pads_large_dimension() {
        let image = CanonicalImage::from_rgb(RgbImage::from_fn(100, 100, |x, _| Rgb([(x * 2) as u8; 3])));
        let raw = HogEncoder::new(2000).encode(&image, &face()).unwrap();
        assert_eq!(raw.len(), 2000);
        assert!(raw[DESCRIPTOR_LEN..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_encode_is_deterministic() {
        let image = CanonicalImage::from_rgb(RgbImage::from_fn(100, 100, |x, y| {
            Rgb([((x * y) % 256) as u8, 40, 90])
        }));
        let encoder = HogEncoder::new(128);
        assert_eq!(
            encoder.encode(&image, &face()).unwrap(),
            encoder.encode(&image, &face()).unwrap()
        );
    }

    #[test]
    fn test_encode_rejects_region_outside_image() {
        let image = CanonicalImage::from_rgb(RgbImage::new(50, 50));
        let err = HogEncoder::new(128).encode(&image, &face()).unwrap_err();
        assert!(matches!(err, EncoderError::InvalidRegion(_)));
    }
}
