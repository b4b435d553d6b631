//! Landmark-based face alignment.
//!
//! Fits a similarity transform (uniform scale, rotation, translation) that
//! carries the five detected landmarks onto the ArcFace reference layout,
//! then resamples the face into a square crop with bilinear interpolation.

use crate::types::Landmarks;
use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 crop.
pub const REFERENCE_LANDMARKS_112: Landmarks = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

const REFERENCE_SIZE: f32 = 112.0;

/// The matrix `| a -b tx |  | b a ty |`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` onto `dst`.
    ///
    /// Returns `None` when the source points coincide.
    pub fn estimate(src: &Landmarks, dst: &Landmarks) -> Option<Self> {
        let (msx, msy) = centroid(src);
        let (mdx, mdy) = centroid(dst);

        let (mut dot, mut cross, mut spread) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
            let (sx, sy) = (sx - msx, sy - msy);
            let (dx, dy) = (dx - mdx, dy - mdy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            spread += sx * sx + sy * sy;
        }
        if spread < 1e-6 {
            return None;
        }

        let (a, b) = (dot / spread, cross / spread);
        if a * a + b * b < 1e-12 {
            return None;
        }
        Some(Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Source point that [`apply`](Self::apply) sends to `(x, y)`.
    pub fn invert(&self, (x, y): (f32, f32)) -> (f32, f32) {
        let det = self.a * self.a + self.b * self.b;
        let (u, v) = (x - self.tx, y - self.ty);
        ((self.a * u + self.b * v) / det, (self.a * v - self.b * u) / det)
    }

    pub fn scale(&self) -> f32 {
        (self.a * self.a + self.b * self.b).sqrt()
    }
}

fn centroid(points: &Landmarks) -> (f32, f32) {
    let n = points.len() as f32;
    let (sx, sy) = points
        .iter()
        .fold((0.0f32, 0.0f32), |(ax, ay), &(x, y)| (ax + x, ay + y));
    (sx / n, sy / n)
}

/// Warp `image` so `landmarks` land on the reference layout scaled to `size`².
///
/// Output pixels that map outside the source are black. `None` for degenerate
/// landmarks.
pub fn align_face(image: &RgbImage, landmarks: &Landmarks, size: u32) -> Option<RgbImage> {
    let k = size as f32 / REFERENCE_SIZE;
    let reference = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * k, y * k));
    let transform = Similarity::estimate(landmarks, &reference)?;
    Some(warp(image, &transform, size))
}

fn warp(image: &RgbImage, transform: &Similarity, size: u32) -> RgbImage {
    let (width, height) = (image.width() as i64, image.height() as i64);
    let sample = |x: i64, y: i64| -> [f32; 3] {
        if (0..width).contains(&x) && (0..height).contains(&y) {
            image.get_pixel(x as u32, y as u32).0.map(f32::from)
        } else {
            [0.0; 3]
        }
    };

    RgbImage::from_fn(size, size, |ox, oy| {
        let (sx, sy) = transform.invert((ox as f32, oy as f32));
        let (x0, y0) = (sx.floor(), sy.floor());
        let (fx, fy) = (sx - x0, sy - y0);
        let (x0, y0) = (x0 as i64, y0 as i64);

        let taps = [
            (x0, y0, (1.0 - fx) * (1.0 - fy)),
            (x0 + 1, y0, fx * (1.0 - fy)),
            (x0, y0 + 1, (1.0 - fx) * fy),
            (x0 + 1, y0 + 1, fx * fy),
        ];
        let mut acc = [0.0f32; 3];
        for (x, y, weight) in taps {
            let px = sample(x, y);
            for c in 0..3 {
                acc[c] += px[c] * weight;
            }
        }
        Rgb(acc.map(|v| v.round().clamp(0.0, 255.0) as u8))
    })
}
