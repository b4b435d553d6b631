//! Image normalizer.
//!
//! Decodes raw bytes (or takes already-decoded pixel arrays) into the
//! canonical RGB8, row-major representation every detector expects, and
//! upsamples images whose smaller side is below the configured floor.

use crate::types::FaceRegion;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat, ImageReader, Limits, RgbImage};
use ndarray::ArrayView3;
use std::io::Cursor;
use thiserror::Error;

/// Minimum width/height of a canonical image unless configured otherwise.
pub const DEFAULT_MIN_DIMENSION: u32 = 80;
/// Largest accepted width or height, before and after upscaling.
pub const DEFAULT_MAX_DIMENSION: u32 = 8192;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("image buffer is empty")]
    Empty,
    #[error("image data is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("{0}")]
    Decode(String),
    #[error("unsupported pixel array: {0}")]
    UnsupportedArray(String),
    #[error("image {width}x{height} exceeds the {max_width}x{max_height} limit")]
    TooLarge {
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
    },
}

/// Undecoded image bytes plus an optional declared format.
#[derive(Debug, Clone)]
pub struct RawImage {
    bytes: Vec<u8>,
    format: Option<ImageFormat>,
}

impl RawImage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, format: None }
    }

    pub fn with_format(bytes: Vec<u8>, format: ImageFormat) -> Self {
        Self {
            bytes,
            format: Some(format),
        }
    }

    /// Decode a base64 payload, accepting an optional `data:<mime>;base64,` prefix.
    pub fn from_base64(data: &str) -> Result<Self, NormalizeError> {
        let data = data.trim();
        let payload = match data.split_once(";base64,") {
            Some((prefix, rest)) if prefix.starts_with("data:") => rest,
            _ => data,
        };
        Ok(Self::new(STANDARD.decode(payload)?))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn format(&self) -> Option<ImageFormat> {
        self.format
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Decoded RGB8 pixel grid, contiguous and row-major.
#[derive(Debug, Clone)]
pub struct CanonicalImage {
    pixels: RgbImage,
}

impl CanonicalImage {
    /// Wrap an RGB8 buffer as-is (no minimum-size enforcement).
    pub fn from_rgb(pixels: RgbImage) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.pixels
    }

    /// Single-channel luminance of the whole image.
    pub fn to_luma(&self) -> GrayImage {
        image::imageops::grayscale(&self.pixels)
    }

    /// Copy out the RGB pixels of `region`, or `None` if it does not fit.
    pub fn crop(&self, region: &FaceRegion) -> Option<RgbImage> {
        if !region.fits(self.width(), self.height()) {
            return None;
        }
        Some(
            image::imageops::crop_imm(
                &self.pixels,
                region.left,
                region.top,
                region.width(),
                region.height(),
            )
            .to_image(),
        )
    }

    /// Luminance of `region`, or `None` if it does not fit.
    pub fn crop_luma(&self, region: &FaceRegion) -> Option<GrayImage> {
        self.crop(region).map(|rgb| image::imageops::grayscale(&rgb))
    }
}

/// Turns raw input into a [`CanonicalImage`].
#[derive(Debug, Clone)]
pub struct Normalizer {
    min_dimension: u32,
    max_width: u32,
    max_height: u32,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_DIMENSION)
    }
}

impl Normalizer {
    pub fn new(min_dimension: u32) -> Self {
        Self {
            min_dimension,
            max_width: DEFAULT_MAX_DIMENSION,
            max_height: DEFAULT_MAX_DIMENSION,
        }
    }

    /// Reject images wider or taller than this, checked from the header
    /// before any pixel buffer is allocated.
    pub fn with_max_dimensions(mut self, max_width: u32, max_height: u32) -> Self {
        self.max_width = max_width;
        self.max_height = max_height;
        self
    }

    pub fn min_dimension(&self) -> u32 {
        self.min_dimension
    }

    /// Decode and normalize raw image bytes.
    pub fn normalize(&self, raw: &RawImage) -> Result<CanonicalImage, NormalizeError> {
        let decoded = self.decode(raw)?;
        self.normalize_decoded(decoded)
    }

    /// Normalize an already-decoded image of any color type or bit depth.
    ///
    /// Grayscale and alpha sources become RGB; 16-bit and float samples are
    /// rescaled to 8 bits.
    pub fn normalize_decoded(&self, decoded: DynamicImage) -> Result<CanonicalImage, NormalizeError> {
        self.check_size(decoded.width(), decoded.height())?;
        let rgb = match decoded {
            DynamicImage::ImageRgb8(rgb) => rgb,
            other => {
                tracing::debug!(color = ?other.color(), "converting to RGB8");
                other.to_rgb8()
            }
        };
        self.enforce_min_dimension(rgb)
    }

    /// Normalize a `(height, width, channels)` u8 array with arbitrary strides.
    ///
    /// Accepts 1 (gray), 3 (RGB) or 4 (RGBA, alpha dropped) channels.
    /// Non-standard layouts are copied into a contiguous buffer.
    pub fn normalize_array(&self, pixels: ArrayView3<u8>) -> Result<CanonicalImage, NormalizeError> {
        let (height, width, channels) = pixels.dim();
        if height == 0 || width == 0 {
            return Err(NormalizeError::Empty);
        }
        self.check_size(width as u32, height as u32)?;
        if !matches!(channels, 1 | 3 | 4) {
            return Err(NormalizeError::UnsupportedArray(format!(
                "expected 1, 3 or 4 channels, got {channels}"
            )));
        }

        let mut data = Vec::with_capacity(height * width * 3);
        if channels == 3 && pixels.is_standard_layout() {
            data.extend_from_slice(pixels.as_slice().unwrap_or_default());
        } else {
            tracing::debug!(channels, contiguous = pixels.is_standard_layout(), "copying pixel array");
            for row in pixels.outer_iter() {
                for px in row.outer_iter() {
                    match channels {
                        1 => data.extend_from_slice(&[px[0], px[0], px[0]]),
                        _ => data.extend_from_slice(&[px[0], px[1], px[2]]),
                    }
                }
            }
        }

        let rgb = RgbImage::from_raw(width as u32, height as u32, data).ok_or_else(|| {
            NormalizeError::UnsupportedArray("pixel buffer size mismatch".to_string())
        })?;
        self.enforce_min_dimension(rgb)
    }

    /// Upscale so both sides reach the floor, keeping the aspect ratio.
    fn enforce_min_dimension(&self, rgb: RgbImage) -> Result<CanonicalImage, NormalizeError> {
        let (width, height) = rgb.dimensions();
        match upscaled_dimensions(width, height, self.min_dimension) {
            Some((new_w, new_h)) => {
                // Extreme aspect ratios can blow up past the limit here.
                self.check_size(new_w, new_h)?;
                tracing::debug!(width, height, new_w, new_h, "upscaling small image");
                Ok(CanonicalImage::from_rgb(image::imageops::resize(
                    &rgb,
                    new_w,
                    new_h,
                    FilterType::Triangle,
                )))
            }
            None => Ok(CanonicalImage::from_rgb(rgb)),
        }
    }

    fn check_size(&self, width: u32, height: u32) -> Result<(), NormalizeError> {
        if width > self.max_width || height > self.max_height {
            return Err(NormalizeError::TooLarge {
                width,
                height,
                max_width: self.max_width,
                max_height: self.max_height,
            });
        }
        Ok(())
    }

    /// Decode bytes, trying the declared or sniffed format first and the
    /// general-purpose reader second. Both paths read the header and check
    /// the dimensions before decoding pixels.
    fn decode(&self, raw: &RawImage) -> Result<DynamicImage, NormalizeError> {
        if raw.is_empty() {
            return Err(NormalizeError::Empty);
        }
        let bytes = raw.bytes();

        let fast_err = match raw.format().or_else(|| image::guess_format(bytes).ok()) {
            Some(format) => match self.decode_as(bytes, format) {
                Ok(img) => return Ok(img),
                Err(e) => format!("{format:?} decode: {e}"),
            },
            None => "format not recognized".to_string(),
        };
        tracing::debug!(error = %fast_err, "fast decode failed, trying general reader");

        let general = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| e.to_string())
            .and_then(|reader| reader.format().ok_or_else(|| "format not recognized".to_string()))
            .and_then(|format| self.decode_as(bytes, format));

        general.map_err(|general_err| {
            NormalizeError::Decode(format!("{fast_err}; general reader: {general_err}"))
        })
    }

    /// Decode `bytes` as `format` under the size limit and the decoder's
    /// default allocation cap.
    fn decode_as(&self, bytes: &[u8], format: ImageFormat) -> Result<DynamicImage, String> {
        let (width, height) = ImageReader::with_format(Cursor::new(bytes), format)
            .into_dimensions()
            .map_err(|e| e.to_string())?;
        self.check_size(width, height).map_err(|e| e.to_string())?;

        let mut reader = ImageReader::with_format(Cursor::new(bytes), format);
        reader.limits(Limits::default());
        reader.decode().map_err(|e| e.to_string())
    }
}

/// Target size for an image below `floor`, or `None` if no upscale is needed.
///
/// Scales by the larger of the two required ratios so both sides reach the floor.
fn upscaled_dimensions(width: u32, height: u32, floor: u32) -> Option<(u32, u32)> {
    if width == 0 || height == 0 || (width >= floor && height >= floor) {
        return None;
    }
    let scale = (floor as f64 / width as f64).max(floor as f64 / height as f64);
    let new_w = ((width as f64 * scale).round() as u32).max(floor);
    let new_h = ((height as f64 * scale).round() as u32).max(floor);
    Some((new_w, new_h))
}

/// Reflect-101 border index: `-1 -> 1`, `len -> len - 2`.
pub(crate) fn reflect_101(i: isize, len: usize) -> usize {
    let len = len as isize;
    if len <= 1 {
        return 0;
    }
    let i = i.abs();
    let i = if i >= len { 2 * len - 2 - i } else { i };
    i.clamp(0, len - 1) as usize
}
