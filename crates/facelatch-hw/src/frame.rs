//! Grayscale frames and the pixel work done on them: format conversion,
//! dark detection, cropping and histogram equalization.

use image::imageops::{self, FilterType};
use image::GrayImage;

/// A captured 8-bit grayscale frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Row-major pixels, `width * height` bytes.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        let expected = (width as usize) * (height as usize);
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            sequence: 0,
        })
    }

    pub fn from_image(img: GrayImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            data: img.into_raw(),
            width,
            height,
            sequence: 0,
        }
    }

    fn to_image(&self) -> Result<GrayImage, FrameError> {
        GrayImage::from_raw(self.width, self.height, self.data.clone()).ok_or(
            FrameError::InvalidLength {
                expected: (self.width as usize) * (self.height as usize),
                actual: self.data.len(),
            },
        )
    }
}

/// Y channel of packed YUYV 4:2:2 (`[Y0, U, Y1, V]` per pixel pair).
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// High byte of 16-bit little-endian grayscale.
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if y16.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: y16.len(),
        });
    }
    Ok(y16[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

/// True when more than `threshold` of the pixels are near-black (< 32).
pub fn is_dark_frame(gray: &[u8], threshold: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < 32).count();
    (dark as f32 / gray.len() as f32) > threshold
}

/// Largest centred square, resized to `size × size`.
pub fn center_square(frame: &Frame, size: u32) -> Result<GrayImage, FrameError> {
    let side = frame.width.min(frame.height);
    if side == 0 || size == 0 {
        return Err(FrameError::Empty);
    }
    let img = frame.to_image()?;
    let x = (frame.width - side) / 2;
    let y = (frame.height - side) / 2;
    let square = imageops::crop_imm(&img, x, y, side, side).to_image();
    if side == size {
        return Ok(square);
    }
    Ok(imageops::resize(&square, size, size, FilterType::Triangle))
}

/// Global histogram equalization in place.
///
/// Stretches the cumulative distribution over 0–255. A single-valued image
/// is left untouched.
pub fn equalize_histogram(gray: &mut [u8]) {
    if gray.is_empty() {
        return;
    }
    let mut hist = [0u32; 256];
    for &p in gray.iter() {
        hist[p as usize] += 1;
    }

    let mut cdf = [0u32; 256];
    let mut acc = 0u32;
    for (slot, &count) in cdf.iter_mut().zip(hist.iter()) {
        acc += count;
        *slot = acc;
    }

    let total = gray.len() as u32;
    let cdf_min = cdf.iter().copied().find(|&v| v > 0).unwrap_or(0);
    let denom = total - cdf_min;
    if denom == 0 {
        return;
    }

    let mut lut = [0u8; 256];
    for (value, slot) in lut.iter_mut().enumerate() {
        let scaled = (cdf[value].saturating_sub(cdf_min)) as f32 / denom as f32 * 255.0;
        *slot = scaled.round().clamp(0.0, 255.0) as u8;
    }
    for p in gray.iter_mut() {
        *p = lut[*p as usize];
    }
}

/// Population standard deviation of pixel values.
pub fn contrast(gray: &[u8]) -> f32 {
    if gray.is_empty() {
        return 0.0;
    }
    let n = gray.len() as f32;
    let mean = gray.iter().map(|&b| b as f32).sum::<f32>() / n;
    let variance = gray.iter().map(|&b| (b as f32 - mean).powi(2)).sum::<f32>() / n;
    variance.sqrt()
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("empty frame")]
    Empty,
}
