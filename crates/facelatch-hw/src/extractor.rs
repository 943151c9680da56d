//! Frame → descriptor for the classic recognizers.

use crate::frame::{self, Frame};
use facelatch_core::{AuthConfig, AuthError, Descriptor, DescriptorExtractor, Result};
use std::path::Path;

/// Standard deviation below which an equalized crop is considered featureless.
const MIN_CONTRAST: f32 = 8.0;

/// Centre-square grayscale crop, resized and histogram-equalized.
///
/// There is no face detector in this path: the camera is expected to frame
/// the user's face, as IR login cameras do.
#[derive(Debug, Clone, Copy)]
pub struct GrayscaleExtractor {
    size: u32,
    min_contrast: f32,
}

impl GrayscaleExtractor {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            min_contrast: MIN_CONTRAST,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.descriptor_size)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Decode an image file and extract a descriptor from it.
    pub fn extract_path(&self, path: &Path) -> Result<Descriptor> {
        let img = image::open(path)
            .map_err(|e| AuthError::Extraction(format!("{}: {e}", path.display())))?;
        self.descriptor(&Frame::from_image(img.to_luma8()))
    }

    fn descriptor(&self, frame: &Frame) -> Result<Descriptor> {
        let square = frame::center_square(frame, self.size)
            .map_err(|e| AuthError::Extraction(e.to_string()))?;
        let mut data = square.into_raw();
        frame::equalize_histogram(&mut data);

        let contrast = frame::contrast(&data);
        if contrast < self.min_contrast {
            return Err(AuthError::Extraction(format!(
                "crop too flat (contrast {contrast:.1} < {})",
                self.min_contrast
            )));
        }
        Ok(Descriptor::image(data, self.size, self.size))
    }
}

impl DescriptorExtractor for GrayscaleExtractor {
    type Frame = Frame;

    fn extract(&mut self, frame: &Frame) -> Result<Descriptor> {
        self.descriptor(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Frame {
        let data = (0..width * height)
            .map(|i| ((i % width) * 255 / width) as u8)
            .collect();
        Frame::new(data, width, height).unwrap()
    }

    #[test]
    fn test_extracts_square_descriptor() {
        let mut ex = GrayscaleExtractor::new(32);
        let descriptor = ex.extract(&gradient(80, 60)).unwrap();
        match descriptor {
            Descriptor::Image { data, width, height } => {
                assert_eq!((width, height), (32, 32));
                assert_eq!(data.len(), 32 * 32);
            }
            other => panic!("unexpected descriptor {other:?}"),
        }
    }

    #[test]
    fn test_flat_frame_is_recoverable_failure() {
        let mut ex = GrayscaleExtractor::new(16);
        let flat = Frame::new(vec![120; 40 * 40], 40, 40).unwrap();
        let err = ex.extract(&flat).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_reads_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.png");
        let img = image::GrayImage::from_fn(50, 40, |x, y| image::Luma([((x * 5 + y * 3) % 256) as u8]));
        img.save(&path).unwrap();

        let ex = GrayscaleExtractor::new(24);
        let descriptor = ex.extract_path(&path).unwrap();
        assert!(matches!(descriptor, Descriptor::Image { width: 24, height: 24, .. }));
    }

    #[test]
    fn test_unreadable_file_is_extraction_error() {
        let ex = GrayscaleExtractor::new(24);
        let err = ex.extract_path(Path::new("/nonexistent/face.png")).unwrap_err();
        assert!(matches!(err, AuthError::Extraction(_)));
    }
}
