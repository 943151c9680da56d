//! facelatch-hw — V4L2 capture and grayscale descriptor extraction.
//!
//! Supplies the frame source and descriptor extractor that the core decision
//! engine and training pipeline run against.

pub mod camera;
pub mod extractor;
pub mod frame;

pub use camera::{Camera, CameraError, CameraStream, PixelFormat};
pub use extractor::GrayscaleExtractor;
pub use frame::{Frame, FrameError};
