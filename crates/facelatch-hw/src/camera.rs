//! V4L2 capture via the `v4l` crate.

use crate::frame::{self, Frame};
use facelatch_core::{AuthError, FrameSource};
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 360;
const STREAM_BUFFERS: u32 = 4;
/// Shortest dequeue wait, so a zero frame interval does not spin.
const MIN_POLL: Duration = Duration::from_millis(1);

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("device cannot capture video")]
    StreamingNotSupported,
}

impl From<CameraError> for AuthError {
    fn from(e: CameraError) -> Self {
        AuthError::Resource(e.to_string())
    }
}

/// Negotiated pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed; the Y channel is kept.
    Yuyv,
    /// 8-bit grayscale, typical of IR sensors.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"GREY") {
            Some(PixelFormat::Grey)
        } else if fourcc == FourCC::new(b"YUYV") {
            Some(PixelFormat::Yuyv)
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            Some(PixelFormat::Y16)
        } else {
            None
        }
    }

    fn to_grayscale(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CameraError> {
        let converted = match self {
            PixelFormat::Grey => {
                let pixels = (width * height) as usize;
                if buf.len() < pixels {
                    return Err(CameraError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                Ok(buf[..pixels].to_vec())
            }
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, width, height),
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, width, height),
        };
        converted.map_err(|e| CameraError::CaptureFailed(format!("{self:?} conversion: {e}")))
    }
}

/// An opened V4L2 capture device.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a device (e.g. "/dev/video2") and negotiate a grayscale-capable
    /// format, asking for YUYV and accepting GREY or Y16.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            let msg = e.to_string();
            if msg.contains("busy") || msg.contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {msg}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = CAPTURE_WIDTH;
        fmt.height = CAPTURE_HEIGHT;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("set format: {e}")))?;
        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format {:?} (need YUYV, GREY or Y16)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "camera opened"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc: negotiated.fourcc,
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Start streaming.
    ///
    /// Each dequeue waits at most `poll_timeout`; a sensor that delivers
    /// nothing in that time yields "no frame" instead of blocking. Frames
    /// darker than `dark_threshold` (fraction of near-black pixels) and
    /// buffers that cannot be converted are also reported as "no frame".
    pub fn stream(
        &self,
        dark_threshold: f32,
        poll_timeout: Duration,
    ) -> Result<CameraStream<'_>, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| CameraError::CaptureFailed(format!("create mmap stream: {e}")))?;
        stream.set_timeout(poll_timeout.max(MIN_POLL));
        Ok(CameraStream {
            camera: self,
            stream,
            dark_threshold,
            dark_frames: 0,
            skipped_frames: 0,
        })
    }
}

/// A live capture stream; the frame source handed to the decision engine.
pub struct CameraStream<'a> {
    camera: &'a Camera,
    stream: MmapStream<'a>,
    dark_threshold: f32,
    dark_frames: u64,
    skipped_frames: u64,
}

/// What one dequeued buffer turned out to hold.
#[derive(Debug)]
enum Captured {
    Frame(Frame),
    Dark,
    Invalid(CameraError),
}

impl Captured {
    fn from_buffer(
        format: PixelFormat,
        buf: &[u8],
        (width, height): (u32, u32),
        sequence: u32,
        dark_threshold: f32,
    ) -> Self {
        let gray = match format.to_grayscale(buf, width, height) {
            Ok(gray) => gray,
            Err(e) => return Captured::Invalid(e),
        };
        if frame::is_dark_frame(&gray, dark_threshold) {
            return Captured::Dark;
        }
        Captured::Frame(Frame {
            data: gray,
            width,
            height,
            sequence,
        })
    }
}

/// `None` when the dequeue only timed out and may be retried.
fn dequeue_failure(e: io::Error) -> Option<CameraError> {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => None,
        _ => Some(CameraError::CaptureFailed(format!("dequeue buffer: {e}"))),
    }
}

impl CameraStream<'_> {
    /// Frames dropped as too dark so far.
    pub fn dark_frames(&self) -> u64 {
        self.dark_frames
    }

    /// Buffers dropped because they timed out or could not be converted.
    pub fn skipped_frames(&self) -> u64 {
        self.skipped_frames
    }

    fn capture(&mut self) -> Result<Option<Frame>, CameraError> {
        let (buf, meta) = match self.stream.next() {
            Ok(next) => next,
            Err(e) => {
                return match dequeue_failure(e) {
                    Some(err) => Err(err),
                    None => {
                        self.skipped_frames += 1;
                        tracing::trace!("dequeue timed out");
                        Ok(None)
                    }
                };
            }
        };
        let sequence = meta.sequence;
        let size = (self.camera.width, self.camera.height);

        match Captured::from_buffer(
            self.camera.pixel_format,
            buf,
            size,
            sequence,
            self.dark_threshold,
        ) {
            Captured::Frame(frame) => Ok(Some(frame)),
            Captured::Dark => {
                self.dark_frames += 1;
                tracing::debug!(seq = sequence, dark_frames = self.dark_frames, "dark frame");
                Ok(None)
            }
            Captured::Invalid(e) => {
                self.skipped_frames += 1;
                tracing::debug!(seq = sequence, error = %e, "unusable buffer");
                Ok(None)
            }
        }
    }
}

impl FrameSource for CameraStream<'_> {
    type Frame = Frame;

    fn next_frame(&mut self) -> facelatch_core::Result<Option<Frame>> {
        Ok(self.capture()?)
    }
}
