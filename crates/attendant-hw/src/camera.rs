//! V4L2 camera backend via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::stream::{CameraBackend, CameraConstraints, DeviceError, VideoTrack};
use std::path::Path;
use std::sync::{Arc, Mutex};
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

/// Opens V4L2 capture devices.
pub struct V4lBackend {
    /// Frames discarded right after opening while auto-exposure settles.
    pub warmup_frames: usize,
}

impl V4lBackend {
    pub fn new(warmup_frames: usize) -> Self {
        Self { warmup_frames }
    }
}

impl CameraBackend for V4lBackend {
    fn open(&self, constraints: &CameraConstraints) -> Result<Vec<Arc<dyn VideoTrack>>, DeviceError> {
        let track = V4lTrack::open(constraints)?;
        for _ in 0..self.warmup_frames {
            let _ = track.read_frame();
        }
        Ok(vec![Arc::new(track)])
    }
}

/// A single V4L2 capture device. Stopping it closes the device.
pub struct V4lTrack {
    label: String,
    device: Mutex<Option<Device>>,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl V4lTrack {
    fn open(constraints: &CameraConstraints) -> Result<Self, DeviceError> {
        let path = constraints.device.as_str();
        if !Path::new(path).exists() {
            return Err(DeviceError::DeviceNotFound(path.to_string()));
        }

        let device = Device::with_path(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                DeviceError::PermissionDenied(path.to_string())
            } else if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                DeviceError::DeviceBusy
            } else {
                DeviceError::DeviceNotFound(format!("{path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| DeviceError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(DeviceError::StreamingNotSupported);
        }

        let mut fmt = device
            .format()
            .map_err(|e| DeviceError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = constraints.width;
        fmt.height = constraints.height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| DeviceError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"Y16 ") {
            PixelFormat::Y16
        } else {
            return Err(DeviceError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            )));
        };

        tracing::info!(
            device = path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "camera opened"
        );

        Ok(Self {
            label: format!("{} ({path})", caps.card),
            device: Mutex::new(Some(device)),
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }

    fn to_grayscale(&self, buf: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let converted = match self.pixel_format {
            PixelFormat::Grey => {
                let pixels = (self.width * self.height) as usize;
                if buf.len() < pixels {
                    return Err(DeviceError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                Ok(buf[..pixels].to_vec())
            }
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, self.width, self.height),
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height),
        };
        converted.map_err(|e| DeviceError::CaptureFailed(format!("{:?} conversion failed: {e}", self.pixel_format)))
    }
}

impl VideoTrack for V4lTrack {
    fn label(&self) -> &str {
        &self.label
    }

    fn read_frame(&self) -> Result<Frame, DeviceError> {
        let guard = self.device.lock().unwrap_or_else(|e| e.into_inner());
        let device = guard.as_ref().ok_or(DeviceError::Released)?;

        let mut stream = MmapStream::with_buffers(device, BufType::VideoCapture, 4)
            .map_err(|e| DeviceError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| DeviceError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let gray = self.to_grayscale(buf)?;
        Ok(Frame::from_gray(gray, self.width, self.height, meta.sequence))
    }

    fn stop(&self) {
        // Dropping the device closes the fd and turns the camera off.
        let device = self.device.lock().unwrap_or_else(|e| e.into_inner()).take();
        if device.is_some() {
            tracing::debug!(track = %self.label, "V4L2 device closed");
        }
    }
}
