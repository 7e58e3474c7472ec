//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Clahe, Frame, FrameError};
use std::path::Path;
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

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
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel formats the capture path can turn into luma.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, the usual webcam default.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }

    pub fn to_luma(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_luma(buf, width, height),
            Self::Grey => frame::grey_luma(buf, width, height),
            Self::Y16 => frame::y16_luma(buf, width, height),
        }
    }
}

/// Frames kept by [`Camera::capture_frames`] plus how many were thrown away as dark.
#[derive(Debug)]
pub struct CaptureBatch {
    pub frames: Vec<Frame>,
    pub dark: usize,
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
    timeout: Option<Duration>,
}

impl Camera {
    /// Open `device_path` and ask for `width`×`height` YUYV. The driver may
    /// settle on another size or on GREY/Y16; whatever it picks is used.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            let msg = e.to_string();
            if msg.contains("busy") || msg.contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }
        tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;
        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format {:?} (need YUYV, GREY or Y16)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
            timeout: None,
        })
    }

    /// Bound every frame wait. A stalled device then yields
    /// [`CameraError::Timeout`] instead of blocking forever.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Start streaming. Frames are pulled one at a time with [`FrameStream::next_frame`].
    pub fn stream(&self) -> Result<FrameStream<'_>, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        if let Some(timeout) = self.timeout {
            stream.set_timeout(timeout);
        }
        Ok(FrameStream { camera: self, stream })
    }

    /// Capture a single frame.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        self.stream()?.next_frame()
    }

    /// Collect up to `count` non-dark frames out of at most `count * 3` captures,
    /// after discarding `warmup` frames while exposure settles.
    pub fn capture_frames(
        &self,
        count: usize,
        warmup: usize,
        enhance: Option<&Clahe>,
    ) -> Result<CaptureBatch, CameraError> {
        let mut stream = self.stream()?;
        for _ in 0..warmup {
            stream.next_frame()?;
        }

        let mut frames = Vec::with_capacity(count);
        let mut dark = 0usize;
        for _ in 0..count * 3 {
            if frames.len() >= count {
                break;
            }
            let mut frame = stream.next_frame()?;
            if frame.is_dark(0.95) {
                dark += 1;
                tracing::debug!(seq = frame.sequence, "skipping dark frame");
                continue;
            }
            if let Some(clahe) = enhance {
                clahe.apply(&mut frame.data, frame.width, frame.height);
            }
            frames.push(frame);
        }

        Ok(CaptureBatch { frames, dark })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .filter_map(|i| {
                let path = format!("/dev/video{i}");
                if !Path::new(&path).exists() {
                    return None;
                }
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                    return None;
                }
                Some(DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

/// Live capture stream borrowed from a [`Camera`].
pub struct FrameStream<'a> {
    camera: &'a Camera,
    stream: MmapStream<'a>,
}

impl FrameStream<'_> {
    pub fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let cam = self.camera;
        let (buf, meta) = self.stream.next().map_err(|e| dequeue_error(e, cam.timeout))?;
        let data = cam.pixel_format.to_luma(buf, cam.width, cam.height)?;
        Ok(Frame {
            data,
            width: cam.width,
            height: cam.height,
            sequence: meta.sequence,
            captured_at: Instant::now(),
        })
    }
}

fn dequeue_error(e: io::Error, timeout: Option<Duration>) -> CameraError {
    match (e.kind(), timeout) {
        (io::ErrorKind::TimedOut, Some(timeout)) => CameraError::Timeout(timeout),
        _ => CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")),
    }
}
