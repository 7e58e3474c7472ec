//! rollcall-hw: camera capture for enrollment and live recognition.
//!
//! Thin V4L2 frame source: opens a webcam, negotiates a luma-convertible
//! pixel format and hands out grayscale frames.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CaptureBatch, DeviceInfo, FrameStream, PixelFormat};
pub use frame::{Clahe, Frame};
