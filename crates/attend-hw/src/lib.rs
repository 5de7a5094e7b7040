//! attend-hw — Image capture for enrollment and verification.
//!
//! Provides still-image loading and V4L2-based single-frame camera capture
//! behind the [`Capture`] trait.

pub mod camera;
pub mod capture;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo};
pub use capture::{CameraCapture, Capture, CaptureError, FileCapture};
pub use frame::Frame;
