//! The capture collaborator: one blocking call, one image.

use crate::camera::{Camera, CameraError};
use crate::frame::FrameError;
use image::DynamicImage;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("failed to decode image {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("capture cancelled by operator")]
    Cancelled,
    #[error("prompt I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CaptureError {
    /// A capture that failed on lighting; the operator can fix the scene and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CaptureError::Camera(CameraError::AllFramesDark(_)))
    }
}

/// Produces exactly one image per call, blocking until it is available.
pub trait Capture {
    fn capture(&mut self) -> Result<DynamicImage, CaptureError>;
}

/// Loads a still image from disk on every call.
pub struct FileCapture {
    path: PathBuf,
}

impl FileCapture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Capture for FileCapture {
    fn capture(&mut self) -> Result<DynamicImage, CaptureError> {
        let image = image::open(&self.path).map_err(|source| CaptureError::Decode {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!(path = %self.path.display(), width = image.width(), height = image.height(), "loaded still");
        Ok(image)
    }
}

/// Waits for the operator to press Enter, then grabs one camera frame.
///
/// End of input on the prompt stream cancels the capture.
pub struct CameraCapture<R, W> {
    camera: Camera,
    max_attempts: usize,
    input: R,
    prompt: W,
}

impl CameraCapture<io::StdinLock<'static>, io::Stderr> {
    /// Camera capture confirmed from the terminal.
    pub fn interactive(camera: Camera, max_attempts: usize) -> Self {
        Self::new(camera, max_attempts, io::stdin().lock(), io::stderr())
    }
}

impl<R: BufRead, W: Write> CameraCapture<R, W> {
    pub fn new(camera: Camera, max_attempts: usize, input: R, prompt: W) -> Self {
        Self {
            camera,
            max_attempts,
            input,
            prompt,
        }
    }
}

impl<R: BufRead, W: Write> Capture for CameraCapture<R, W> {
    fn capture(&mut self) -> Result<DynamicImage, CaptureError> {
        wait_for_confirmation(&mut self.input, &mut self.prompt, &self.camera.device_path)?;
        let frame = self.camera.capture_frame(self.max_attempts)?;
        tracing::debug!(seq = frame.sequence, brightness = frame.avg_brightness(), "captured frame");
        Ok(frame.into_image()?)
    }
}

fn wait_for_confirmation<R: BufRead, W: Write>(
    input: &mut R,
    prompt: &mut W,
    device: &str,
) -> Result<(), CaptureError> {
    write!(prompt, "Look at the camera ({device}) and press Enter to capture... ")?;
    prompt.flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(CaptureError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_file_capture_loads_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.png");
        RgbImage::from_pixel(4, 3, Rgb([10, 20, 30])).save(&path).unwrap();

        let mut capture = FileCapture::new(&path);
        let image = capture.capture().unwrap();
        assert_eq!((image.width(), image.height()), (4, 3));
        // Repeatable: one image per call.
        assert!(capture.capture().is_ok());
    }

    #[test]
    fn test_file_capture_missing_file() {
        let mut capture = FileCapture::new("/nonexistent/probe.png");
        assert!(matches!(capture.capture(), Err(CaptureError::Decode { .. })));
    }

    #[test]
    fn test_only_dark_scene_is_retryable() {
        assert!(CaptureError::Camera(CameraError::AllFramesDark(5)).is_retryable());
        assert!(!CaptureError::Cancelled.is_retryable());
        assert!(!CaptureError::Camera(CameraError::DeviceNotFound("/dev/video9".into())).is_retryable());
    }

    #[test]
    fn test_confirmation_accepts_enter() {
        let mut input = io::Cursor::new(b"\n".to_vec());
        let mut prompt = Vec::new();
        wait_for_confirmation(&mut input, &mut prompt, "/dev/video0").unwrap();
        assert!(String::from_utf8(prompt).unwrap().contains("/dev/video0"));
    }

    #[test]
    fn test_confirmation_eof_cancels() {
        let mut input = io::Cursor::new(Vec::new());
        let err = wait_for_confirmation(&mut input, &mut io::sink(), "/dev/video0").unwrap_err();
        assert!(matches!(err, CaptureError::Cancelled));
    }
}
