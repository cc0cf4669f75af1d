//! Frame sources and how addresses are opened into them.

use crate::address::CameraAddress;
use crate::camera::Camera;
use crate::frame::Frame;
use crate::stream::FfmpegSource;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("stream unavailable: {0}")]
    StreamUnavailable(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// An open video source. The underlying handle is released on drop.
pub trait VideoSource {
    /// Pull the next frame. Errors are per-frame; the source stays usable.
    fn read_frame(&mut self) -> Result<Frame, CameraError>;

    /// Human-readable identification for logs.
    fn describe(&self) -> String;
}

/// Turns a camera address into an open [`VideoSource`].
pub trait SourceOpener: Send {
    fn open(&self, address: &CameraAddress) -> Result<Box<dyn VideoSource>, CameraError>;
}

/// Resolution parameters for opening real sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSettings {
    /// Resolution requested from local V4L2 devices.
    pub capture_width: u32,
    pub capture_height: u32,
    /// Resolution network streams are scaled to by ffmpeg.
    pub stream_width: u32,
    pub stream_height: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            capture_width: 640,
            capture_height: 480,
            stream_width: 640,
            stream_height: 360,
        }
    }
}

/// Opens local devices through V4L2 and everything else through ffmpeg.
#[derive(Debug, Clone, Default)]
pub struct SystemOpener {
    pub settings: SourceSettings,
}

impl SystemOpener {
    pub fn new(settings: SourceSettings) -> Self {
        Self { settings }
    }
}

impl SourceOpener for SystemOpener {
    fn open(&self, address: &CameraAddress) -> Result<Box<dyn VideoSource>, CameraError> {
        let s = &self.settings;
        match address.device_path() {
            Some(path) => {
                let camera = Camera::open(&path, s.capture_width, s.capture_height)?;
                Ok(Box::new(camera.into_source()?))
            }
            None => {
                let CameraAddress::Location(url) = address else {
                    return Err(CameraError::DeviceNotFound(address.to_string()));
                };
                if url.is_empty() {
                    return Err(CameraError::StreamUnavailable("empty camera address".into()));
                }
                Ok(Box::new(FfmpegSource::open(url, s.stream_width, s.stream_height)?))
            }
        }
    }
}
