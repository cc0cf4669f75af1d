//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::source::VideoSource;
use crate::CameraError;
use std::path::Path;
use std::time::Duration;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Upper bound on a single buffer dequeue so a stalled device cannot
/// outlive the capture session.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);
const STREAM_BUFFERS: u32 = 4;

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

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

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(PixelFormat::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(PixelFormat::Grey)
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            Some(PixelFormat::Y16)
        } else {
            None
        }
    }

    /// Raw buffer → luma, validating the buffer length.
    pub fn to_luma(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CameraError> {
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
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, width, height),
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, width, height),
        };
        converted.map_err(|e| CameraError::CaptureFailed(format!("{self:?} conversion failed: {e}")))
    }
}

/// An opened V4L2 device with a negotiated capture format.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 device and negotiate the requested resolution.
    ///
    /// YUYV is requested; GREY and Y16 are accepted if the driver insists.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.raw_os_error() == Some(16) {
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
                "unsupported pixel format: {:?} (need YUYV, GREY, or Y16)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            device = device_path,
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

    /// Start streaming. The returned source owns the device; dropping it
    /// stops the stream and closes the handle.
    pub fn into_source(self) -> Result<V4lSource, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        stream.set_timeout(DEQUEUE_TIMEOUT);
        Ok(V4lSource { stream, camera: self })
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
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card.clone(),
                        driver: caps.driver.clone(),
                        bus: caps.bus.clone(),
                    })
            })
            .collect()
    }
}

/// A streaming V4L2 camera.
pub struct V4lSource {
    // Declared first so the stream is torn down before the device closes.
    stream: MmapStream<'static>,
    camera: Camera,
}

impl VideoSource for V4lSource {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let sequence = meta.sequence;
        let luma = self
            .camera
            .pixel_format
            .to_luma(buf, self.camera.width, self.camera.height)?;
        Ok(Frame::new(luma, self.camera.width, self.camera.height, sequence))
    }

    fn describe(&self) -> String {
        self.camera.device_path.clone()
    }
}

impl Drop for V4lSource {
    fn drop(&mut self) {
        tracing::debug!(device = %self.camera.device_path, "releasing camera");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), None);
    }

    #[test]
    fn test_to_luma_grey_truncates_padding() {
        let luma = PixelFormat::Grey.to_luma(&[1, 2, 3, 4, 99, 99], 2, 2).unwrap();
        assert_eq!(luma, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_to_luma_short_buffer_is_capture_error() {
        let err = PixelFormat::Yuyv.to_luma(&[0u8; 3], 2, 1).unwrap_err();
        assert!(matches!(err, CameraError::CaptureFailed(_)));
        assert!(PixelFormat::Grey.to_luma(&[0u8; 3], 2, 2).is_err());
    }

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/video-does-not-exist", 640, 480).err();
        assert!(matches!(err, Some(CameraError::DeviceNotFound(_))));
    }
}
