//! rollcall-hw: Video sources for classroom cameras.
//!
//! Local capture devices are read through V4L2; network streams are decoded
//! by an ffmpeg child process. Both yield 8-bit luma frames.

pub mod address;
pub mod camera;
pub mod frame;
pub mod source;
pub mod stream;

pub use address::CameraAddress;
pub use camera::{Camera, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::{CameraError, SourceOpener, SourceSettings, SystemOpener, VideoSource};
