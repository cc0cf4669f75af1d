//! Camera addressing: local device index or opaque stream location.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraAddress {
    /// Local capture device index, opened as `/dev/video<N>`.
    Index(u32),
    /// Anything else: a device path or a network stream URL.
    Location(String),
}

impl CameraAddress {
    /// Integer parsing first; whatever does not parse is kept verbatim.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<u32>() {
            Ok(index) => CameraAddress::Index(index),
            Err(_) => CameraAddress::Location(trimmed.to_string()),
        }
    }

    /// V4L2 device node, if this address names a local device.
    pub fn device_path(&self) -> Option<String> {
        match self {
            CameraAddress::Index(i) => Some(format!("/dev/video{i}")),
            CameraAddress::Location(loc) if loc.starts_with("/dev/") => Some(loc.clone()),
            CameraAddress::Location(_) => None,
        }
    }
}

impl fmt::Display for CameraAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraAddress::Index(i) => write!(f, "{i}"),
            CameraAddress::Location(loc) => f.write_str(loc),
        }
    }
}
