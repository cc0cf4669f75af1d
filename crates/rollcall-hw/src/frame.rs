//! Luma frames and the pixel conversions sources need.

use std::time::Instant;

/// A captured 8-bit luma frame.
#[derive(Clone)]
pub struct Frame {
    /// Row-major luma pixels (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        let is_dark = is_dark_frame(&data, DARK_FRAME_RATIO);
        Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
            sequence,
            is_dark,
        }
    }

    /// Box-filter downsample by an integer factor (2 = half resolution).
    ///
    /// Trailing rows/columns that do not fill a whole block are dropped.
    /// A factor of 0 or 1, or a frame smaller than one block, is returned as is.
    pub fn downsample(&self, factor: u32) -> Frame {
        let f = factor as usize;
        let (w, h) = (self.width as usize, self.height as usize);
        if f <= 1 || w < f || h < f || self.data.len() < w * h {
            return self.clone();
        }

        let (out_w, out_h) = (w / f, h / f);
        let area = (f * f) as u32;
        let mut data = Vec::with_capacity(out_w * out_h);
        for oy in 0..out_h {
            for ox in 0..out_w {
                let sum: u32 = (0..f)
                    .flat_map(|dy| {
                        let row = (oy * f + dy) * w + ox * f;
                        self.data[row..row + f].iter().map(|&p| p as u32)
                    })
                    .sum();
                data.push(((sum + area / 2) / area) as u8);
            }
        }

        Frame {
            data,
            width: out_w as u32,
            height: out_h as u32,
            timestamp: self.timestamp,
            sequence: self.sequence,
            is_dark: self.is_dark,
        }
    }
}

/// Share of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_RATIO: f32 = 0.95;

/// Convert packed YUYV 4:2:2 (`[Y0, U, Y1, V]` per pixel pair) to luma.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Convert 16-bit little-endian luma to 8-bit by keeping the high byte.
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if y16.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: y16.len(),
        });
    }
    Ok(y16[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

/// True if more than `threshold_pct` of pixels fall in the darkest bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < 32).count();
    (dark as f32 / gray.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
