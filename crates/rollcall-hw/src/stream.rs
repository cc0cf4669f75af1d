//! Network streams (RTSP, HTTP, files) decoded by an `ffmpeg` child process.
//!
//! ffmpeg scales to a fixed size and writes raw 8-bit luma frames to stdout,
//! so each frame is exactly `width * height` bytes.

use crate::frame::Frame;
use crate::source::{CameraError, VideoSource};
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};

/// Socket I/O timeout handed to ffmpeg, in microseconds.
const IO_TIMEOUT_US: &str = "5000000";

/// Build the ffmpeg argument list for a source URL.
pub fn ffmpeg_args(url: &str, width: u32, height: u32) -> Vec<String> {
    let mut args: Vec<String> = vec!["-nostdin".into(), "-loglevel".into(), "error".into()];

    if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
        args.extend(["-rtsp_transport", "tcp", "-timeout", IO_TIMEOUT_US].map(String::from));
    } else if url.contains("://") {
        args.extend(["-rw_timeout", IO_TIMEOUT_US].map(String::from));
    }

    args.extend(["-i".to_string(), url.to_string()]);
    args.extend(["-an".to_string(), "-vf".to_string(), format!("scale={width}:{height}")]);
    args.extend(["-pix_fmt", "gray", "-f", "rawvideo", "pipe:1"].map(String::from));
    args
}

pub struct FfmpegSource {
    url: String,
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    sequence: u32,
    /// First frame, read while opening to prove the stream is live.
    pending: Option<Frame>,
}

impl FfmpegSource {
    /// Spawn ffmpeg and wait for the first frame.
    ///
    /// Fails if ffmpeg cannot be started or exits before producing a frame.
    pub fn open(url: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        let args = ffmpeg_args(url, width, height);
        tracing::debug!(args = ?args, "spawning ffmpeg for stream capture");

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CameraError::StreamUnavailable(format!("failed to execute ffmpeg: {e}")))?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CameraError::StreamUnavailable("ffmpeg stdout not captured".into()));
        };

        let mut source = Self {
            url: url.to_string(),
            child,
            stdout,
            width,
            height,
            sequence: 0,
            pending: None,
        };

        // Dropping `source` on failure reaps the child.
        let first = source
            .read_raw()
            .map_err(|e| CameraError::StreamUnavailable(format!("{url}: {e}")))?;
        source.pending = Some(first);

        tracing::info!(url, width, height, "stream opened");
        Ok(source)
    }

    fn read_raw(&mut self) -> Result<Frame, CameraError> {
        let mut buf = vec![0u8; (self.width * self.height) as usize];
        self.stdout
            .read_exact(&mut buf)
            .map_err(|e| CameraError::CaptureFailed(format!("stream read failed: {e}")))?;
        let frame = Frame::new(buf, self.width, self.height, self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        Ok(frame)
    }
}

impl VideoSource for FfmpegSource {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        match self.pending.take() {
            Some(frame) => Ok(frame),
            None => self.read_raw(),
        }
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            tracing::debug!(url = %self.url, error = %e, "ffmpeg already exited");
        }
        let _ = self.child.wait();
        tracing::debug!(url = %self.url, "stream released");
    }
}
