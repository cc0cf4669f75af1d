//! Capture session: sample a video source until the deadline and collect
//! every roster identity seen in any frame.

use crate::config::Config;
use rollcall_core::{FaceEncoder, Gallery, MatchStrategy, SkippedMember, StudentId};
use rollcall_hw::{CameraAddress, CameraError, SourceOpener};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Tunables of one capture session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    pub duration: Duration,
    pub threshold: f32,
    pub strategy: MatchStrategy,
    pub downsample_factor: u32,
    /// Pause after a failed frame read.
    pub retry_delay: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            duration: config.session_duration(),
            threshold: config.similarity_threshold,
            strategy: config.match_strategy,
            downsample_factor: config.downsample_factor,
            retry_delay: Duration::from_millis(config.frame_retry_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub recognized: BTreeSet<StudentId>,
    /// Roster members left out of the gallery.
    pub skipped: Vec<SkippedMember>,
    pub frames_read: u32,
    pub frames_failed: u32,
    pub frames_dark: u32,
    /// The session stopped early on request.
    pub cancelled: bool,
}

/// Open `address` and sample it until `settings.duration` elapses.
///
/// Fails only if the source cannot be opened. Unreadable frames and
/// encoder errors are logged and skipped. The source is dropped before
/// returning on every path.
pub fn run_session(
    opener: &dyn SourceOpener,
    address: &CameraAddress,
    gallery: &Gallery,
    encoder: &mut dyn FaceEncoder,
    settings: &SessionSettings,
    cancel: &CancellationToken,
) -> Result<SessionReport, CameraError> {
    let mut source = opener.open(address)?;
    let described = source.describe();
    tracing::info!(
        source = %described,
        gallery = gallery.len(),
        duration_ms = settings.duration.as_millis() as u64,
        "capture session started"
    );

    let matcher = settings.strategy.matcher();
    let deadline = Instant::now() + settings.duration;
    let mut report = SessionReport::default();

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }

        let frame = match source.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                report.frames_failed += 1;
                tracing::warn!(source = %described, error = %e, "frame read failed");
                std::thread::sleep(settings.retry_delay.min(deadline - now));
                continue;
            }
        };
        report.frames_read += 1;

        if frame.is_dark {
            report.frames_dark += 1;
            continue;
        }

        let frame = frame.downsample(settings.downsample_factor);
        let embeddings = match encoder.encode(&frame.data, frame.width, frame.height) {
            Ok(embeddings) => embeddings,
            Err(e) => {
                report.frames_failed += 1;
                tracing::warn!(sequence = frame.sequence, error = %e, "frame encoding failed");
                continue;
            }
        };

        for embedding in &embeddings {
            if let Some(id) = gallery.identify(embedding, matcher, settings.threshold) {
                if report.recognized.insert(id) {
                    tracing::debug!(student_id = id, sequence = frame.sequence, "student recognized");
                }
            }
        }
    }

    drop(source);
    tracing::info!(
        source = %described,
        recognized = report.recognized.len(),
        frames_read = report.frames_read,
        frames_failed = report.frames_failed,
        frames_dark = report.frames_dark,
        cancelled = report.cancelled,
        "capture session finished, source released"
    );
    Ok(report)
}
