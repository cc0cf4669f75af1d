use crate::session::{run_session, SessionReport, SessionSettings};
use rollcall_core::{FaceEncoder, GalleryLoader, RosterMember};
use rollcall_hw::{CameraAddress, CameraError, SourceOpener};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// One capture session to run against a roster.
pub struct CaptureRequest {
    pub address: CameraAddress,
    pub roster: Vec<RosterMember>,
    pub settings: SessionSettings,
    pub cancel: CancellationToken,
}

/// Messages sent from async callers to the engine thread.
struct EngineJob {
    request: CaptureRequest,
    reply: oneshot::Sender<Result<SessionReport, EngineError>>,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineJob>,
}

impl EngineHandle {
    /// Build the roster gallery, then run a capture session.
    ///
    /// Requests queue behind each other, so at most one camera is open at a time.
    pub async fn capture(&self, request: CaptureRequest) -> Result<SessionReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineJob {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread owning the encoder and opener.
///
/// The thread exits once every handle is dropped.
pub fn spawn_engine(
    mut encoder: Box<dyn FaceEncoder + Send>,
    opener: Box<dyn SourceOpener>,
    loader: GalleryLoader,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineJob>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!(face_dir = %loader.face_dir().display(), "engine thread started");
            while let Some(EngineJob { request, reply }) = rx.blocking_recv() {
                let result = run_capture(encoder.as_mut(), opener.as_ref(), &loader, request);
                let _ = reply.send(result);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_capture(
    encoder: &mut dyn FaceEncoder,
    opener: &dyn SourceOpener,
    loader: &GalleryLoader,
    request: CaptureRequest,
) -> Result<SessionReport, EngineError> {
    let build = loader.build(&request.roster, encoder);
    let mut report = run_session(
        opener,
        &request.address,
        &build.gallery,
        encoder,
        &request.settings,
        &request.cancel,
    )?;
    report.skipped = build.skipped;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{face_frame, write_reference, ScriptedOpener, Step, TagEncoder};
    use rollcall_core::{MatchStrategy, SkipReason};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn member(id: i64) -> RosterMember {
        RosterMember {
            id,
            name: format!("student {id}"),
            roll_number: id.to_string(),
            reference: None,
        }
    }

    fn request(roster: Vec<RosterMember>) -> CaptureRequest {
        CaptureRequest {
            address: CameraAddress::Index(0),
            roster,
            settings: SessionSettings {
                duration: Duration::from_millis(30),
                threshold: 0.5,
                strategy: MatchStrategy::First,
                downsample_factor: 2,
                retry_delay: Duration::from_millis(1),
            },
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_capture_reports_recognized_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_reference(dir.path(), 10000, 1);

        let opener = ScriptedOpener::new(vec![Step::Frame(face_frame(&[1, 2]))]);
        let engine = spawn_engine(
            Box::new(TagEncoder),
            Box::new(opener.clone()),
            GalleryLoader::new(dir.path(), "png"),
        )
        .unwrap();

        let report = engine.capture(request(vec![member(10000), member(10001)])).await.unwrap();
        assert_eq!(report.recognized, BTreeSet::from([10000]));
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].student_id, 10001);
        assert_eq!(report.skipped[0].reason, SkipReason::NoReference);
        assert_eq!(opener.released(), 1);
    }

    #[tokio::test]
    async fn test_capture_open_failure_is_camera_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_engine(
            Box::new(TagEncoder),
            Box::new(ScriptedOpener::unavailable()),
            GalleryLoader::new(dir.path(), "png"),
        )
        .unwrap();

        let err = engine.capture(request(vec![member(10000)])).await.unwrap_err();
        assert!(matches!(err, EngineError::Camera(CameraError::DeviceNotFound(_))));
    }

    #[tokio::test]
    async fn test_requests_are_served_one_after_another() {
        let dir = tempfile::tempdir().unwrap();
        write_reference(dir.path(), 10000, 3);
        let opener = ScriptedOpener::new(vec![Step::Frame(face_frame(&[3]))]);
        let engine = spawn_engine(
            Box::new(TagEncoder),
            Box::new(opener.clone()),
            GalleryLoader::new(dir.path(), "png"),
        )
        .unwrap();

        let (a, b) = tokio::join!(
            engine.capture(request(vec![member(10000)])),
            engine.capture(request(vec![member(10000)]))
        );
        assert_eq!(a.unwrap().recognized, BTreeSet::from([10000]));
        assert_eq!(b.unwrap().recognized, BTreeSet::from([10000]));
        assert_eq!(opener.opened(), 2);
        assert_eq!(opener.released(), 2);
    }
}
