//! Periodic dispatcher: run due schedule entries, drop the satisfied ones.

use crate::config::Config;
use crate::orchestrator::{AttendanceRequest, DateInput, Orchestrator};
use crate::store::Store;
use crate::window::{due_window, stale_before};
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub lookback: chrono::Duration,
    pub archive_stale: bool,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: Duration::from_secs(config.tick_interval_secs.max(1)),
            lookback: chrono::Duration::minutes(config.lookback_minutes.max(0)),
            archive_stale: config.archive_stale_schedules,
        }
    }
}

/// Schedule entry ids touched by one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub completed: Vec<i64>,
    pub failed: Vec<i64>,
    pub expired: Vec<i64>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.failed.is_empty() && self.expired.is_empty()
    }
}

#[derive(Clone)]
pub struct Scheduler {
    store: Store,
    orchestrator: Arc<Orchestrator>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(store: Store, orchestrator: Arc<Orchestrator>, settings: SchedulerSettings) -> Self {
        Self {
            store,
            orchestrator,
            settings,
        }
    }

    /// Run one tick as if the local time were `now`.
    ///
    /// Never fails: query errors end the tick early, and a failing entry does
    /// not keep later entries from running.
    pub async fn tick_at(&self, now: NaiveDateTime, cancel: &CancellationToken) -> TickReport {
        let mut report = TickReport::default();
        let window = due_window(now, self.settings.lookback);

        let due = match self.store.due_schedules(&window).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "failed to query due schedules");
                return report;
            }
        };
        if !due.is_empty() {
            tracing::info!(count = due.len(), ranges = ?window.ranges, "schedule entries due");
        }

        for entry in due {
            if cancel.is_cancelled() {
                break;
            }
            let request =
                AttendanceRequest::new(entry.camera_id, entry.course_id).on(DateInput::Date(entry.date));
            let outcome = self.orchestrator.take_attendance(request, cancel).await;

            if outcome.success {
                match self.store.delete_schedule(entry.id).await {
                    Ok(_) => tracing::info!(schedule_id = entry.id, "schedule entry satisfied and removed"),
                    Err(e) => tracing::error!(schedule_id = entry.id, error = %e, "failed to remove schedule entry"),
                }
                report.completed.push(entry.id);
            } else if cancel.is_cancelled() {
                tracing::info!(schedule_id = entry.id, "capture interrupted by shutdown; entry left untouched");
                break;
            } else {
                if let Err(e) = self.store.record_schedule_failure(entry.id, &outcome.message).await {
                    tracing::error!(schedule_id = entry.id, error = %e, "failed to record schedule failure");
                }
                tracing::warn!(
                    schedule_id = entry.id,
                    attempts = entry.attempts + 1,
                    message = %outcome.message,
                    "schedule entry retained"
                );
                report.failed.push(entry.id);
            }
        }

        if self.settings.archive_stale {
            report.expired = self.archive_stale(now).await;
        }
        report
    }

    async fn archive_stale(&self, now: NaiveDateTime) -> Vec<i64> {
        let cutoff = stale_before(now, self.settings.lookback);
        let candidates = match self.store.schedules_through(cutoff.date()).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "failed to query stale schedules");
                return Vec::new();
            }
        };

        let mut expired = Vec::new();
        for entry in candidates.into_iter().filter(|e| e.scheduled_at() < cutoff) {
            match self.store.expire_schedule(entry.id).await {
                Ok(true) => {
                    tracing::warn!(
                        schedule_id = entry.id,
                        scheduled_at = %entry.scheduled_at(),
                        attempts = entry.attempts,
                        last_error = entry.last_error.as_deref().unwrap_or(""),
                        "schedule entry expired"
                    );
                    expired.push(entry.id);
                }
                Ok(false) => {}
                Err(e) => tracing::error!(schedule_id = entry.id, error = %e, "failed to archive schedule entry"),
            }
        }
        expired
    }

    /// Spawn the periodic task. Ticks run one at a time; a tick that overruns
    /// the interval swallows the missed ones.
    pub fn start(self) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(interval_secs = self.settings.interval.as_secs(), "scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.tick_at(Local::now().naive_local(), &token).await;
                        if !report.is_empty() {
                            tracing::info!(
                                completed = ?report.completed,
                                failed = ?report.failed,
                                expired = ?report.expired,
                                "scheduler tick finished"
                            );
                        }
                    }
                    _ = token.cancelled() => {
                        tracing::info!("scheduler shutting down");
                        break;
                    }
                }
            }
        });

        SchedulerHandle { cancel, task }
    }
}

pub struct SchedulerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Cancel the task (aborting a running capture at its next frame) and wait for it.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "scheduler task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::session::SessionSettings;
    use crate::testing::{face_frame, write_reference, ScriptedOpener, Step, TagEncoder};
    use chrono::{NaiveDate, NaiveTime};
    use rollcall_core::{GalleryLoader, MatchStrategy};
    use rollcall_hw::{CameraAddress, CameraError, SourceOpener, VideoSource};
    use tempfile::TempDir;

    struct Fixture {
        store: Store,
        scheduler: Scheduler,
        camera: i64,
        broken_camera: i64,
        course: i64,
        _faces: TempDir,
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    async fn fixture(archive_stale: bool) -> Fixture {
        let store = Store::open_in_memory().await.unwrap();
        let course = store.insert_course("Physics").await.unwrap();
        let camera = store.insert_camera("Room 1", "0", Some(course)).await.unwrap();
        let broken_camera = store.insert_camera("Room 2", "rtsp://offline", Some(course)).await.unwrap();
        let s1 = store.insert_student("Ada", course, "1").await.unwrap();
        store.insert_student("Bo", course, "2").await.unwrap();

        let faces = tempfile::tempdir().unwrap();
        write_reference(faces.path(), s1, 1);

        let engine = spawn_engine(
            Box::new(TagEncoder),
            Box::new(SelectiveOpener {
                inner: ScriptedOpener::new(vec![Step::Frame(face_frame(&[1]))]),
            }),
            GalleryLoader::new(faces.path(), "png"),
        )
        .unwrap();
        let session = SessionSettings {
            duration: Duration::from_millis(20),
            threshold: 0.5,
            strategy: MatchStrategy::First,
            downsample_factor: 2,
            retry_delay: Duration::from_millis(1),
        };
        let orchestrator = Arc::new(Orchestrator::new(store.clone(), engine, session, false));
        let settings = SchedulerSettings {
            interval: Duration::from_millis(50),
            lookback: chrono::Duration::minutes(2),
            archive_stale,
        };

        Fixture {
            scheduler: Scheduler::new(store.clone(), orchestrator, settings),
            store,
            camera,
            broken_camera,
            course,
            _faces: faces,
        }
    }

    /// Fails to open network addresses, replays the script for device indexes.
    struct SelectiveOpener {
        inner: ScriptedOpener,
    }

    impl SourceOpener for SelectiveOpener {
        fn open(&self, address: &CameraAddress) -> Result<Box<dyn VideoSource>, CameraError> {
            match address {
                CameraAddress::Index(_) => self.inner.open(address),
                other => Err(CameraError::StreamUnavailable(other.to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_successful_entry_is_deleted_failed_is_retained() {
        let f = fixture(true).await;
        let ok = f.store.insert_schedule(f.camera, f.course, day(), t(9, 0)).await.unwrap();
        let bad = f.store.insert_schedule(f.broken_camera, f.course, day(), t(9, 1)).await.unwrap();
        let later = f.store.insert_schedule(f.camera, f.course, day(), t(9, 5)).await.unwrap();

        let now = day().and_time(t(9, 1));
        let report = f.scheduler.tick_at(now, &CancellationToken::new()).await;
        assert_eq!(report.completed, vec![ok]);
        assert_eq!(report.failed, vec![bad]);
        assert!(report.expired.is_empty());

        let remaining = f.store.list_schedules().await.unwrap();
        let ids: Vec<_> = remaining.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![later, bad]);
        let retained = remaining.iter().find(|e| e.id == bad).unwrap();
        assert_eq!(retained.attempts, 1);
        assert!(retained.last_error.as_deref().unwrap_or("").contains("Could not open camera"));

        assert_eq!(f.store.attendance_row_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_entry_retries_then_expires() {
        let f = fixture(true).await;
        let bad = f.store.insert_schedule(f.broken_camera, f.course, day(), t(9, 0)).await.unwrap();
        let cancel = CancellationToken::new();

        assert_eq!(f.scheduler.tick_at(day().and_time(t(9, 0)), &cancel).await.failed, vec![bad]);
        assert_eq!(f.scheduler.tick_at(day().and_time(t(9, 2)), &cancel).await.failed, vec![bad]);

        let report = f.scheduler.tick_at(day().and_time(t(9, 3)), &cancel).await;
        assert!(report.failed.is_empty());
        assert_eq!(report.expired, vec![bad]);

        assert!(f.store.list_schedules().await.unwrap().is_empty());
        let archived = f.store.list_expired().await.unwrap();
        assert_eq!(archived[0].entry.id, bad);
        assert_eq!(archived[0].entry.attempts, 2);
    }

    #[tokio::test]
    async fn test_stale_entries_kept_when_archiving_disabled() {
        let f = fixture(false).await;
        let old = f
            .store
            .insert_schedule(f.camera, f.course, day().pred_opt().unwrap(), t(9, 0))
            .await
            .unwrap();

        let report = f.scheduler.tick_at(day().and_time(t(9, 0)), &CancellationToken::new()).await;
        assert!(report.is_empty());
        assert_eq!(f.store.list_schedules().await.unwrap()[0].id, old);
        assert_eq!(f.store.attendance_row_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_midnight_tick_runs_both_sides_once() {
        let f = fixture(true).await;
        let before = f.store.insert_schedule(f.camera, f.course, day(), t(23, 59)).await.unwrap();
        let after = f.store.insert_schedule(f.camera, f.course, day(), t(0, 0)).await.unwrap();
        let future = f.store.insert_schedule(f.camera, f.course, day(), t(0, 5)).await.unwrap();

        let report = f.scheduler.tick_at(day().and_time(t(0, 1)), &CancellationToken::new()).await;
        let mut completed = report.completed.clone();
        completed.sort();
        assert_eq!(completed, vec![before, after]);

        let ids: Vec<_> = f.store.list_schedules().await.unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![future]);
    }

    #[tokio::test]
    async fn test_future_dates_are_left_alone() {
        let f = fixture(true).await;
        let tomorrow = f
            .store
            .insert_schedule(f.camera, f.course, day().succ_opt().unwrap(), t(9, 0))
            .await
            .unwrap();
        let report = f.scheduler.tick_at(day().and_time(t(9, 0)), &CancellationToken::new()).await;
        assert!(report.is_empty());
        assert_eq!(f.store.list_schedules().await.unwrap()[0].id, tomorrow);
    }

    #[tokio::test]
    async fn test_interrupted_capture_is_not_counted_as_failure() {
        let f = fixture(true).await;
        let entry = f.store.insert_schedule(f.camera, f.course, day(), t(9, 0)).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            trigger.cancel();
        });

        let report = f.scheduler.tick_at(day().and_time(t(9, 0)), &cancel).await;
        assert!(report.completed.is_empty());
        assert!(report.failed.is_empty());

        let pending = f.store.list_schedules().await.unwrap();
        assert_eq!(pending[0].id, entry);
        assert_eq!(pending[0].attempts, 0);
        assert_eq!(pending[0].last_error, None);
        assert_eq!(f.store.attendance_row_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let f = fixture(true).await;
        let handle = f.scheduler.clone().start();
        tokio::time::sleep(Duration::from_millis(120)).await;
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap();
    }
}
