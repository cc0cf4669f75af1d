use crate::model::{AttendanceStatus, DATE_FORMAT, TIME_FORMAT};
use crate::orchestrator::{AttendanceRequest, DateInput, Orchestrator};
use crate::store::{Store, StoreError};
use chrono::{NaiveDate, NaiveTime};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface of the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Store,
    /// Cancelled at daemon shutdown; aborts an on-demand capture in progress.
    pub shutdown: CancellationToken,
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn store_failed(e: StoreError) -> zbus::fdo::Error {
    tracing::error!(error = %e, "store request failed");
    failed(e)
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

fn parse_date(date: &str) -> zbus::fdo::Result<NaiveDate> {
    DateInput::Text(date.to_string())
        .resolve(chrono::Local::now().date_naive())
        .map_err(zbus::fdo::Error::InvalidArgs)
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Capture attendance now. An empty `date` means today.
    async fn take_attendance(&self, camera_id: i64, course_id: i64, date: &str) -> (bool, String) {
        tracing::info!(camera_id, course_id, date, "take_attendance requested");
        let date = if date.is_empty() {
            DateInput::Today
        } else {
            DateInput::Text(date.to_string())
        };
        let request = AttendanceRequest::new(camera_id, course_id).on(date);
        let outcome = self.orchestrator.take_attendance(request, &self.shutdown).await;
        (outcome.success, outcome.message)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let pending = self.store.list_schedules().await.map_err(store_failed)?.len();
        let expired = self.store.list_expired().await.map_err(store_failed)?.len();
        let settings = self.orchestrator.settings();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "session_duration_secs": settings.duration.as_secs_f32(),
            "similarity_threshold": settings.threshold,
            "match_strategy": settings.strategy,
            "record_absent_when_empty": self.orchestrator.record_absent_when_empty(),
            "pending_schedules": pending,
            "expired_schedules": expired,
        })
        .to_string())
    }

    /// Pending schedule entries as JSON.
    async fn list_schedules(&self) -> zbus::fdo::Result<String> {
        to_json(&self.store.list_schedules().await.map_err(store_failed)?)
    }

    /// Archived entries whose window passed without a successful capture.
    async fn list_expired(&self) -> zbus::fdo::Result<String> {
        to_json(&self.store.list_expired().await.map_err(store_failed)?)
    }

    async fn add_schedule(&self, camera_id: i64, course_id: i64, date: &str, time: &str) -> zbus::fdo::Result<i64> {
        let date = parse_date(date)?;
        let time = NaiveTime::parse_from_str(time, TIME_FORMAT)
            .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M"))
            .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Invalid time format: {time}")))?;
        let id = self
            .store
            .insert_schedule(camera_id, course_id, date, time)
            .await
            .map_err(store_failed)?;
        tracing::info!(schedule_id = id, camera_id, course_id, %date, %time, "schedule entry added");
        Ok(id)
    }

    async fn remove_schedule(&self, id: i64) -> zbus::fdo::Result<bool> {
        let removed = self.store.delete_schedule(id).await.map_err(store_failed)?;
        tracing::info!(schedule_id = id, removed, "remove_schedule requested");
        Ok(removed)
    }

    /// Attendance of a course on `date` (empty = today) as JSON.
    async fn attendance(&self, course_id: i64, date: &str) -> zbus::fdo::Result<String> {
        let date = if date.is_empty() {
            chrono::Local::now().date_naive()
        } else {
            parse_date(date)?
        };
        to_json(&self.store.attendance_for_course(course_id, date).await.map_err(store_failed)?)
    }

    /// Manually set one student's status for a date.
    async fn set_attendance(&self, student_id: i64, date: &str, status: &str) -> zbus::fdo::Result<()> {
        let date = parse_date(date)?;
        let status: AttendanceStatus = status.parse().map_err(zbus::fdo::Error::InvalidArgs)?;
        self.store
            .set_attendance(student_id, date, status)
            .await
            .map_err(store_failed)?;
        tracing::info!(student_id, date = %date.format(DATE_FORMAT), %status, "attendance edited");
        Ok(())
    }
}
