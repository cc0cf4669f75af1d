//! `take_attendance`: resolve inputs, capture, reconcile, report.
//!
//! Every failure is flattened into an [`Outcome`]; nothing here panics or
//! propagates an error to the caller.

use crate::engine::{CaptureRequest, EngineError, EngineHandle};
use crate::model::DATE_FORMAT;
use crate::reconcile;
use crate::session::SessionSettings;
use crate::store::Store;
use chrono::{Local, NaiveDate, NaiveTime};
use rollcall_hw::CameraAddress;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const MSG_SUCCESS: &str = "Attendance taken successfully";
pub const MSG_NOTHING_RECOGNIZED: &str = "Recognition failed or no faces detected";

/// How the attendance date was supplied.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DateInput {
    #[default]
    Today,
    Date(NaiveDate),
    /// Must be strict `YYYY-MM-DD`.
    Text(String),
}

impl DateInput {
    /// Resolve against `today`; malformed text yields the caller-facing message.
    pub fn resolve(&self, today: NaiveDate) -> Result<NaiveDate, String> {
        match self {
            DateInput::Today => Ok(today),
            DateInput::Date(date) => Ok(*date),
            DateInput::Text(text) => parse_date(text).ok_or_else(|| format!("Invalid date format: {text}")),
        }
    }
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    // chrono accepts unpadded fields; the stored format does not.
    if text.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(text, DATE_FORMAT).ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRequest {
    pub camera_id: i64,
    pub course_id: i64,
    pub date: DateInput,
    /// Time of day stamped on the records; now if absent.
    pub time: Option<NaiveTime>,
    /// Session length; the configured default if absent.
    pub duration: Option<Duration>,
}

impl AttendanceRequest {
    pub fn new(camera_id: i64, course_id: i64) -> Self {
        Self {
            camera_id,
            course_id,
            date: DateInput::Today,
            time: None,
            duration: None,
        }
    }

    pub fn on(mut self, date: DateInput) -> Self {
        self.date = date;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub success: bool,
    pub message: String,
}

impl Outcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

pub struct Orchestrator {
    store: Store,
    engine: EngineHandle,
    settings: SessionSettings,
    record_absent_when_empty: bool,
}

impl Orchestrator {
    pub fn new(store: Store, engine: EngineHandle, settings: SessionSettings, record_absent_when_empty: bool) -> Self {
        Self {
            store,
            engine,
            settings,
            record_absent_when_empty,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn record_absent_when_empty(&self) -> bool {
        self.record_absent_when_empty
    }

    pub async fn take_attendance(&self, request: AttendanceRequest, cancel: &CancellationToken) -> Outcome {
        let (camera_id, course_id) = (request.camera_id, request.course_id);
        let outcome = self.run(request, cancel).await;
        if outcome.success {
            tracing::info!(camera_id, course_id, message = %outcome.message, "attendance taken");
        } else {
            tracing::warn!(camera_id, course_id, message = %outcome.message, "attendance not taken");
        }
        outcome
    }

    async fn run(&self, request: AttendanceRequest, cancel: &CancellationToken) -> Outcome {
        let (camera_id, course_id) = (request.camera_id, request.course_id);

        let (camera, course) = match (self.store.camera(camera_id).await, self.store.course(course_id).await) {
            (Ok(Some(camera)), Ok(Some(course))) => (camera, course),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "failed to resolve camera or course");
                return Outcome::failed(e.to_string());
            }
            _ => {
                return Outcome::failed(format!(
                    "Camera or Course not found: camera_id={camera_id}, course_id={course_id}"
                ))
            }
        };

        let now = Local::now().naive_local();
        let date = match request.date.resolve(now.date()) {
            Ok(date) => date,
            Err(message) => return Outcome::failed(message),
        };
        let time = request.time.unwrap_or(now.time());

        let roster = match self.store.roster(course.id).await {
            Ok(roster) => roster,
            Err(e) => {
                tracing::error!(course_id, error = %e, "failed to load roster");
                return Outcome::failed(e.to_string());
            }
        };

        let mut settings = self.settings;
        if let Some(duration) = request.duration {
            settings.duration = duration;
        }

        let address = CameraAddress::parse(&camera.address);
        tracing::info!(
            camera_id,
            course = %course.name,
            %address,
            roster = roster.len(),
            %date,
            "taking attendance"
        );

        let report = match self
            .engine
            .capture(CaptureRequest {
                address: address.clone(),
                roster: roster.clone(),
                settings,
                cancel: cancel.clone(),
            })
            .await
        {
            Ok(report) => report,
            Err(EngineError::Camera(e)) => {
                tracing::error!(camera_id, %address, error = %e, "camera could not be opened");
                return Outcome::failed(format!("Could not open camera {address}: {e}"));
            }
            Err(e) => {
                tracing::error!(camera_id, error = %e, "capture failed");
                return Outcome::failed(e.to_string());
            }
        };

        tracing::info!(
            camera_id,
            recognized = report.recognized.len(),
            skipped = report.skipped.len(),
            frames = report.frames_read,
            "capture finished"
        );
        if report.cancelled {
            return Outcome::failed("Attendance capture cancelled");
        }
        if report.recognized.is_empty() && !self.record_absent_when_empty {
            return Outcome::failed(MSG_NOTHING_RECOGNIZED);
        }

        match reconcile::reconcile(&self.store, &roster, &report.recognized, Some(camera.id), date, time).await {
            Ok(_) => Outcome::ok(MSG_SUCCESS),
            Err(e) => {
                tracing::error!(camera_id, course_id, error = %e, "attendance write failed");
                Outcome::failed(e.to_string())
            }
        }
    }
}
