use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rollcall_core::StudentId;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Course {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraRecord {
    pub id: i64,
    pub location: String,
    pub course_id: Option<i64>,
    /// Device index or stream URL, see `rollcall_hw::CameraAddress`.
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "Present",
            AttendanceStatus::Absent => "Absent",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Present" => Ok(AttendanceStatus::Present),
            "Absent" => Ok(AttendanceStatus::Absent),
            other => Err(format!("unknown attendance status '{other}'")),
        }
    }
}

/// Stored attendance row; unique per (student, date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub student_id: StudentId,
    pub camera_id: Option<i64>,
    pub status: AttendanceStatus,
    pub date: NaiveDate,
    /// RFC 3339, local offset.
    pub timestamp: String,
}

/// A pending promise to capture attendance at `date` `time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleEntry {
    pub id: i64,
    pub camera_id: i64,
    pub course_id: i64,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub created_at: String,
    /// Failed capture attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl ScheduleEntry {
    pub fn scheduled_at(&self) -> NaiveDateTime {
        self.date.and_time(self.time)
    }
}

/// An archived entry whose window passed without a successful capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpiredSchedule {
    pub entry: ScheduleEntry,
    pub expired_at: String,
}
