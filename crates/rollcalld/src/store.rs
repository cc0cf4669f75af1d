//! SQLite persistence for rosters, cameras, schedules and attendance.

use crate::model::{
    AttendanceRecord, AttendanceStatus, CameraRecord, Course, ExpiredSchedule, ScheduleEntry, DATE_FORMAT,
    TIME_FORMAT,
};
use crate::window::DueWindow;
use chrono::{Local, NaiveDate, NaiveTime};
use rollcall_core::{RosterMember, StudentId};
use rusqlite::types::Type;
use rusqlite::{params, Row, Transaction};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

const CURRENT_SCHEMA_VERSION: i32 = 1;

const SCHEDULE_COLUMNS: &str = "id, camera_id, course_id, date, time, created_at, attempts, last_error";

const UPSERT_ATTENDANCE: &str = "INSERT INTO attendance (student_id, camera_id, status, date, timestamp)
     VALUES (?1, ?2, ?3, ?4, ?5)
     ON CONFLICT (student_id, date) DO UPDATE SET
         camera_id = excluded.camera_id,
         status = excluded.status,
         timestamp = excluded.timestamp";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database connection closed")]
    Closed,
    #[error("failed to create database directory {path}: {source}")]
    CreateDir { path: String, source: std::io::Error },
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(e) => StoreError::Sqlite(e),
            tokio_rusqlite::Error::ConnectionClosed => StoreError::Closed,
            tokio_rusqlite::Error::Other(e) => StoreError::Other(e),
            other => StoreError::Other(other.to_string().into()),
        }
    }
}

/// One attendance row to be written by a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceWrite {
    pub student_id: StudentId,
    pub camera_id: Option<i64>,
    pub status: AttendanceStatus,
    pub date: NaiveDate,
    pub timestamp: String,
}

/// Handle to the database; cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: tokio_rusqlite::Connection,
}

impl Store {
    /// Open (creating if needed) the database file and migrate it.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        let store = Self::init(conn).await?;
        tracing::info!(path = %path.display(), "database ready");
        Ok(store)
    }

    async fn init(conn: tokio_rusqlite::Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            if let Err(err) = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0)) {
                tracing::warn!(error = %err, "failed to enable WAL mode");
            }
            conn.pragma_update(None, "foreign_keys", "ON")?;

            let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
            if version > CURRENT_SCHEMA_VERSION {
                return Err(tokio_rusqlite::Error::Other(
                    format!("database version ({version}) is newer than supported schema ({CURRENT_SCHEMA_VERSION})")
                        .into(),
                ));
            }

            let tx = conn.transaction()?;
            for next in version + 1..=CURRENT_SCHEMA_VERSION {
                apply_migration(&tx, next)?;
            }
            tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
            tx.commit()?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    pub async fn camera(&self, id: i64) -> Result<Option<CameraRecord>, StoreError> {
        let found = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT id, location, course_id, address FROM cameras WHERE id = ?1")?;
                let mut rows = stmt.query(params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(CameraRecord {
                        id: row.get(0)?,
                        location: row.get(1)?,
                        course_id: row.get(2)?,
                        address: row.get(3)?,
                    })),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(found)
    }

    pub async fn course(&self, id: i64) -> Result<Option<Course>, StoreError> {
        let found = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT id, name FROM courses WHERE id = ?1")?;
                let mut rows = stmt.query(params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(Course {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(found)
    }

    /// Students of a course, ordered by id.
    pub async fn roster(&self, course_id: i64) -> Result<Vec<RosterMember>, StoreError> {
        let members = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, roll_number, face_id FROM students
                     WHERE course_id = ?1
                     ORDER BY id",
                )?;
                let members = stmt
                    .query_map(params![course_id], |row| {
                        Ok(RosterMember {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            roll_number: row.get(2)?,
                            reference: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(members)
            })
            .await?;
        Ok(members)
    }

    /// Upsert every row on (student, date) inside one transaction.
    ///
    /// Either all rows are written or none are.
    pub async fn write_attendance(&self, writes: Vec<AttendanceWrite>) -> Result<usize, StoreError> {
        let written = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(UPSERT_ATTENDANCE)?;
                    for w in &writes {
                        stmt.execute(params![
                            w.student_id,
                            w.camera_id,
                            w.status.as_str(),
                            w.date.format(DATE_FORMAT).to_string(),
                            w.timestamp,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(writes.len())
            })
            .await?;
        Ok(written)
    }

    /// Manual edit: set only the status of a student's record for a date.
    pub async fn set_attendance(
        &self,
        student_id: StudentId,
        date: NaiveDate,
        status: AttendanceStatus,
    ) -> Result<(), StoreError> {
        let timestamp = Local::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance (student_id, camera_id, status, date, timestamp)
                     VALUES (?1, NULL, ?2, ?3, ?4)
                     ON CONFLICT (student_id, date) DO UPDATE SET status = excluded.status",
                    params![student_id, status.as_str(), date.format(DATE_FORMAT).to_string(), timestamp],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Attendance of a course's students on a date, ordered by student id.
    pub async fn attendance_for_course(&self, course_id: i64, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        let records = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT a.student_id, a.camera_id, a.status, a.date, a.timestamp
                     FROM attendance a JOIN students s ON s.id = a.student_id
                     WHERE s.course_id = ?1 AND a.date = ?2
                     ORDER BY a.student_id",
                )?;
                let records = stmt
                    .query_map(params![course_id, date.format(DATE_FORMAT).to_string()], |row| {
                        let status: String = row.get(2)?;
                        Ok(AttendanceRecord {
                            student_id: row.get(0)?,
                            camera_id: row.get(1)?,
                            status: status
                                .parse()
                                .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?,
                            date: parse_date(row, 3)?,
                            timestamp: row.get(4)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await?;
        Ok(records)
    }

    pub async fn insert_schedule(
        &self,
        camera_id: i64,
        course_id: i64,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<i64, StoreError> {
        let created_at = Local::now().to_rfc3339();
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance_schedules (camera_id, course_id, date, time, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        camera_id,
                        course_id,
                        date.format(DATE_FORMAT).to_string(),
                        time.format(TIME_FORMAT).to_string(),
                        created_at,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    /// All pending entries, newest first.
    pub async fn list_schedules(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM attendance_schedules ORDER BY date DESC, time DESC, id DESC");
        self.query_schedules(sql, Vec::new()).await
    }

    /// Pending entries dated on or before `date`.
    pub async fn schedules_through(&self, date: NaiveDate) -> Result<Vec<ScheduleEntry>, StoreError> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM attendance_schedules WHERE date <= ?1 ORDER BY date, time, id");
        self.query_schedules(sql, vec![date.format(DATE_FORMAT).to_string()]).await
    }

    /// Entries dated on the window's day whose time falls in any of its ranges.
    ///
    /// Each entry appears once even if several ranges match it.
    pub async fn due_schedules(&self, window: &DueWindow) -> Result<Vec<ScheduleEntry>, StoreError> {
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM attendance_schedules
             WHERE date = ?1 AND time >= ?2 AND time <= ?3"
        );
        let date = window.date.format(DATE_FORMAT).to_string();

        let mut due = BTreeMap::new();
        for (start, end) in &window.ranges {
            let rows = self
                .query_schedules(
                    sql.clone(),
                    vec![date.clone(), start.format(TIME_FORMAT).to_string(), end.format(TIME_FORMAT).to_string()],
                )
                .await?;
            for entry in rows {
                due.entry(entry.id).or_insert(entry);
            }
        }

        let mut due: Vec<ScheduleEntry> = due.into_values().collect();
        due.sort_by_key(|e| (e.time, e.id));
        Ok(due)
    }

    async fn query_schedules(&self, sql: String, args: Vec<String>) -> Result<Vec<ScheduleEntry>, StoreError> {
        let entries = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let entries = stmt
                    .query_map(rusqlite::params_from_iter(args.iter()), schedule_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(entries)
            })
            .await?;
        Ok(entries)
    }

    pub async fn record_schedule_failure(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let error = error.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE attendance_schedules SET attempts = attempts + 1, last_error = ?2 WHERE id = ?1",
                    params![id, error],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Returns false if the entry no longer exists.
    pub async fn delete_schedule(&self, id: i64) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM attendance_schedules WHERE id = ?1", params![id])?))
            .await?;
        Ok(deleted > 0)
    }

    /// Move an entry into the archive. Returns false if it was already gone.
    pub async fn expire_schedule(&self, id: i64) -> Result<bool, StoreError> {
        let expired_at = Local::now().to_rfc3339();
        let moved = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let copied = tx.execute(
                    &format!(
                        "INSERT INTO expired_schedules ({SCHEDULE_COLUMNS}, expired_at)
                         SELECT {SCHEDULE_COLUMNS}, ?2 FROM attendance_schedules WHERE id = ?1"
                    ),
                    params![id, expired_at],
                )?;
                tx.execute("DELETE FROM attendance_schedules WHERE id = ?1", params![id])?;
                tx.commit()?;
                Ok(copied > 0)
            })
            .await?;
        Ok(moved)
    }

    pub async fn list_expired(&self) -> Result<Vec<ExpiredSchedule>, StoreError> {
        let expired = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SCHEDULE_COLUMNS}, expired_at FROM expired_schedules ORDER BY date, time, id"
                ))?;
                let expired = stmt
                    .query_map([], |row| {
                        Ok(ExpiredSchedule {
                            entry: schedule_from_row(row)?,
                            expired_at: row.get(8)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(expired)
            })
            .await?;
        Ok(expired)
    }
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> rusqlite::Result<()> {
    match version {
        1 => tx.execute_batch(include_str!("schema/v1.sql")),
        _ => Err(rusqlite::Error::InvalidParameterName(format!(
            "unknown migration target version: {version}"
        ))),
    }
}

fn parse_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, DATE_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveTime> {
    let raw: String = row.get(idx)?;
    NaiveTime::parse_from_str(&raw, TIME_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleEntry> {
    Ok(ScheduleEntry {
        id: row.get(0)?,
        camera_id: row.get(1)?,
        course_id: row.get(2)?,
        date: parse_date(row, 3)?,
        time: parse_time(row, 4)?,
        created_at: row.get(5)?,
        attempts: row.get(6)?,
        last_error: row.get(7)?,
    })
}

/// Test setup; rosters and cameras are managed outside the daemon.
#[cfg(test)]
impl Store {
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(tokio_rusqlite::Connection::open_in_memory().await?).await
    }

    pub async fn insert_course(&self, name: &str) -> Result<i64, StoreError> {
        let name = name.to_string();
        let now = Local::now().to_rfc3339();
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute("INSERT INTO courses (name, created_at) VALUES (?1, ?2)", params![name, now])?;
                Ok(conn.last_insert_rowid())
            })
            .await?)
    }

    pub async fn insert_camera(&self, location: &str, address: &str, course_id: Option<i64>) -> Result<i64, StoreError> {
        let (location, address) = (location.to_string(), address.to_string());
        let now = Local::now().to_rfc3339();
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO cameras (location, course_id, address, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![location, course_id, address, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?)
    }

    pub async fn insert_student(&self, name: &str, course_id: i64, roll_number: &str) -> Result<StudentId, StoreError> {
        let (name, roll_number) = (name.to_string(), roll_number.to_string());
        let now = Local::now().to_rfc3339();
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO students (name, course_id, roll_number, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![name, course_id, roll_number, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?)
    }

    pub async fn delete_camera(&self, id: i64) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM cameras WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn attendance_row_count(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM attendance", [], |row| row.get(0))?))
            .await?)
    }
}
