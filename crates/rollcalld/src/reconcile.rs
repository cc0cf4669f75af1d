//! Turn a recognized-id set into one attendance row per roster member.

use crate::model::AttendanceStatus;
use crate::store::{AttendanceWrite, Store, StoreError};
use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use rollcall_core::{RosterMember, StudentId};
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub present: usize,
    pub absent: usize,
}

/// Rows for every roster member: Present iff recognized, Absent otherwise.
pub fn plan(
    roster: &[RosterMember],
    recognized: &BTreeSet<StudentId>,
    camera_id: Option<i64>,
    date: NaiveDate,
    time: NaiveTime,
) -> Vec<AttendanceWrite> {
    let timestamp = local_timestamp(date, time);
    roster
        .iter()
        .map(|member| AttendanceWrite {
            student_id: member.id,
            camera_id,
            status: if recognized.contains(&member.id) {
                AttendanceStatus::Present
            } else {
                AttendanceStatus::Absent
            },
            date,
            timestamp: timestamp.clone(),
        })
        .collect()
}

/// `date` + `time` in the local timezone, as RFC 3339.
pub fn local_timestamp(date: NaiveDate, time: NaiveTime) -> String {
    let naive = date.and_time(time);
    resolve_wall_clock(naive, |n| Local.from_local_datetime(n).earliest())
        .unwrap_or_else(|| Local.from_utc_datetime(&naive))
        .to_rfc3339()
}

/// Resolve a wall-clock time; a time skipped by a DST jump moves forward by
/// the hour it fell into.
fn resolve_wall_clock<Tz: TimeZone>(
    naive: NaiveDateTime,
    resolve: impl Fn(&NaiveDateTime) -> Option<DateTime<Tz>>,
) -> Option<DateTime<Tz>> {
    resolve(&naive).or_else(|| resolve(&(naive + Duration::hours(1))))
}

/// Write the plan for `roster` in one transaction.
pub async fn reconcile(
    store: &Store,
    roster: &[RosterMember],
    recognized: &BTreeSet<StudentId>,
    camera_id: Option<i64>,
    date: NaiveDate,
    time: NaiveTime,
) -> Result<ReconcileSummary, StoreError> {
    let writes = plan(roster, recognized, camera_id, date, time);
    let present = writes.iter().filter(|w| w.status == AttendanceStatus::Present).count();
    let summary = ReconcileSummary {
        present,
        absent: writes.len() - present,
    };

    store.write_attendance(writes).await?;
    tracing::info!(
        date = %date,
        present = summary.present,
        absent = summary.absent,
        "attendance reconciled"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    fn nine() -> NaiveTime {
        NaiveTime::from_hms_opt(9, 0, 0).unwrap()
    }

    async fn seeded() -> (Store, i64, Vec<RosterMember>) {
        let store = Store::open_in_memory().await.unwrap();
        let course = store.insert_course("Physics").await.unwrap();
        store.insert_student("Ada", course, "1").await.unwrap();
        store.insert_student("Bo", course, "2").await.unwrap();
        store.insert_student("Cy", course, "3").await.unwrap();
        let roster = store.roster(course).await.unwrap();
        (store, course, roster)
    }

    #[test]
    fn test_plan_marks_unrecognized_absent() {
        let roster: Vec<RosterMember> = (1..=3)
            .map(|id| RosterMember {
                id,
                name: String::new(),
                roll_number: id.to_string(),
                reference: None,
            })
            .collect();
        let writes = plan(&roster, &BTreeSet::from([2, 99]), Some(7), day(), nine());

        assert_eq!(writes.len(), 3);
        let statuses: Vec<_> = writes.iter().map(|w| w.status).collect();
        assert_eq!(
            statuses,
            vec![AttendanceStatus::Absent, AttendanceStatus::Present, AttendanceStatus::Absent]
        );
        assert!(writes.iter().all(|w| w.camera_id == Some(7) && w.date == day()));
    }

    #[test]
    fn test_local_timestamp_keeps_wall_clock() {
        let ts = local_timestamp(day(), nine());
        assert!(ts.starts_with("2024-03-04T09:00:00"), "{ts}");
    }

    #[test]
    fn test_skipped_wall_clock_moves_past_the_gap() {
        use chrono::FixedOffset;

        // 02:00..03:00 does not exist; clocks go from +01:00 to +02:00.
        let winter = FixedOffset::east_opt(3600).unwrap();
        let summer = FixedOffset::east_opt(7200).unwrap();
        let gap_start = day().and_hms_opt(2, 0, 0).unwrap();
        let gap_end = day().and_hms_opt(3, 0, 0).unwrap();
        let zone = |n: &NaiveDateTime| {
            if *n < gap_start {
                winter.from_local_datetime(n).earliest()
            } else if *n < gap_end {
                None
            } else {
                summer.from_local_datetime(n).earliest()
            }
        };

        let resolved = resolve_wall_clock(day().and_hms_opt(2, 30, 0).unwrap(), zone).unwrap();
        assert_eq!(resolved.to_rfc3339(), "2024-03-04T03:30:00+02:00");

        let regular = resolve_wall_clock(day().and_hms_opt(1, 30, 0).unwrap(), zone).unwrap();
        assert_eq!(regular.to_rfc3339(), "2024-03-04T01:30:00+01:00");
    }

    #[tokio::test]
    async fn test_one_row_per_member_and_idempotent() {
        let (store, course, roster) = seeded().await;
        let recognized = BTreeSet::from([roster[0].id]);

        let first = reconcile(&store, &roster, &recognized, None, day(), nine()).await.unwrap();
        let after_first = store.attendance_for_course(course, day()).await.unwrap();
        let second = reconcile(&store, &roster, &recognized, None, day(), nine()).await.unwrap();
        let after_second = store.attendance_for_course(course, day()).await.unwrap();

        assert_eq!(first, ReconcileSummary { present: 1, absent: 2 });
        assert_eq!(first, second);
        assert_eq!(after_first.len(), roster.len());
        assert_eq!(after_first, after_second);
        assert_eq!(store.attendance_row_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_later_run_overwrites_status() {
        let (store, course, roster) = seeded().await;
        reconcile(&store, &roster, &BTreeSet::from([roster[0].id]), None, day(), nine())
            .await
            .unwrap();
        reconcile(&store, &roster, &BTreeSet::from([roster[2].id]), None, day(), nine())
            .await
            .unwrap();

        let rows = store.attendance_for_course(course, day()).await.unwrap();
        let present: Vec<_> = rows
            .iter()
            .filter(|r| r.status == AttendanceStatus::Present)
            .map(|r| r.student_id)
            .collect();
        assert_eq!(present, vec![roster[2].id]);
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_partial_roster() {
        let (store, course, mut roster) = seeded().await;
        roster.insert(
            1,
            RosterMember {
                id: 555,
                name: "ghost".into(),
                roll_number: "x".into(),
                reference: None,
            },
        );

        let result = reconcile(&store, &roster, &BTreeSet::new(), None, day(), nine()).await;
        assert!(result.is_err());
        assert!(store.attendance_for_course(course, day()).await.unwrap().is_empty());
    }
}
