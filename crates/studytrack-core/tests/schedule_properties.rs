//! Property tests for block scheduling.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use studytrack_core::schedule::windows_intersect;
use studytrack_core::{
    Activity, AssignmentCommand, CoreError, RosterStore, ScheduleService, SqliteStore, Student,
};

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 6, 1, 8, 0, 0).unwrap()
}

fn setup() -> (ScheduleService, String, String) {
    let store = Arc::new(SqliteStore::open_memory().unwrap());
    let student = Student::new("Prop", None);
    store.upsert_student(&student).unwrap();
    let activity = Activity::new("Practice", true);
    store.upsert_activity(&activity).unwrap();
    (ScheduleService::new(store), student.id, activity.id)
}

fn command(student_id: &str, activity_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> AssignmentCommand {
    AssignmentCommand {
        student_id: student_id.to_string(),
        title: "Block".into(),
        activity_id: activity_id.to_string(),
        start,
        end,
        actor_id: "prop".into(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn accepted_blocks_never_intersect(
        windows in prop::collection::vec((0i64..600, 1i64..120), 1..25)
    ) {
        let (service, student_id, activity_id) = setup();
        let now = base() - Duration::hours(1);

        for (offset, length) in windows {
            let start = base() + Duration::minutes(offset);
            let end = start + Duration::minutes(length);
            match service.assign(command(&student_id, &activity_id, start, end), now) {
                Ok(_) | Err(CoreError::Conflict { .. }) => {}
                Err(other) => prop_assert!(false, "unexpected error: {other}"),
            }
        }

        let blocks = service
            .query_overlapping(&student_id, base(), base() + Duration::hours(12))
            .unwrap();
        for (i, a) in blocks.iter().enumerate() {
            for b in &blocks[i + 1..] {
                prop_assert!(!windows_intersect(a.start, a.end, b.start, b.end));
            }
        }
    }

    #[test]
    fn conflicting_assignment_is_rejected_with_the_clash(
        offset in 0i64..600,
        length in 1i64..120,
        shift in -119i64..119,
    ) {
        let (service, student_id, activity_id) = setup();
        let now = base() - Duration::hours(1);
        let start = base() + Duration::hours(2) + Duration::minutes(offset);
        let end = start + Duration::minutes(length);
        let first = service.assign(command(&student_id, &activity_id, start, end), now).unwrap();

        let other_start = start + Duration::minutes(shift);
        let other_end = other_start + Duration::minutes(length);
        prop_assume!(windows_intersect(start, end, other_start, other_end));

        match service.assign(command(&student_id, &activity_id, other_start, other_end), now) {
            Err(CoreError::Conflict { existing_id, .. }) => prop_assert_eq!(existing_id, first.id),
            other => prop_assert!(false, "expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn assigned_block_reads_back_unchanged(
        offset in 0i64..10_000,
        length in 1i64..600,
        millis in 0i64..1000,
    ) {
        let (service, student_id, activity_id) = setup();
        let start = base() + Duration::minutes(offset) + Duration::milliseconds(millis);
        let end = start + Duration::minutes(length);
        let block = service
            .assign(command(&student_id, &activity_id, start, end), base() - Duration::hours(1))
            .unwrap();

        let found = service.query_by_student_range(&student_id, start, end).unwrap();
        prop_assert_eq!(found, vec![block]);
    }
}
