//! Cohort-wide status view for dashboards.
//!
//! Everything is fetched with id-batched queries, partitioned into chunks of
//! `chunk_size` students: one roster query, then per chunk one query each for
//! guardians, blocks, activities, linked intervals and unlinked intervals.
//! The number of round trips depends on the chunk count, never on how many
//! students a chunk holds.
//!
//! No reconciliation locks are taken. A row may be slightly stale but is
//! always built from committed data. Rows that cannot be decoded, and open
//! interval counts above one, are reported in that student's `issues`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::attendance::AttendanceInterval;
use crate::error::Result;
use crate::roster::{Guardian, Student};
use crate::schedule::{windows_intersect, ScheduledBlock};
use crate::storage::{AttendanceStore, CorruptRow, RosterStore, ScheduleStore, Store};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CohortStatus {
    Attending,
    Absent,
    NoAssignedTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockAttendance {
    #[serde(flatten)]
    pub block: ScheduledBlock,
    /// `None` when the activity no longer exists.
    pub activity_name: Option<String>,
    pub intervals: Vec<AttendanceInterval>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentRow {
    pub student_id: String,
    pub name: String,
    pub guardians: Vec<Guardian>,
    pub blocks: Vec<BlockAttendance>,
    /// Attendance in range that is not linked to any block.
    pub unlinked: Vec<AttendanceInterval>,
    pub status: CohortStatus,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CohortStatusView {
    pub generated_at: DateTime<Utc>,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub rows: Vec<StudentRow>,
}

impl CohortStatusView {
    pub fn count(&self, status: CohortStatus) -> usize {
        self.rows.iter().filter(|r| r.status == status).count()
    }
}

pub struct MonitoringAggregator {
    store: Arc<dyn Store>,
    chunk_size: usize,
}

impl MonitoringAggregator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_chunk_size(store, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(store: Arc<dyn Store>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Status of every enrolled student relative to `now`, with the blocks and
    /// attendance intersecting `[range_start, range_end]`.
    pub fn query_cohort_status(
        &self,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CohortStatusView> {
        let students = self.store.enrolled_students()?;
        let mut rows = Vec::with_capacity(students.len());
        for chunk in students.chunks(self.chunk_size) {
            rows.extend(self.build_chunk(chunk, range_start, range_end, now)?);
        }

        debug!(students = rows.len(), "cohort status computed");
        Ok(CohortStatusView {
            generated_at: now,
            range_start,
            range_end,
            rows,
        })
    }

    fn build_chunk(
        &self,
        students: &[Student],
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<StudentRow>> {
        let ids: Vec<String> = students.iter().map(|s| s.id.clone()).collect();
        let mut issues: HashMap<String, Vec<String>> = HashMap::new();

        let mut guardians: HashMap<String, Vec<Guardian>> = HashMap::new();
        for guardian in self.store.guardians_for(&ids)? {
            guardians.entry(guardian.student_id.clone()).or_default().push(guardian);
        }

        // Widen the block window so the covers-now check sees blocks outside the range.
        let fetch_start = range_start.min(now);
        let fetch_end = range_end.max(now);
        let mut blocks: Vec<ScheduledBlock> = Vec::new();
        for fetched in self.store.blocks_for_students(&ids, fetch_start, fetch_end)? {
            match fetched {
                Ok(block) => blocks.push(block),
                Err(corrupt) => note_corrupt(&mut issues, "block", corrupt),
            }
        }

        let activity_ids: Vec<String> = blocks
            .iter()
            .map(|b| b.activity_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let activity_names: HashMap<String, String> = if activity_ids.is_empty() {
            HashMap::new()
        } else {
            self.store
                .activities_by_ids(&activity_ids)?
                .into_iter()
                .map(|a| (a.id, a.name))
                .collect()
        };

        // Same window as the blocks, keyed by student, so one statement covers any block count.
        let mut linked: HashMap<String, Vec<AttendanceInterval>> = HashMap::new();
        for fetched in self
            .store
            .linked_intervals_for_students(&ids, fetch_start, fetch_end)?
        {
            match fetched {
                Ok(interval) => {
                    if let Some(block_id) = interval.linked_block_id.clone() {
                        linked.entry(block_id).or_default().push(interval);
                    }
                }
                Err(corrupt) => note_corrupt(&mut issues, "interval", corrupt),
            }
        }

        let mut unlinked: HashMap<String, Vec<AttendanceInterval>> = HashMap::new();
        for fetched in self
            .store
            .unlinked_intervals_for_students(&ids, range_start, range_end)?
        {
            match fetched {
                Ok(interval) => unlinked
                    .entry(interval.student_id.clone())
                    .or_default()
                    .push(interval),
                Err(corrupt) => note_corrupt(&mut issues, "interval", corrupt),
            }
        }

        let mut blocks_by_student: HashMap<String, Vec<ScheduledBlock>> = HashMap::new();
        for block in blocks {
            blocks_by_student
                .entry(block.student_id.clone())
                .or_default()
                .push(block);
        }

        let rows = students
            .iter()
            .map(|student| {
                let student_blocks = blocks_by_student.remove(&student.id).unwrap_or_default();
                let student_unlinked = unlinked.remove(&student.id).unwrap_or_default();
                let mut student_issues = issues.remove(&student.id).unwrap_or_default();

                let status = derive_status(&student_blocks, &linked, now);

                let block_rows: Vec<BlockAttendance> = student_blocks
                    .into_iter()
                    .filter(|b| windows_intersect(b.start, b.end, range_start, range_end))
                    .map(|block| BlockAttendance {
                        activity_name: activity_names.get(&block.activity_id).cloned(),
                        intervals: linked.remove(&block.id).unwrap_or_default(),
                        block,
                    })
                    .collect();

                let open = block_rows
                    .iter()
                    .flat_map(|b| b.intervals.iter())
                    .chain(student_unlinked.iter())
                    .filter(|i| i.is_open())
                    .count();
                if open > 1 {
                    warn!(student_id = %student.id, open, "cohort view found several open intervals");
                    student_issues.push(format!("{open} open intervals"));
                }

                StudentRow {
                    student_id: student.id.clone(),
                    name: student.name.clone(),
                    guardians: guardians.remove(&student.id).unwrap_or_default(),
                    blocks: block_rows,
                    unlinked: student_unlinked,
                    status,
                    issues: student_issues,
                }
            })
            .collect();
        Ok(rows)
    }
}

fn derive_status(
    blocks: &[ScheduledBlock],
    linked: &HashMap<String, Vec<AttendanceInterval>>,
    now: DateTime<Utc>,
) -> CohortStatus {
    let mut covering = blocks.iter().filter(|b| b.covers(now)).peekable();
    if covering.peek().is_none() {
        return CohortStatus::NoAssignedTime;
    }
    let present = covering.any(|block| {
        linked
            .get(&block.id)
            .is_some_and(|intervals| intervals.iter().any(|i| i.covers(now)))
    });
    if present {
        CohortStatus::Attending
    } else {
        CohortStatus::Absent
    }
}

fn note_corrupt(issues: &mut HashMap<String, Vec<String>>, what: &str, row: CorruptRow) {
    warn!(
        student_id = %row.student_id,
        row_id = %row.row_id,
        column = row.column,
        reason = %row.reason,
        "skipping corrupt {what} row"
    );
    issues
        .entry(row.student_id)
        .or_default()
        .push(format!("corrupt {what} {} ({}): {}", row.row_id, row.column, row.reason));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::Activity;
    use crate::storage::SqliteStore;
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 3, 4, h, m, 0).unwrap()
    }

    fn seed_student(store: &SqliteStore, name: &str) -> Student {
        let student = Student::new(name, None);
        store.upsert_student(&student).unwrap();
        student
    }

    fn seed_block(store: &SqliteStore, student: &Student, activity: &Activity, start: DateTime<Utc>, end: DateTime<Utc>) -> ScheduledBlock {
        let block = ScheduledBlock::new(&student.id, "Study", &activity.id, start, end, "tutor");
        store.insert_block(&block).unwrap();
        block
    }

    fn seeded_cohort(n: usize) -> Arc<SqliteStore> {
        seeded_cohort_with_extra_blocks(n, 0)
    }

    /// Every student gets a 10:00 block plus `extra` attended blocks later in the day.
    fn seeded_cohort_with_extra_blocks(n: usize, extra: u32) -> Arc<SqliteStore> {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let activity = Activity::new("Maths", true);
        store.upsert_activity(&activity).unwrap();
        for i in 0..n {
            let student = seed_student(&store, &format!("student-{i}"));
            store.insert_guardian(&Guardian::new(&student.id, "Parent")).unwrap();
            for hour in 0..extra {
                let later = seed_block(&store, &student, &activity, at(12 + hour, 0), at(12 + hour, 45));
                store
                    .insert_interval(&AttendanceInterval {
                        end: Some(at(12 + hour, 40)),
                        ..AttendanceInterval::open(&student.id, Some(later.id), at(12 + hour, 0), "voice")
                    })
                    .unwrap();
            }
            let block = seed_block(&store, &student, &activity, at(10, 0), at(11, 0));
            if i % 2 == 0 {
                store
                    .insert_interval(&AttendanceInterval::open(&student.id, Some(block.id), at(10, 1), "voice"))
                    .unwrap();
            }
            store
                .insert_interval(&AttendanceInterval {
                    end: Some(at(9, 30)),
                    ..AttendanceInterval::open(&student.id, None, at(9, 0), "voice")
                })
                .unwrap();
        }
        store
    }

    #[test]
    fn statuses_follow_the_covering_block() {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let activity = Activity::new("Reading", true);
        store.upsert_activity(&activity).unwrap();

        let present = seed_student(&store, "present");
        let missing = seed_student(&store, "missing");
        let free = seed_student(&store, "free");
        let b1 = seed_block(&store, &present, &activity, at(10, 0), at(11, 0));
        seed_block(&store, &missing, &activity, at(10, 0), at(11, 0));
        seed_block(&store, &free, &activity, at(13, 0), at(14, 0));
        store
            .insert_interval(&AttendanceInterval::open(&present.id, Some(b1.id.clone()), at(10, 2), "voice"))
            .unwrap();

        let aggregator = MonitoringAggregator::new(store.clone());
        let view = aggregator
            .query_cohort_status(at(8, 0), at(18, 0), at(10, 30))
            .unwrap();

        let status_of = |id: &str| view.rows.iter().find(|r| r.student_id == id).unwrap().status;
        assert_eq!(status_of(&present.id), CohortStatus::Attending);
        assert_eq!(status_of(&missing.id), CohortStatus::Absent);
        assert_eq!(status_of(&free.id), CohortStatus::NoAssignedTime);

        let row = view.rows.iter().find(|r| r.student_id == present.id).unwrap();
        assert_eq!(row.blocks.len(), 1);
        assert_eq!(row.blocks[0].activity_name.as_deref(), Some("Reading"));
        assert_eq!(row.blocks[0].intervals.len(), 1);
        assert!(row.issues.is_empty());
    }

    #[test]
    fn closed_interval_that_ended_before_now_is_absent() {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let activity = Activity::new("Reading", true);
        store.upsert_activity(&activity).unwrap();
        let student = seed_student(&store, "left");
        let block = seed_block(&store, &student, &activity, at(10, 0), at(11, 0));
        store
            .insert_interval(&AttendanceInterval {
                end: Some(at(10, 20)),
                ..AttendanceInterval::open(&student.id, Some(block.id), at(10, 0), "voice")
            })
            .unwrap();

        let view = MonitoringAggregator::new(store.clone())
            .query_cohort_status(at(10, 0), at(11, 0), at(10, 30))
            .unwrap();
        assert_eq!(view.rows[0].status, CohortStatus::Absent);
    }

    #[test]
    fn now_outside_the_range_still_drives_status() {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let activity = Activity::new("Reading", true);
        store.upsert_activity(&activity).unwrap();
        let student = seed_student(&store, "busy");
        seed_block(&store, &student, &activity, at(10, 0), at(11, 0));

        let view = MonitoringAggregator::new(store.clone())
            .query_cohort_status(at(14, 0), at(15, 0), at(10, 30))
            .unwrap();
        assert_eq!(view.rows[0].status, CohortStatus::Absent);
        assert!(view.rows[0].blocks.is_empty());
    }

    #[test]
    fn round_trips_do_not_grow_with_cohort_size() {
        let small = seeded_cohort(3);
        let large = seeded_cohort(1000);
        let now = at(10, 30);

        small.reset_round_trips();
        let small_view = MonitoringAggregator::new(small.clone())
            .query_cohort_status(at(8, 0), at(12, 0), now)
            .unwrap();
        large.reset_round_trips();
        let large_view = MonitoringAggregator::new(large.clone())
            .query_cohort_status(at(8, 0), at(12, 0), now)
            .unwrap();

        assert_eq!(small_view.rows.len(), 3);
        assert_eq!(large_view.rows.len(), 1000);
        assert_eq!(small.round_trips(), large.round_trips());
        assert_eq!(large.round_trips(), 6);
        assert_eq!(large_view.count(CohortStatus::Attending), 500);
        assert_eq!(large_view.count(CohortStatus::Absent), 500);
        assert!(large_view.rows.iter().all(|r| r.unlinked.len() == 1 && r.guardians.len() == 1));
    }

    #[test]
    fn round_trips_do_not_grow_with_blocks_per_student() {
        let small = seeded_cohort_with_extra_blocks(3, 2);
        let large = seeded_cohort_with_extra_blocks(1000, 2);
        let now = at(10, 30);

        small.reset_round_trips();
        MonitoringAggregator::new(small.clone())
            .query_cohort_status(at(8, 0), at(18, 0), now)
            .unwrap();
        large.reset_round_trips();
        let view = MonitoringAggregator::new(large.clone())
            .query_cohort_status(at(8, 0), at(18, 0), now)
            .unwrap();

        assert_eq!(small.round_trips(), 6);
        assert_eq!(large.round_trips(), 6);
        assert!(view.rows.iter().all(|r| r.blocks.len() == 3));
        assert!(view
            .rows
            .iter()
            .all(|r| r.blocks.iter().filter(|b| b.intervals.len() == 1).count() >= 2));
    }

    #[test]
    fn round_trips_scale_with_chunks_not_students() {
        let store = seeded_cohort(1000);
        store.reset_round_trips();
        MonitoringAggregator::with_chunk_size(store.clone(), 100)
            .query_cohort_status(at(8, 0), at(12, 0), at(10, 30))
            .unwrap();
        assert_eq!(store.round_trips(), 1 + 5 * 10);
    }

    #[test]
    fn corrupt_row_degrades_only_its_student() {
        let store = seeded_cohort(2);
        let victim = store.enrolled_students().unwrap()[0].id.clone();
        store
            .execute_raw(&format!(
                "INSERT INTO scheduled_blocks (id, student_id, title, activity_id, start_at, end_at, assigned_by)
                 VALUES ('broken', '{victim}', 'x', 'a', '2030-03-04T10:00:00.000000000Zjunk', '2030-03-04T16:00:00.000000000Z', 't')"
            ))
            .unwrap();

        let view = MonitoringAggregator::new(store.clone())
            .query_cohort_status(at(8, 0), at(18, 0), at(10, 30))
            .unwrap();
        assert_eq!(view.rows.len(), 2);
        for row in &view.rows {
            if row.student_id == victim {
                assert_eq!(row.issues.len(), 1);
                assert!(row.issues[0].contains("broken"));
            } else {
                assert!(row.issues.is_empty());
            }
            assert_eq!(row.blocks.len(), 1);
        }
    }

    #[test]
    fn several_open_intervals_are_flagged() {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let student = seed_student(&store, "double");
        for start in [at(9, 0), at(9, 10)] {
            store
                .insert_interval(&AttendanceInterval::open(&student.id, None, start, "voice"))
                .unwrap();
        }

        let view = MonitoringAggregator::new(store.clone())
            .query_cohort_status(at(8, 0), at(12, 0), at(9, 30))
            .unwrap();
        assert_eq!(view.rows[0].issues, vec!["2 open intervals".to_string()]);
        assert_eq!(view.rows[0].status, CohortStatus::NoAssignedTime);
    }

    #[test]
    fn unenrolled_students_are_left_out() {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let mut gone = seed_student(&store, "gone");
        gone.enrolled = false;
        store.upsert_student(&gone).unwrap();
        seed_student(&store, "here");

        let view = MonitoringAggregator::new(store.clone())
            .query_cohort_status(at(8, 0), at(12, 0), at(9, 0) + Duration::minutes(1))
            .unwrap();
        assert_eq!(view.rows.len(), 1);
        assert_eq!(view.rows[0].name, "here");
    }

    #[test]
    fn view_serializes_status_in_screaming_case() {
        let view = CohortStatusView {
            generated_at: at(9, 0),
            range_start: at(8, 0),
            range_end: at(10, 0),
            rows: Vec::new(),
        };
        let json = serde_json::to_value(&view).unwrap();
        assert!(json["rows"].as_array().unwrap().is_empty());
        assert_eq!(
            serde_json::to_string(&CohortStatus::NoAssignedTime).unwrap(),
            "\"NO_ASSIGNED_TIME\""
        );
    }
}
