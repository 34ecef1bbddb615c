//! SQLite implementation of the store contracts.
//!
//! One connection guarded by a mutex; every call is a short critical section.
//! Each SQL statement executed counts as one backend round trip, exposed via
//! [`SqliteStore::round_trips`] so callers can assert query counts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{
    migrations, AttendanceStore, CorruptRow, Fetched, RosterStore, ScheduleStore, MAX_BATCH_IDS,
};
use crate::attendance::AttendanceInterval;
use crate::error::{CoreError, DatabaseError, Result};
use crate::notify::NotificationKind;
use crate::roster::{Activity, Guardian, Student};
use crate::schedule::ScheduledBlock;

const BLOCK_COLUMNS: &str = "id, student_id, title, activity_id, start_at, end_at, assigned_by";
const INTERVAL_COLUMNS: &str = "id, student_id, linked_block_id, start_at, end_at, source";
const JOINED_INTERVAL_COLUMNS: &str =
    "i.id, i.student_id, i.linked_block_id, i.start_at, i.end_at, i.source";

// === Helper Functions ===

/// Format a timestamp for storage. Fixed width, so lexical order is time order.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(value: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| format!("invalid timestamp '{value}': {err}"))
}

/// `?, ?, ?` for an IN list of `n` values.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

struct RawBlock {
    id: String,
    student_id: String,
    title: String,
    activity_id: String,
    start_at: String,
    end_at: String,
    assigned_by: String,
}

impl RawBlock {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            student_id: row.get(1)?,
            title: row.get(2)?,
            activity_id: row.get(3)?,
            start_at: row.get(4)?,
            end_at: row.get(5)?,
            assigned_by: row.get(6)?,
        })
    }

    fn corrupt(&self, column: &'static str, reason: String) -> CorruptRow {
        CorruptRow {
            student_id: self.student_id.clone(),
            row_id: self.id.clone(),
            column,
            reason,
        }
    }

    fn decode(self) -> Fetched<ScheduledBlock> {
        let start = parse_ts(&self.start_at).map_err(|r| self.corrupt("start_at", r))?;
        let end = parse_ts(&self.end_at).map_err(|r| self.corrupt("end_at", r))?;
        Ok(ScheduledBlock {
            id: self.id,
            student_id: self.student_id,
            title: self.title,
            activity_id: self.activity_id,
            start,
            end,
            assigned_by: self.assigned_by,
        })
    }
}

struct RawInterval {
    id: String,
    student_id: String,
    linked_block_id: Option<String>,
    start_at: String,
    end_at: Option<String>,
    source: String,
}

impl RawInterval {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            student_id: row.get(1)?,
            linked_block_id: row.get(2)?,
            start_at: row.get(3)?,
            end_at: row.get(4)?,
            source: row.get(5)?,
        })
    }

    fn corrupt(&self, column: &'static str, reason: String) -> CorruptRow {
        CorruptRow {
            student_id: self.student_id.clone(),
            row_id: self.id.clone(),
            column,
            reason,
        }
    }

    fn decode(self) -> Fetched<AttendanceInterval> {
        let start = parse_ts(&self.start_at).map_err(|r| self.corrupt("start_at", r))?;
        let end = match self.end_at.as_deref() {
            Some(raw) => Some(parse_ts(raw).map_err(|r| self.corrupt("end_at", r))?),
            None => None,
        };
        Ok(AttendanceInterval {
            id: self.id,
            student_id: self.student_id,
            linked_block_id: self.linked_block_id,
            start,
            end,
            source: self.source,
        })
    }
}

fn row_to_student(row: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: row.get(0)?,
        name: row.get(1)?,
        external_id: row.get(2)?,
        enrolled: row.get(3)?,
    })
}

fn row_to_guardian(row: &Row<'_>) -> rusqlite::Result<Guardian> {
    Ok(Guardian {
        id: row.get(0)?,
        student_id: row.get(1)?,
        name: row.get(2)?,
    })
}

fn row_to_activity(row: &Row<'_>) -> rusqlite::Result<Activity> {
    Ok(Activity {
        id: row.get(0)?,
        name: row.get(1)?,
        assignable: row.get(2)?,
    })
}

fn query_blocks<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Fetched<ScheduledBlock>>> {
    let mut stmt = conn.prepare(sql)?;
    let raws = stmt
        .query_map(params, RawBlock::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(raws.into_iter().map(RawBlock::decode).collect())
}

fn query_intervals<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Fetched<AttendanceInterval>>> {
    let mut stmt = conn.prepare(sql)?;
    let raws = stmt
        .query_map(params, RawInterval::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(raws.into_iter().map(RawInterval::decode).collect())
}

/// Turn batched rows into a strict result: the first corrupt row fails the call.
fn strict<T>(rows: Vec<Fetched<T>>) -> Result<Vec<T>> {
    rows.into_iter()
        .map(|row| row.map_err(CoreError::from))
        .collect()
}

/// SQLite-backed store for blocks, intervals and the roster.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    round_trips: AtomicU64,
}

impl SqliteStore {
    /// Open (or create) the database file at `path` and bring the schema up to date.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|source| DatabaseError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::init(conn)
    }

    /// Open an in-memory database (for tests and dry runs).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        migrations::migrate(&conn).map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            round_trips: AtomicU64::new(0),
        })
    }

    /// Number of SQL statements executed since open or the last reset.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Relaxed)
    }

    pub fn reset_round_trips(&self) {
        self.round_trips.store(0, Ordering::Relaxed);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CoreError::Database(DatabaseError::Poisoned))
    }

    fn trip(&self, n: u64) {
        self.round_trips.fetch_add(n, Ordering::Relaxed);
    }

    /// Run raw SQL against the connection (tests that need to plant bad rows).
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }
}

impl ScheduleStore for SqliteStore {
    fn insert_block(&self, block: &ScheduledBlock) -> Result<()> {
        let conn = self.lock()?;
        self.trip(1);
        conn.execute(
            "INSERT INTO scheduled_blocks (id, student_id, title, activity_id, start_at, end_at, assigned_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                block.id,
                block.student_id,
                block.title,
                block.activity_id,
                fmt_ts(block.start),
                fmt_ts(block.end),
                block.assigned_by,
            ],
        )?;
        Ok(())
    }

    fn update_block(&self, block: &ScheduledBlock) -> Result<bool> {
        let conn = self.lock()?;
        self.trip(1);
        let changed = conn.execute(
            "UPDATE scheduled_blocks
             SET title = ?2, activity_id = ?3, start_at = ?4, end_at = ?5
             WHERE id = ?1",
            params![
                block.id,
                block.title,
                block.activity_id,
                fmt_ts(block.start),
                fmt_ts(block.end),
            ],
        )?;
        Ok(changed > 0)
    }

    fn delete_block(&self, id: &str) -> Result<Option<usize>> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        self.trip(2);
        let unlinked = tx.execute(
            "UPDATE attendance_intervals SET linked_block_id = NULL WHERE linked_block_id = ?1",
            params![id],
        )?;
        let deleted = tx.execute("DELETE FROM scheduled_blocks WHERE id = ?1", params![id])?;
        if deleted == 0 {
            // Dropping the transaction rolls it back.
            return Ok(None);
        }
        tx.commit()?;
        debug!(block_id = id, unlinked, "deleted block");
        Ok(Some(unlinked))
    }

    fn get_block(&self, id: &str) -> Result<Option<ScheduledBlock>> {
        let conn = self.lock()?;
        self.trip(1);
        let raw = conn
            .query_row(
                &format!("SELECT {BLOCK_COLUMNS} FROM scheduled_blocks WHERE id = ?1"),
                params![id],
                RawBlock::from_row,
            )
            .optional()?;
        raw.map(|r| r.decode().map_err(CoreError::from)).transpose()
    }

    fn blocks_within(
        &self,
        student_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ScheduledBlock>> {
        let conn = self.lock()?;
        self.trip(1);
        strict(query_blocks(
            &conn,
            &format!(
                "SELECT {BLOCK_COLUMNS} FROM scheduled_blocks
                 WHERE student_id = ?1 AND start_at >= ?2 AND end_at <= ?3
                 ORDER BY start_at, id"
            ),
            params![student_id, fmt_ts(start), fmt_ts(end)],
        )?)
    }

    fn blocks_overlapping(
        &self,
        student_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude_id: Option<&str>,
    ) -> Result<Vec<ScheduledBlock>> {
        let conn = self.lock()?;
        self.trip(1);
        strict(query_blocks(
            &conn,
            &format!(
                "SELECT {BLOCK_COLUMNS} FROM scheduled_blocks
                 WHERE student_id = ?1 AND start_at <= ?3 AND end_at >= ?2
                   AND (?4 IS NULL OR id != ?4)
                 ORDER BY start_at, id"
            ),
            params![student_id, fmt_ts(start), fmt_ts(end), exclude_id],
        )?)
    }

    fn blocks_starting_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ScheduledBlock>> {
        let conn = self.lock()?;
        self.trip(1);
        strict(query_blocks(
            &conn,
            &format!(
                "SELECT {BLOCK_COLUMNS} FROM scheduled_blocks
                 WHERE start_at >= ?1 AND start_at <= ?2
                 ORDER BY start_at, id"
            ),
            params![fmt_ts(from), fmt_ts(to)],
        )?)
    }

    fn blocks_for_students(
        &self,
        student_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Fetched<ScheduledBlock>>> {
        if student_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        self.trip(1);
        let sql = format!(
            "SELECT {BLOCK_COLUMNS} FROM scheduled_blocks
             WHERE student_id IN ({}) AND start_at <= ? AND end_at >= ?
             ORDER BY student_id, start_at, id",
            placeholders(student_ids.len())
        );
        let mut values: Vec<String> = student_ids.to_vec();
        values.push(fmt_ts(end));
        values.push(fmt_ts(start));
        query_blocks(&conn, &sql, params_from_iter(values))
    }
}

impl AttendanceStore for SqliteStore {
    fn insert_interval(&self, interval: &AttendanceInterval) -> Result<()> {
        let conn = self.lock()?;
        self.trip(1);
        conn.execute(
            "INSERT INTO attendance_intervals (id, student_id, linked_block_id, start_at, end_at, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                interval.id,
                interval.student_id,
                interval.linked_block_id,
                fmt_ts(interval.start),
                interval.end.map(fmt_ts),
                interval.source,
            ],
        )?;
        Ok(())
    }

    fn get_interval(&self, id: &str) -> Result<Option<AttendanceInterval>> {
        let conn = self.lock()?;
        self.trip(1);
        let raw = conn
            .query_row(
                &format!("SELECT {INTERVAL_COLUMNS} FROM attendance_intervals WHERE id = ?1"),
                params![id],
                RawInterval::from_row,
            )
            .optional()?;
        raw.map(|r| r.decode().map_err(CoreError::from)).transpose()
    }

    fn close_interval(&self, id: &str, end: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        self.trip(1);
        conn.execute(
            "UPDATE attendance_intervals SET end_at = ?2 WHERE id = ?1",
            params![id, fmt_ts(end)],
        )?;
        Ok(())
    }

    fn insert_linked_interval(&self, interval: &AttendanceInterval) -> Result<Option<String>> {
        let conn = self.lock()?;
        self.trip(1);
        let linked = conn.query_row(
            "INSERT INTO attendance_intervals (id, student_id, linked_block_id, start_at, end_at, source)
             SELECT ?1, ?2, (SELECT id FROM scheduled_blocks WHERE id = ?3), ?4, ?5, ?6
             RETURNING linked_block_id",
            params![
                interval.id,
                interval.student_id,
                interval.linked_block_id,
                fmt_ts(interval.start),
                interval.end.map(fmt_ts),
                interval.source,
            ],
            |row| row.get(0),
        )?;
        Ok(linked)
    }

    fn link_interval(&self, id: &str, block_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        self.trip(1);
        let changed = conn.execute(
            "UPDATE attendance_intervals SET linked_block_id = ?2
             WHERE id = ?1 AND EXISTS (SELECT 1 FROM scheduled_blocks WHERE id = ?2)",
            params![id, block_id],
        )?;
        Ok(changed > 0)
    }

    fn split_interval(
        &self,
        closing_id: &str,
        at: DateTime<Utc>,
        opened: &AttendanceInterval,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        self.trip(1);
        let inserted = tx.execute(
            "INSERT INTO attendance_intervals (id, student_id, linked_block_id, start_at, end_at, source)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6
             WHERE ?3 IS NULL OR EXISTS (SELECT 1 FROM scheduled_blocks WHERE id = ?3)",
            params![
                opened.id,
                opened.student_id,
                opened.linked_block_id,
                fmt_ts(opened.start),
                opened.end.map(fmt_ts),
                opened.source,
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }
        self.trip(1);
        tx.execute(
            "UPDATE attendance_intervals SET end_at = ?2 WHERE id = ?1 AND end_at IS NULL",
            params![closing_id, fmt_ts(at)],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn open_intervals(&self, student_id: &str) -> Result<Vec<AttendanceInterval>> {
        let conn = self.lock()?;
        self.trip(1);
        strict(query_intervals(
            &conn,
            &format!(
                "SELECT {INTERVAL_COLUMNS} FROM attendance_intervals
                 WHERE student_id = ?1 AND end_at IS NULL
                 ORDER BY start_at DESC, id DESC"
            ),
            params![student_id],
        )?)
    }

    fn intervals_for_block(&self, block_id: &str) -> Result<Vec<AttendanceInterval>> {
        let conn = self.lock()?;
        self.trip(1);
        strict(query_intervals(
            &conn,
            &format!(
                "SELECT {INTERVAL_COLUMNS} FROM attendance_intervals
                 WHERE linked_block_id = ?1
                 ORDER BY start_at, id"
            ),
            params![block_id],
        )?)
    }

    fn linked_counts(&self, block_ids: &[String]) -> Result<HashMap<String, usize>> {
        let conn = self.lock()?;
        let mut counts = HashMap::new();
        for batch in block_ids.chunks(MAX_BATCH_IDS) {
            self.trip(1);
            let sql = format!(
                "SELECT linked_block_id, COUNT(*) FROM attendance_intervals
                 WHERE linked_block_id IN ({})
                 GROUP BY linked_block_id",
                placeholders(batch.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(batch.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (block_id, count) = row?;
                counts.insert(block_id, usize::try_from(count).unwrap_or(0));
            }
        }
        Ok(counts)
    }

    fn linked_intervals_for_students(
        &self,
        student_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Fetched<AttendanceInterval>>> {
        if student_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        self.trip(1);
        let sql = format!(
            "SELECT {JOINED_INTERVAL_COLUMNS} FROM attendance_intervals i
             JOIN scheduled_blocks b ON b.id = i.linked_block_id
             WHERE b.student_id IN ({}) AND b.start_at <= ? AND b.end_at >= ?
             ORDER BY i.linked_block_id, i.start_at, i.id",
            placeholders(student_ids.len())
        );
        let mut values: Vec<String> = student_ids.to_vec();
        values.push(fmt_ts(end));
        values.push(fmt_ts(start));
        query_intervals(&conn, &sql, params_from_iter(values))
    }

    fn unlinked_intervals_for_students(
        &self,
        student_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Fetched<AttendanceInterval>>> {
        if student_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        self.trip(1);
        let sql = format!(
            "SELECT {INTERVAL_COLUMNS} FROM attendance_intervals
             WHERE student_id IN ({}) AND linked_block_id IS NULL
               AND start_at <= ? AND (end_at IS NULL OR end_at >= ?)
             ORDER BY student_id, start_at, id",
            placeholders(student_ids.len())
        );
        let mut values: Vec<String> = student_ids.to_vec();
        values.push(fmt_ts(end));
        values.push(fmt_ts(start));
        query_intervals(&conn, &sql, params_from_iter(values))
    }

    fn claim_alert(&self, block_id: &str, kind: NotificationKind, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        self.trip(1);
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO alert_ledger (block_id, kind, emitted_at) VALUES (?1, ?2, ?3)",
            params![block_id, kind.as_str(), fmt_ts(at)],
        )?;
        Ok(inserted == 1)
    }
}

impl RosterStore for SqliteStore {
    fn upsert_student(&self, student: &Student) -> Result<()> {
        let conn = self.lock()?;
        self.trip(1);
        conn.execute(
            "INSERT INTO students (id, name, external_id, enrolled) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                external_id = excluded.external_id,
                enrolled = excluded.enrolled",
            params![student.id, student.name, student.external_id, student.enrolled],
        )?;
        Ok(())
    }

    fn get_student(&self, id: &str) -> Result<Option<Student>> {
        let conn = self.lock()?;
        self.trip(1);
        Ok(conn
            .query_row(
                "SELECT id, name, external_id, enrolled FROM students WHERE id = ?1",
                params![id],
                row_to_student,
            )
            .optional()?)
    }

    fn student_by_external_id(&self, external_id: &str) -> Result<Option<Student>> {
        let conn = self.lock()?;
        self.trip(1);
        Ok(conn
            .query_row(
                "SELECT id, name, external_id, enrolled FROM students WHERE external_id = ?1",
                params![external_id],
                row_to_student,
            )
            .optional()?)
    }

    fn enrolled_students(&self) -> Result<Vec<Student>> {
        let conn = self.lock()?;
        self.trip(1);
        let mut stmt = conn.prepare(
            "SELECT id, name, external_id, enrolled FROM students
             WHERE enrolled = 1
             ORDER BY name, id",
        )?;
        let students = stmt
            .query_map([], row_to_student)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(students)
    }

    fn insert_guardian(&self, guardian: &Guardian) -> Result<()> {
        let conn = self.lock()?;
        self.trip(1);
        conn.execute(
            "INSERT INTO guardians (id, student_id, name) VALUES (?1, ?2, ?3)",
            params![guardian.id, guardian.student_id, guardian.name],
        )?;
        Ok(())
    }

    fn guardians_for(&self, student_ids: &[String]) -> Result<Vec<Guardian>> {
        if student_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        self.trip(1);
        let sql = format!(
            "SELECT id, student_id, name FROM guardians
             WHERE student_id IN ({})
             ORDER BY student_id, name, id",
            placeholders(student_ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let guardians = stmt
            .query_map(params_from_iter(student_ids.iter()), row_to_guardian)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(guardians)
    }

    fn upsert_activity(&self, activity: &Activity) -> Result<()> {
        let conn = self.lock()?;
        self.trip(1);
        conn.execute(
            "INSERT INTO activities (id, name, assignable) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                assignable = excluded.assignable",
            params![activity.id, activity.name, activity.assignable],
        )?;
        Ok(())
    }

    fn get_activity(&self, id: &str) -> Result<Option<Activity>> {
        let conn = self.lock()?;
        self.trip(1);
        Ok(conn
            .query_row(
                "SELECT id, name, assignable FROM activities WHERE id = ?1",
                params![id],
                row_to_activity,
            )
            .optional()?)
    }

    fn activities_by_ids(&self, ids: &[String]) -> Result<Vec<Activity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        self.trip(1);
        let sql = format!(
            "SELECT id, name, assignable FROM activities WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let activities = stmt
            .query_map(params_from_iter(ids.iter()), row_to_activity)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(activities)
    }
}
