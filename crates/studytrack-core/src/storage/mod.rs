//! Store contracts and the SQLite implementation behind them.
//!
//! The engine is written against three traits:
//! - [`ScheduleStore`]: scheduled blocks with overlap and range queries
//! - [`AttendanceStore`]: attendance intervals plus the once-per-block alert ledger
//! - [`RosterStore`]: students, guardians and activities
//!
//! [`Store`] bundles all three so components can share one `Arc<dyn Store>`.

pub mod config;
pub mod migrations;
pub mod sqlite;

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::attendance::AttendanceInterval;
use crate::error::{ConfigError, CoreError, DatabaseError, Result};
use crate::notify::NotificationKind;
use crate::roster::{Activity, Guardian, Student};
use crate::schedule::ScheduledBlock;

pub use config::Config;
pub use sqlite::SqliteStore;

/// Upper bound on ids bound into one `IN (...)` list.
pub const MAX_BATCH_IDS: usize = 1000;

/// A stored row that could not be decoded.
///
/// Batched reads hand these back next to the good rows so one student's bad
/// data degrades only that student's entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptRow {
    pub student_id: String,
    pub row_id: String,
    pub column: &'static str,
    pub reason: String,
}

impl From<CorruptRow> for CoreError {
    fn from(row: CorruptRow) -> Self {
        CoreError::Database(DatabaseError::Corrupt {
            column: row.column,
            message: format!("row {}: {}", row.row_id, row.reason),
        })
    }
}

/// Outcome of decoding one row of a batched read.
pub type Fetched<T> = std::result::Result<T, CorruptRow>;

pub trait ScheduleStore: Send + Sync {
    fn insert_block(&self, block: &ScheduledBlock) -> Result<()>;

    /// Overwrite a block. Returns `false` when no block has that id.
    fn update_block(&self, block: &ScheduledBlock) -> Result<bool>;

    /// Hard-delete a block and null every interval link pointing at it.
    ///
    /// Returns the number of intervals unlinked, or `None` if the block did not exist.
    fn delete_block(&self, id: &str) -> Result<Option<usize>>;

    fn get_block(&self, id: &str) -> Result<Option<ScheduledBlock>>;

    /// Blocks of `student_id` lying entirely inside `[start, end]`, by start.
    fn blocks_within(
        &self,
        student_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ScheduledBlock>>;

    /// Blocks of `student_id` intersecting `[start, end]` (closed), by start.
    fn blocks_overlapping(
        &self,
        student_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude_id: Option<&str>,
    ) -> Result<Vec<ScheduledBlock>>;

    /// Blocks of any student with `from <= start <= to`, by start.
    fn blocks_starting_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ScheduledBlock>>;

    /// Blocks of the given students intersecting `[start, end]`, in one round trip.
    fn blocks_for_students(
        &self,
        student_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Fetched<ScheduledBlock>>>;
}

pub trait AttendanceStore: Send + Sync {
    fn insert_interval(&self, interval: &AttendanceInterval) -> Result<()>;

    fn get_interval(&self, id: &str) -> Result<Option<AttendanceInterval>>;

    fn close_interval(&self, id: &str, end: DateTime<Utc>) -> Result<()>;

    /// Insert a fresh interval, keeping its link only if the block still exists.
    ///
    /// Returns the link as stored.
    fn insert_linked_interval(&self, interval: &AttendanceInterval) -> Result<Option<String>>;

    /// Link an interval to a block. Returns `false`, changing nothing, when
    /// the block or the interval is gone.
    fn link_interval(&self, id: &str, block_id: &str) -> Result<bool>;

    /// Close `closing_id` at `at` and insert `opened`, atomically.
    ///
    /// Returns `false`, writing nothing, when `opened` links a block that no
    /// longer exists.
    fn split_interval(
        &self,
        closing_id: &str,
        at: DateTime<Utc>,
        opened: &AttendanceInterval,
    ) -> Result<bool>;

    /// Every open interval of a student, most recent start first.
    fn open_intervals(&self, student_id: &str) -> Result<Vec<AttendanceInterval>>;

    fn intervals_for_block(&self, block_id: &str) -> Result<Vec<AttendanceInterval>>;

    /// Number of linked intervals per block id; blocks without any are absent.
    ///
    /// Takes any number of ids; they are sent in batches of [`MAX_BATCH_IDS`].
    fn linked_counts(&self, block_ids: &[String]) -> Result<HashMap<String, usize>>;

    /// Intervals linked to blocks of the given students that intersect
    /// `[start, end]`, in one round trip.
    fn linked_intervals_for_students(
        &self,
        student_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Fetched<AttendanceInterval>>>;

    /// Unlinked intervals of the given students intersecting `[start, end]`, in one round trip.
    fn unlinked_intervals_for_students(
        &self,
        student_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Fetched<AttendanceInterval>>>;

    /// Record that a once-per-block alert went out.
    ///
    /// Returns `true` only for the first claim of a `(block_id, kind)` pair.
    fn claim_alert(&self, block_id: &str, kind: NotificationKind, at: DateTime<Utc>) -> Result<bool>;
}

pub trait RosterStore: Send + Sync {
    fn upsert_student(&self, student: &Student) -> Result<()>;

    fn get_student(&self, id: &str) -> Result<Option<Student>>;

    fn student_by_external_id(&self, external_id: &str) -> Result<Option<Student>>;

    fn enrolled_students(&self) -> Result<Vec<Student>>;

    fn insert_guardian(&self, guardian: &Guardian) -> Result<()>;

    /// Guardians of any of `student_ids`, in one round trip.
    fn guardians_for(&self, student_ids: &[String]) -> Result<Vec<Guardian>>;

    fn upsert_activity(&self, activity: &Activity) -> Result<()>;

    fn get_activity(&self, id: &str) -> Result<Option<Activity>>;

    /// Activities with any of `ids`, in one round trip.
    fn activities_by_ids(&self, ids: &[String]) -> Result<Vec<Activity>>;
}

/// Every store contract the engine needs, behind one trait object.
pub trait Store: ScheduleStore + AttendanceStore + RosterStore {}

impl<T: ScheduleStore + AttendanceStore + RosterStore> Store for T {}

/// Returns `~/.config/studytrack[-dev]/` based on STUDYTRACK_ENV.
///
/// Set STUDYTRACK_ENV=dev to use development data directory.
///
/// # Errors
/// Returns an error if creating the config directory fails.
pub fn data_dir() -> Result<PathBuf> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("STUDYTRACK_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("studytrack-dev")
    } else {
        base_dir.join("studytrack")
    };

    std::fs::create_dir_all(&dir)
        .map_err(|e| ConfigError::DataDir(format!("{}: {e}", dir.display())))?;
    Ok(dir)
}
