//! Scheduled study blocks.
//!
//! A [`ScheduledBlock`] is a window a student is expected to attend. Blocks of
//! the same student never intersect.
//!
//! ## Boundary policy
//!
//! Windows are closed intervals `[start, end]`. Two windows that share an
//! endpoint intersect, so back-to-back blocks (10:00-11:00, 11:00-12:00) are a
//! conflict. The same closed-interval rule decides whether a block "covers"
//! an instant, for linking joins and for the cohort status view.

pub mod service;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub use service::{AssignmentCommand, BlockPatch, ScheduleService};

/// Maximum block title length, in characters.
pub const MAX_TITLE_LEN: usize = 100;

/// A scheduled study window assigned to one student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledBlock {
    pub id: String,
    pub student_id: String,
    pub title: String,
    pub activity_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub assigned_by: String,
}

impl ScheduledBlock {
    /// Create a new block with a fresh id.
    pub fn new(
        student_id: impl Into<String>,
        title: impl Into<String>,
        activity_id: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        assigned_by: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            student_id: student_id.into(),
            title: title.into(),
            activity_id: activity_id.into(),
            start,
            end,
            assigned_by: assigned_by.into(),
        }
    }

    /// Whether `at` falls inside this block's window.
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        window_covers(self.start, self.end, at)
    }

    /// Time elapsed since the block started, or zero before the start.
    pub fn elapsed_at(&self, at: DateTime<Utc>) -> Duration {
        (at - self.start).max(Duration::zero())
    }
}

/// Closed-interval intersection test shared by conflict checks and range queries.
pub fn windows_intersect(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start <= b_end && a_end >= b_start
}

/// Closed-interval containment test.
pub fn window_covers(start: DateTime<Utc>, end: DateTime<Utc>, at: DateTime<Utc>) -> bool {
    start <= at && at <= end
}

/// Pick one block out of several that cover the same instant.
///
/// Only reachable when a post-hoc edit produced an intersection; the earliest
/// start wins, ties broken by id.
pub fn earliest_block(mut blocks: Vec<ScheduledBlock>) -> Option<ScheduledBlock> {
    blocks.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
    blocks.into_iter().next()
}
