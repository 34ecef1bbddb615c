//! Assignment, update and deletion of scheduled blocks.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ScheduledBlock, MAX_TITLE_LEN};
use crate::error::{CoreError, Result, ValidationError};
use crate::storage::{RosterStore, ScheduleStore, Store};

/// Request from the authoring surface to schedule a block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentCommand {
    pub student_id: String,
    pub title: String,
    pub activity_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub actor_id: String,
}

/// Partial update of a block. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockPatch {
    pub title: Option<String>,
    pub activity_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

fn validate_title(title: &str) -> Result<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ValidationError::InvalidValue {
            field: "title".into(),
            message: "must not be blank".into(),
        }
        .into());
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(ValidationError::InvalidValue {
            field: "title".into(),
            message: format!("must be at most {MAX_TITLE_LEN} characters"),
        }
        .into());
    }
    Ok(title.to_string())
}

fn validate_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if end <= start {
        return Err(ValidationError::InvalidTimeRange { start, end }.into());
    }
    Ok(())
}

fn validate_future(start: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    if start <= now {
        return Err(ValidationError::StartNotInFuture { start, now }.into());
    }
    Ok(())
}

/// Schedule operations with validation and overlap checks on top of the store.
pub struct ScheduleService {
    store: Arc<dyn Store>,
    /// Serializes check-then-write so two assignments cannot both pass the overlap check.
    write_gate: Mutex<()>,
}

impl ScheduleService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            write_gate: Mutex::new(()),
        }
    }

    /// Schedule a new block.
    ///
    /// # Errors
    /// - `Validation` for a blank/long title, `end <= start`, a start not after
    ///   `now`, or an activity that is not assignable
    /// - `NotFound` for an unknown student or activity
    /// - `Conflict` when the window intersects another block of the student
    pub fn assign(&self, command: AssignmentCommand, now: DateTime<Utc>) -> Result<ScheduledBlock> {
        let title = validate_title(&command.title)?;
        validate_range(command.start, command.end)?;
        validate_future(command.start, now)?;

        if self.store.get_student(&command.student_id)?.is_none() {
            return Err(CoreError::not_found("student", command.student_id));
        }
        self.check_activity(&command.activity_id)?;

        let _gate = self.gate()?;
        self.check_conflict(&command.student_id, command.start, command.end, None)?;

        let block = ScheduledBlock::new(
            command.student_id,
            title,
            command.activity_id,
            command.start,
            command.end,
            command.actor_id,
        );
        self.store.insert_block(&block)?;
        info!(
            block_id = %block.id,
            student_id = %block.student_id,
            start = %block.start,
            end = %block.end,
            "block assigned"
        );
        Ok(block)
    }

    /// Apply a partial update, re-running the overlap check with the block itself excluded.
    ///
    /// The future-start rule applies only when the patch moves the start.
    pub fn update(&self, id: &str, patch: BlockPatch, now: DateTime<Utc>) -> Result<ScheduledBlock> {
        // Held across the read so concurrent patches apply one after the other.
        let _gate = self.gate()?;
        let mut block = self
            .store
            .get_block(id)?
            .ok_or_else(|| CoreError::not_found("block", id))?;

        if let Some(title) = patch.title {
            block.title = validate_title(&title)?;
        }
        if let Some(activity_id) = patch.activity_id {
            self.check_activity(&activity_id)?;
            block.activity_id = activity_id;
        }
        if let Some(start) = patch.start {
            if start != block.start {
                validate_future(start, now)?;
            }
            block.start = start;
        }
        if let Some(end) = patch.end {
            block.end = end;
        }
        validate_range(block.start, block.end)?;
        self.check_conflict(&block.student_id, block.start, block.end, Some(&block.id))?;

        if !self.store.update_block(&block)? {
            return Err(CoreError::not_found("block", id));
        }
        info!(block_id = %block.id, start = %block.start, end = %block.end, "block updated");
        Ok(block)
    }

    /// Hard-delete a block. Intervals linked to it become unlinked.
    ///
    /// Returns the number of intervals that lost their link.
    pub fn delete(&self, id: &str) -> Result<usize> {
        let unlinked = self
            .store
            .delete_block(id)?
            .ok_or_else(|| CoreError::not_found("block", id))?;
        info!(block_id = id, unlinked, "block deleted");
        Ok(unlinked)
    }

    pub fn get(&self, id: &str) -> Result<ScheduledBlock> {
        self.store
            .get_block(id)?
            .ok_or_else(|| CoreError::not_found("block", id))
    }

    /// Blocks of a student lying entirely inside `[start, end]`.
    pub fn query_by_student_range(
        &self,
        student_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ScheduledBlock>> {
        validate_range(start, end)?;
        self.store.blocks_within(student_id, start, end)
    }

    /// Blocks of a student intersecting `[start, end]`, endpoints included.
    pub fn query_overlapping(
        &self,
        student_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ScheduledBlock>> {
        self.store.blocks_overlapping(student_id, start, end, None)
    }

    fn gate(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_gate
            .lock()
            .map_err(|_| CoreError::Custom("schedule write gate poisoned".into()))
    }

    fn check_activity(&self, activity_id: &str) -> Result<()> {
        let activity = self
            .store
            .get_activity(activity_id)?
            .ok_or_else(|| CoreError::not_found("activity", activity_id))?;
        if !activity.assignable {
            return Err(ValidationError::ActivityNotAssignable(activity.name).into());
        }
        Ok(())
    }

    fn check_conflict(
        &self,
        student_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude_id: Option<&str>,
    ) -> Result<()> {
        let clashes = self
            .store
            .blocks_overlapping(student_id, start, end, exclude_id)?;
        match clashes.into_iter().next() {
            Some(existing) => Err(CoreError::Conflict {
                existing_id: existing.id,
                existing_start: existing.start,
                existing_end: existing.end,
                requested_start: start,
                requested_end: end,
            }),
            None => Ok(()),
        }
    }
}
