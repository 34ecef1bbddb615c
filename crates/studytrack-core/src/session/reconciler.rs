//! Presence-to-attendance reconciliation.
//!
//! Every mutation of a student's open-interval slot runs under that student's
//! lock, so joins, leaves and window-start ticks for one student apply one at
//! a time while different students proceed in parallel.
//!
//! The slot holds at most one open interval. Joins close whatever is still
//! open before opening a new interval; if more than one open interval is ever
//! found, all but the newest are closed and the repair is counted and logged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::locks::StudentLocks;
use crate::attendance::AttendanceInterval;
use crate::error::{CoreError, Result};
use crate::schedule::{earliest_block, ScheduledBlock};
use crate::storage::{AttendanceStore, ScheduleStore, Store};

/// What a join (or move) did to the student's slot.
#[derive(Debug, Clone, Serialize)]
pub struct JoinOutcome {
    /// The interval that is open after the event.
    pub interval: AttendanceInterval,
    /// Block the new interval was linked to, if any.
    pub block: Option<ScheduledBlock>,
    /// Intervals that were still open and got closed by this event.
    pub closed: Vec<AttendanceInterval>,
    /// The event predates the currently open interval and was ignored.
    pub stale: bool,
}

/// What a block's window start did to the student's slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WindowStartOutcome {
    /// Nothing open: the student has not shown up yet.
    Absent,
    /// The open interval is already linked to this block.
    AlreadyLinked { interval_id: String },
    /// The open interval is not this block's to take: it started after the
    /// window ended, it belongs to a block that began inside the window, or
    /// the block already has attendance. Nothing changed.
    Unrelated { interval_id: String },
    /// An unlinked open interval was linked in place, start unchanged.
    Linked { interval: AttendanceInterval },
    /// An interval linked to another block was closed at the block start and
    /// continued as a new interval linked to this block.
    Split {
        closed: AttendanceInterval,
        opened: AttendanceInterval,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowStartReport {
    pub block: ScheduledBlock,
    pub outcome: WindowStartOutcome,
}

pub struct SessionReconciler {
    store: Arc<dyn Store>,
    locks: StudentLocks,
    invariant_repairs: AtomicU64,
}

impl SessionReconciler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            locks: StudentLocks::new(),
            invariant_repairs: AtomicU64::new(0),
        }
    }

    /// How many times more than one open interval was found and repaired.
    pub fn invariant_repairs(&self) -> u64 {
        self.invariant_repairs.load(Ordering::Relaxed)
    }

    /// Student joined the presence channel at `timestamp`.
    ///
    /// Closes anything still open, then opens an interval linked to the block
    /// covering `timestamp` (earliest start wins if several do).
    pub async fn on_presence_join(
        &self,
        student_id: &str,
        timestamp: DateTime<Utc>,
        source: &str,
    ) -> Result<JoinOutcome> {
        let _guard = self.locks.acquire(student_id).await;
        self.open_new(student_id, timestamp, source)
    }

    /// Student switched channels at `timestamp`: close and reopen with the new tag.
    pub async fn on_presence_move(
        &self,
        student_id: &str,
        timestamp: DateTime<Utc>,
        source: &str,
    ) -> Result<JoinOutcome> {
        let _guard = self.locks.acquire(student_id).await;
        self.open_new(student_id, timestamp, source)
    }

    /// Student left at `timestamp`. Closes every open interval and returns them.
    ///
    /// An open interval that started after `timestamp` belongs to a later
    /// session than this leave and stays open.
    pub async fn on_presence_leave(
        &self,
        student_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<AttendanceInterval>> {
        let _guard = self.locks.acquire(student_id).await;

        let open = self.store.open_intervals(student_id)?;
        if open.len() > 1 {
            self.record_repair(student_id, open.len());
        }

        let mut closed = Vec::with_capacity(open.len());
        for (index, mut interval) in open.into_iter().enumerate() {
            let newest = index == 0;
            if newest && timestamp < interval.start {
                debug!(
                    student_id,
                    interval_id = %interval.id,
                    %timestamp,
                    "leave predates open interval, keeping it open"
                );
                continue;
            }
            let end = interval.clamp_end(timestamp);
            self.store.close_interval(&interval.id, end)?;
            interval.end = Some(end);
            closed.push(interval);
        }

        if closed.is_empty() {
            debug!(student_id, %timestamp, "leave without an open interval");
        } else {
            debug!(student_id, %timestamp, closed = closed.len(), "intervals closed on leave");
        }
        Ok(closed)
    }

    /// A block's window opened. Links or splits the student's open interval.
    ///
    /// Safe to call more than once for the same block, including long after
    /// its window closed.
    ///
    /// # Errors
    /// `NotFound` if the block does not exist, including when it is deleted
    /// while this call runs.
    pub async fn on_block_window_start(&self, block_id: &str) -> Result<WindowStartReport> {
        let block = self
            .store
            .get_block(block_id)?
            .ok_or_else(|| CoreError::not_found("block", block_id))?;
        let _guard = self.locks.acquire(&block.student_id).await;

        let mut open = self.store.open_intervals(&block.student_id)?.into_iter();
        let Some(current) = open.next() else {
            debug!(block_id, student_id = %block.student_id, "window start: nobody present");
            return Ok(WindowStartReport {
                block,
                outcome: WindowStartOutcome::Absent,
            });
        };

        let extras: Vec<_> = open.collect();
        if !extras.is_empty() {
            self.record_repair(&block.student_id, extras.len() + 1);
            for extra in &extras {
                self.store.close_interval(&extra.id, extra.clamp_end(current.start))?;
            }
        }

        let linked_to = current.linked_block_id.clone();
        if linked_to.as_deref() == Some(block.id.as_str()) {
            return Ok(WindowStartReport {
                block,
                outcome: WindowStartOutcome::AlreadyLinked {
                    interval_id: current.id,
                },
            });
        }
        if !self.takes_over(&block, &current)? {
            debug!(
                block_id,
                student_id = %block.student_id,
                interval_id = %current.id,
                "window start: open interval is not this block's"
            );
            return Ok(WindowStartReport {
                block,
                outcome: WindowStartOutcome::Unrelated {
                    interval_id: current.id,
                },
            });
        }

        let outcome = match linked_to {
            Some(_) => {
                let at = current.clamp_end(block.start);
                let opened = AttendanceInterval::open(
                    &block.student_id,
                    Some(block.id.clone()),
                    at,
                    current.source.clone(),
                );
                if !self.store.split_interval(&current.id, at, &opened)? {
                    return Err(CoreError::not_found("block", block_id));
                }
                let mut closed = current;
                closed.end = Some(at);
                info!(
                    block_id,
                    student_id = %block.student_id,
                    closed = %closed.id,
                    opened = %opened.id,
                    "window start split a running interval"
                );
                WindowStartOutcome::Split { closed, opened }
            }
            None => {
                if !self.store.link_interval(&current.id, &block.id)? {
                    return Err(CoreError::not_found("block", block_id));
                }
                let mut interval = current;
                interval.linked_block_id = Some(block.id.clone());
                info!(
                    block_id,
                    student_id = %block.student_id,
                    interval_id = %interval.id,
                    "window start linked an early arrival"
                );
                WindowStartOutcome::Linked { interval }
            }
        };

        Ok(WindowStartReport { block, outcome })
    }

    /// Whether `block`'s window start should link or split `current`.
    ///
    /// Caller holds the student lock.
    fn takes_over(&self, block: &ScheduledBlock, current: &AttendanceInterval) -> Result<bool> {
        let in_reach = match current.linked_block_id {
            // Only a session already running when the block began moves over.
            Some(_) => current.start < block.start,
            None => current.start <= block.end,
        };
        if !in_reach {
            return Ok(false);
        }
        let attended = self
            .store
            .linked_counts(std::slice::from_ref(&block.id))?
            .contains_key(&block.id);
        Ok(!attended)
    }

    /// Caller holds the student lock.
    fn open_new(&self, student_id: &str, timestamp: DateTime<Utc>, source: &str) -> Result<JoinOutcome> {
        let open = self.store.open_intervals(student_id)?;
        if open.len() > 1 {
            self.record_repair(student_id, open.len());
        }

        if let Some(newest) = open.first() {
            if timestamp < newest.start {
                debug!(
                    student_id,
                    interval_id = %newest.id,
                    %timestamp,
                    "join predates open interval, ignoring"
                );
                let interval = newest.clone();
                let block = match interval.linked_block_id.as_deref() {
                    Some(id) => self.store.get_block(id)?,
                    None => None,
                };
                let mut closed = Vec::new();
                for extra in open.into_iter().skip(1) {
                    let mut extra = extra;
                    let end = extra.clamp_end(interval.start);
                    self.store.close_interval(&extra.id, end)?;
                    extra.end = Some(end);
                    closed.push(extra);
                }
                return Ok(JoinOutcome {
                    interval,
                    block,
                    closed,
                    stale: true,
                });
            }
        }

        let mut closed = Vec::with_capacity(open.len());
        for mut interval in open {
            let end = interval.clamp_end(timestamp);
            self.store.close_interval(&interval.id, end)?;
            interval.end = Some(end);
            closed.push(interval);
        }

        let covering = self
            .store
            .blocks_overlapping(student_id, timestamp, timestamp, None)?;
        let block = earliest_block(covering);
        let mut interval = AttendanceInterval::open(
            student_id,
            block.as_ref().map(|b| b.id.clone()),
            timestamp,
            source,
        );
        interval.linked_block_id = self.store.insert_linked_interval(&interval)?;
        let block = match (block, &interval.linked_block_id) {
            (Some(block), None) => {
                debug!(student_id, block_id = %block.id, "covering block deleted, interval left unlinked");
                None
            }
            (block, _) => block,
        };

        debug!(
            student_id,
            interval_id = %interval.id,
            block_id = block.as_ref().map(|b| b.id.as_str()).unwrap_or("-"),
            closed = closed.len(),
            "interval opened"
        );
        Ok(JoinOutcome {
            interval,
            block,
            closed,
            stale: false,
        })
    }

    fn record_repair(&self, student_id: &str, open_count: usize) {
        self.invariant_repairs.fetch_add(1, Ordering::Relaxed);
        warn!(
            student_id,
            open_count, "more than one open interval, repairing"
        );
    }
}
