//! Compliance rules: late arrival, early leave, no-show and the
//! once-per-block reminders.
//!
//! The evaluator never mutates attendance. It reads what the reconciler
//! produced and returns [`NotificationRequest`]s; alerts that must go out at
//! most once per block are claimed in the store's alert ledger first.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::attendance::AttendanceInterval;
use crate::error::Result;
use crate::notify::{NotificationKind, NotificationRequest};
use crate::session::{JoinOutcome, WindowStartReport};
use crate::storage::{AttendanceStore, ScheduleStore, Store};

/// Thresholds for every compliance rule, in minutes unless noted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompliancePolicy {
    /// A join up to this long after block start is on time.
    #[serde(default = "default_on_time_grace")]
    pub on_time_grace_minutes: i64,
    /// Blocks that started longer ago than this do not make a join late.
    #[serde(default = "default_late_lookback")]
    pub late_lookback_minutes: i64,
    /// A leave is early only when more than this remains of the block.
    #[serde(default = "default_early_leave_grace")]
    pub early_leave_grace_minutes: i64,
    #[serde(default = "default_no_show_delay")]
    pub no_show_delay_minutes: i64,
    /// How far back (hours) the no-show sweep looks.
    #[serde(default = "default_no_show_horizon")]
    pub no_show_horizon_hours: i64,
    #[serde(default = "default_reminder_lead")]
    pub reminder_lead_minutes: i64,
}

fn default_on_time_grace() -> i64 {
    5
}
fn default_late_lookback() -> i64 {
    30
}
fn default_early_leave_grace() -> i64 {
    5
}
fn default_no_show_delay() -> i64 {
    15
}
fn default_no_show_horizon() -> i64 {
    24
}
fn default_reminder_lead() -> i64 {
    10
}

impl Default for CompliancePolicy {
    fn default() -> Self {
        Self {
            on_time_grace_minutes: default_on_time_grace(),
            late_lookback_minutes: default_late_lookback(),
            early_leave_grace_minutes: default_early_leave_grace(),
            no_show_delay_minutes: default_no_show_delay(),
            no_show_horizon_hours: default_no_show_horizon(),
            reminder_lead_minutes: default_reminder_lead(),
        }
    }
}

/// How a join relates to the student's schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "classification", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JoinClassification {
    OnTime,
    Late { minutes: i64 },
    /// No block started recently enough to judge the join against.
    Unscheduled,
    /// The block already had attendance; the student came back.
    Reentry,
}

pub struct ComplianceEvaluator {
    store: Arc<dyn Store>,
    policy: CompliancePolicy,
}

impl ComplianceEvaluator {
    pub fn new(store: Arc<dyn Store>, policy: CompliancePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &CompliancePolicy {
        &self.policy
    }

    /// Classify a join against the block it was linked to.
    pub fn classify_join(&self, outcome: &JoinOutcome) -> Result<JoinClassification> {
        if outcome.stale {
            return Ok(JoinClassification::Reentry);
        }
        let Some(block) = &outcome.block else {
            return Ok(JoinClassification::Unscheduled);
        };

        let linked = self
            .store
            .linked_counts(std::slice::from_ref(&block.id))?
            .get(&block.id)
            .copied()
            .unwrap_or(0);
        if linked > 1 {
            return Ok(JoinClassification::Reentry);
        }

        let elapsed = block.elapsed_at(outcome.interval.start);
        if elapsed <= Duration::minutes(self.policy.on_time_grace_minutes) {
            Ok(JoinClassification::OnTime)
        } else if elapsed <= Duration::minutes(self.policy.late_lookback_minutes) {
            Ok(JoinClassification::Late {
                minutes: elapsed.num_minutes(),
            })
        } else {
            Ok(JoinClassification::Unscheduled)
        }
    }

    /// Classify a join and build any alert it warrants.
    pub fn evaluate_join(
        &self,
        outcome: &JoinOutcome,
    ) -> Result<(JoinClassification, Vec<NotificationRequest>)> {
        let classification = self.classify_join(outcome)?;
        let mut requests = Vec::new();
        if let (JoinClassification::Late { minutes }, Some(block)) = (classification, &outcome.block) {
            info!(
                student_id = %outcome.interval.student_id,
                block_id = %block.id,
                minutes,
                "late arrival"
            );
            requests.push(NotificationRequest::for_student(
                NotificationKind::LateArrival,
                &outcome.interval.student_id,
                Some(block.id.clone()),
                Some(minutes),
            ));
        }
        Ok((classification, requests))
    }

    /// Early-leave alerts for intervals a leave just closed.
    pub fn evaluate_leave(&self, closed: &[AttendanceInterval]) -> Result<Vec<NotificationRequest>> {
        let grace = Duration::minutes(self.policy.early_leave_grace_minutes);
        let mut requests = Vec::new();

        for interval in closed {
            let (Some(block_id), Some(left_at)) = (interval.linked_block_id.as_deref(), interval.end) else {
                continue;
            };
            let Some(block) = self.store.get_block(block_id)? else {
                continue;
            };
            let remaining = block.end - left_at;
            if remaining <= grace {
                continue;
            }
            let minutes = remaining.num_minutes();
            info!(student_id = %interval.student_id, block_id, minutes, "early leave");
            requests.push(NotificationRequest::for_student(
                NotificationKind::EarlyLeave,
                &interval.student_id,
                Some(block.id),
                Some(minutes),
            ));
        }
        Ok(requests)
    }

    /// No-show alerts for blocks that started over the delay ago with no attendance.
    ///
    /// Each block is alerted at most once, however often the sweep runs.
    pub fn sweep_no_shows(&self, now: DateTime<Utc>) -> Result<Vec<NotificationRequest>> {
        let cutoff = now - Duration::minutes(self.policy.no_show_delay_minutes);
        let horizon = now - Duration::hours(self.policy.no_show_horizon_hours);

        let candidates: Vec<_> = self
            .store
            .blocks_starting_between(horizon, cutoff)?
            .into_iter()
            .filter(|b| b.start < cutoff)
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = candidates.iter().map(|b| b.id.clone()).collect();
        let counts = self.store.linked_counts(&ids)?;

        let mut requests = Vec::new();
        for block in candidates {
            if counts.contains_key(&block.id) {
                continue;
            }
            if !self.store.claim_alert(&block.id, NotificationKind::NoShow, now)? {
                continue;
            }
            let minutes = (now - block.start).num_minutes();
            info!(student_id = %block.student_id, block_id = %block.id, minutes, "no-show");
            requests.push(NotificationRequest::for_student(
                NotificationKind::NoShow,
                &block.student_id,
                Some(block.id),
                Some(minutes),
            ));
        }
        Ok(requests)
    }

    /// One reminder per block starting within the lead time.
    pub fn sweep_reminders(&self, now: DateTime<Utc>) -> Result<Vec<NotificationRequest>> {
        let until = now + Duration::minutes(self.policy.reminder_lead_minutes);
        let mut requests = Vec::new();

        for block in self.store.blocks_starting_between(now, until)? {
            if block.start <= now {
                continue;
            }
            if !self.store.claim_alert(&block.id, NotificationKind::Reminder, now)? {
                continue;
            }
            let minutes = (block.start - now).num_minutes();
            debug!(block_id = %block.id, minutes, "reminder");
            requests.push(NotificationRequest::for_student(
                NotificationKind::Reminder,
                &block.student_id,
                Some(block.id),
                Some(minutes),
            ));
        }
        Ok(requests)
    }

    /// Session-start notice for a block whose window just opened.
    pub fn session_start(
        &self,
        report: &WindowStartReport,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationRequest>> {
        let block = &report.block;
        if !self
            .store
            .claim_alert(&block.id, NotificationKind::SessionStart, now)?
        {
            return Ok(Vec::new());
        }
        Ok(vec![NotificationRequest::for_student(
            NotificationKind::SessionStart,
            &block.student_id,
            Some(block.id.clone()),
            None,
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduledBlock;
    use crate::session::SessionReconciler;
    use crate::storage::{SqliteStore, MAX_BATCH_IDS};
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 3, 4, h, m, 0).unwrap()
    }

    struct Fixture {
        store: Arc<SqliteStore>,
        reconciler: SessionReconciler,
        evaluator: ComplianceEvaluator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        Fixture {
            reconciler: SessionReconciler::new(store.clone()),
            evaluator: ComplianceEvaluator::new(store.clone(), CompliancePolicy::default()),
            store,
        }
    }

    fn add_block(store: &SqliteStore, start: DateTime<Utc>, end: DateTime<Utc>) -> ScheduledBlock {
        let block = ScheduledBlock::new("s1", "Reading", "act", start, end, "tutor");
        store.insert_block(&block).unwrap();
        block
    }

    #[tokio::test]
    async fn join_within_grace_is_on_time() {
        let f = fixture();
        add_block(&f.store, at(10, 0), at(12, 0));
        let outcome = f.reconciler.on_presence_join("s1", at(10, 3), "voice").await.unwrap();

        let (classification, requests) = f.evaluator.evaluate_join(&outcome).unwrap();
        assert_eq!(classification, JoinClassification::OnTime);
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn join_at_exactly_the_grace_boundary_is_on_time() {
        let f = fixture();
        add_block(&f.store, at(10, 0), at(12, 0));
        let outcome = f.reconciler.on_presence_join("s1", at(10, 5), "voice").await.unwrap();
        assert_eq!(f.evaluator.classify_join(&outcome).unwrap(), JoinClassification::OnTime);
    }

    #[tokio::test]
    async fn join_past_grace_is_late_with_elapsed_minutes() {
        let f = fixture();
        let block = add_block(&f.store, at(10, 0), at(12, 0));
        let outcome = f.reconciler.on_presence_join("s1", at(10, 20), "voice").await.unwrap();

        let (classification, requests) = f.evaluator.evaluate_join(&outcome).unwrap();
        assert_eq!(classification, JoinClassification::Late { minutes: 20 });
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].kind, NotificationKind::LateArrival);
        assert_eq!(requests[0].minutes, Some(20));
        assert_eq!(requests[0].block_id.as_deref(), Some(block.id.as_str()));
    }

    #[tokio::test]
    async fn join_beyond_lookback_is_not_late() {
        let f = fixture();
        add_block(&f.store, at(10, 0), at(12, 0));
        let outcome = f.reconciler.on_presence_join("s1", at(10, 45), "voice").await.unwrap();
        assert_eq!(
            f.evaluator.classify_join(&outcome).unwrap(),
            JoinClassification::Unscheduled
        );
    }

    #[tokio::test]
    async fn join_without_block_is_unscheduled() {
        let f = fixture();
        let outcome = f.reconciler.on_presence_join("s1", at(8, 0), "voice").await.unwrap();
        let (classification, requests) = f.evaluator.evaluate_join(&outcome).unwrap();
        assert_eq!(classification, JoinClassification::Unscheduled);
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn rejoin_is_reentry_without_second_late_alert() {
        let f = fixture();
        add_block(&f.store, at(10, 0), at(12, 0));
        f.reconciler.on_presence_join("s1", at(10, 10), "voice").await.unwrap();
        f.reconciler.on_presence_leave("s1", at(10, 12)).await.unwrap();
        let back = f.reconciler.on_presence_join("s1", at(10, 14), "voice").await.unwrap();

        let (classification, requests) = f.evaluator.evaluate_join(&back).unwrap();
        assert_eq!(classification, JoinClassification::Reentry);
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn leave_exactly_five_minutes_early_is_not_early() {
        let f = fixture();
        add_block(&f.store, at(10, 0), at(11, 0));
        f.reconciler.on_presence_join("s1", at(10, 0), "voice").await.unwrap();
        let closed = f.reconciler.on_presence_leave("s1", at(10, 55)).await.unwrap();
        assert!(f.evaluator.evaluate_leave(&closed).unwrap().is_empty());
    }

    #[tokio::test]
    async fn leave_six_minutes_early_is_early() {
        let f = fixture();
        let block = add_block(&f.store, at(10, 0), at(11, 0));
        f.reconciler.on_presence_join("s1", at(10, 0), "voice").await.unwrap();
        let closed = f.reconciler.on_presence_leave("s1", at(10, 54)).await.unwrap();

        let requests = f.evaluator.evaluate_leave(&closed).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].kind, NotificationKind::EarlyLeave);
        assert_eq!(requests[0].minutes, Some(6));
        assert_eq!(requests[0].block_id.as_deref(), Some(block.id.as_str()));
    }

    #[tokio::test]
    async fn leave_of_unlinked_interval_never_alerts() {
        let f = fixture();
        f.reconciler.on_presence_join("s1", at(9, 0), "voice").await.unwrap();
        let closed = f.reconciler.on_presence_leave("s1", at(9, 10)).await.unwrap();
        assert!(f.evaluator.evaluate_leave(&closed).unwrap().is_empty());
    }

    #[test]
    fn no_show_fires_once_after_the_delay() {
        let f = fixture();
        let block = add_block(&f.store, at(10, 0), at(12, 0));

        assert!(f.evaluator.sweep_no_shows(at(10, 15)).unwrap().is_empty());
        let fired = f.evaluator.sweep_no_shows(at(10, 16)).unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind, NotificationKind::NoShow);
        assert_eq!(fired[0].block_id.as_deref(), Some(block.id.as_str()));
        assert_eq!(fired[0].minutes, Some(16));

        assert!(f.evaluator.sweep_no_shows(at(10, 30)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn attended_block_is_not_a_no_show() {
        let f = fixture();
        add_block(&f.store, at(10, 0), at(12, 0));
        f.reconciler.on_presence_join("s1", at(10, 1), "voice").await.unwrap();
        assert!(f.evaluator.sweep_no_shows(at(10, 20)).unwrap().is_empty());
    }

    #[test]
    fn no_show_sweep_covers_more_blocks_than_one_batch() {
        let f = fixture();
        for i in 0..MAX_BATCH_IDS + 2 {
            let block = ScheduledBlock::new(format!("s{i}"), "Reading", "act", at(10, 0), at(11, 0), "tutor");
            f.store.insert_block(&block).unwrap();
        }
        // Starts last, so its id lands in the second batch.
        let attended = ScheduledBlock::new("late-starter", "Reading", "act", at(10, 1), at(11, 0), "tutor");
        f.store.insert_block(&attended).unwrap();
        f.store
            .insert_interval(&AttendanceInterval::open("late-starter", Some(attended.id.clone()), at(10, 2), "voice"))
            .unwrap();

        let fired = f.evaluator.sweep_no_shows(at(10, 20)).unwrap();
        assert_eq!(fired.len(), MAX_BATCH_IDS + 2);
        assert!(fired.iter().all(|r| r.block_id.as_deref() != Some(attended.id.as_str())));
    }

    #[test]
    fn no_show_ignores_blocks_beyond_horizon() {
        let f = fixture();
        add_block(&f.store, at(10, 0), at(11, 0));
        let next_day = at(10, 0) + Duration::hours(26);
        assert!(f.evaluator.sweep_no_shows(next_day).unwrap().is_empty());
    }

    #[test]
    fn reminder_goes_out_once_inside_lead_time() {
        let f = fixture();
        add_block(&f.store, at(10, 0), at(11, 0));

        assert!(f.evaluator.sweep_reminders(at(9, 45)).unwrap().is_empty());
        let fired = f.evaluator.sweep_reminders(at(9, 52)).unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind, NotificationKind::Reminder);
        assert_eq!(fired[0].minutes, Some(8));
        assert!(f.evaluator.sweep_reminders(at(9, 55)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_start_is_claimed_once() {
        let f = fixture();
        let block = add_block(&f.store, at(10, 0), at(11, 0));
        let report = f.reconciler.on_block_window_start(&block.id).await.unwrap();

        assert_eq!(f.evaluator.session_start(&report, at(10, 0)).unwrap().len(), 1);
        assert!(f.evaluator.session_start(&report, at(10, 1)).unwrap().is_empty());
    }

    #[test]
    fn policy_fills_missing_fields_with_defaults() {
        let policy: CompliancePolicy = toml::from_str("no_show_delay_minutes = 20").unwrap();
        assert_eq!(policy.no_show_delay_minutes, 20);
        assert_eq!(policy.on_time_grace_minutes, 5);
        assert_eq!(policy.reminder_lead_minutes, 10);
    }
}
