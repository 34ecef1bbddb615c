//! The attendance engine: one entry point wiring scheduling, reconciliation,
//! compliance, monitoring and notification over a shared store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::attendance::{AttendanceInterval, PresenceEvent, PresenceKind};
use crate::compliance::{ComplianceEvaluator, CompliancePolicy, JoinClassification};
use crate::error::Result;
use crate::monitor::MonitoringAggregator;
use crate::notify::{DeliveryResult, NotificationGateway, NotificationRequest, Notifier};
use crate::schedule::ScheduleService;
use crate::session::{JoinOutcome, SessionReconciler, WindowStartReport};
use crate::storage::{Config, RosterStore, ScheduleStore, Store};

/// Background delivery of the alerts a call produced.
pub type Delivery = Option<JoinHandle<Vec<DeliveryResult>>>;

#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PresenceAction {
    /// External id is not mapped to any student.
    Dropped { external_student_id: String },
    Joined {
        outcome: JoinOutcome,
        classification: JoinClassification,
    },
    Moved {
        outcome: JoinOutcome,
        classification: JoinClassification,
    },
    Left { closed: Vec<AttendanceInterval> },
}

#[derive(Debug, Serialize)]
pub struct PresenceReport {
    pub action: PresenceAction,
    pub alerts: Vec<NotificationRequest>,
    #[serde(skip)]
    pub delivery: Delivery,
}

#[derive(Debug, Serialize)]
pub struct TickReport {
    pub windows: Vec<WindowStartReport>,
    /// Blocks whose window start could not be processed.
    pub failed: Vec<String>,
    pub alerts: Vec<NotificationRequest>,
    #[serde(skip)]
    pub delivery: Delivery,
}

#[derive(Debug, Serialize)]
pub struct SweepReport {
    pub no_shows: usize,
    pub reminders: usize,
    pub alerts: Vec<NotificationRequest>,
    #[serde(skip)]
    pub delivery: Delivery,
}

pub struct AttendanceEngine {
    store: Arc<dyn Store>,
    schedule: ScheduleService,
    reconciler: SessionReconciler,
    evaluator: ComplianceEvaluator,
    monitor: MonitoringAggregator,
    notifier: Notifier,
}

impl AttendanceEngine {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn NotificationGateway>,
        policy: CompliancePolicy,
        chunk_size: usize,
    ) -> Self {
        Self {
            schedule: ScheduleService::new(store.clone()),
            reconciler: SessionReconciler::new(store.clone()),
            evaluator: ComplianceEvaluator::new(store.clone(), policy),
            monitor: MonitoringAggregator::with_chunk_size(store.clone(), chunk_size),
            notifier: Notifier::new(gateway, store.clone()),
            store,
        }
    }

    pub fn from_config(
        store: Arc<dyn Store>,
        gateway: Arc<dyn NotificationGateway>,
        config: &Config,
    ) -> Self {
        Self::new(
            store,
            gateway,
            config.compliance.clone(),
            config.monitor.chunk_size,
        )
    }

    pub fn schedule(&self) -> &ScheduleService {
        &self.schedule
    }

    pub fn reconciler(&self) -> &SessionReconciler {
        &self.reconciler
    }

    pub fn evaluator(&self) -> &ComplianceEvaluator {
        &self.evaluator
    }

    pub fn monitor(&self) -> &MonitoringAggregator {
        &self.monitor
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Reconcile one presence event and send whatever alerts it triggers.
    ///
    /// Unmapped external ids are logged and dropped, not treated as errors.
    pub async fn handle_presence(&self, event: PresenceEvent) -> Result<PresenceReport> {
        let Some(student) = self.store.student_by_external_id(&event.external_student_id)? else {
            warn!(
                external_student_id = %event.external_student_id,
                kind = ?event.kind,
                "presence event for unknown student dropped"
            );
            return Ok(PresenceReport {
                action: PresenceAction::Dropped {
                    external_student_id: event.external_student_id,
                },
                alerts: Vec::new(),
                delivery: None,
            });
        };

        let (action, alerts) = match event.kind {
            PresenceKind::Join => {
                let outcome = self
                    .reconciler
                    .on_presence_join(&student.id, event.timestamp, &event.channel_tag)
                    .await?;
                let (classification, alerts) = self.evaluator.evaluate_join(&outcome)?;
                (PresenceAction::Joined { outcome, classification }, alerts)
            }
            PresenceKind::Move => {
                let outcome = self
                    .reconciler
                    .on_presence_move(&student.id, event.timestamp, &event.channel_tag)
                    .await?;
                let (classification, alerts) = self.evaluator.evaluate_join(&outcome)?;
                (PresenceAction::Moved { outcome, classification }, alerts)
            }
            PresenceKind::Leave => {
                let closed = self
                    .reconciler
                    .on_presence_leave(&student.id, event.timestamp)
                    .await?;
                let alerts = self.evaluator.evaluate_leave(&closed)?;
                (PresenceAction::Left { closed }, alerts)
            }
        };

        let delivery = self.notifier.emit(alerts.clone());
        Ok(PresenceReport {
            action,
            alerts,
            delivery,
        })
    }

    /// Process the window start of every block starting in `[since, now]`.
    ///
    /// Re-running over the same span is harmless: linking is idempotent and
    /// session-start notices are claimed once per block. A block that fails
    /// is logged and skipped.
    pub async fn run_window_starts(
        &self,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<TickReport> {
        let blocks = self.store.blocks_starting_between(since, now)?;
        let mut windows = Vec::with_capacity(blocks.len());
        let mut failed = Vec::new();
        let mut alerts = Vec::new();

        for block in blocks {
            let report = match self.reconciler.on_block_window_start(&block.id).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(block_id = %block.id, error = %e, "window start failed");
                    failed.push(block.id);
                    continue;
                }
            };
            match self.evaluator.session_start(&report, now) {
                Ok(requests) => alerts.extend(requests),
                Err(e) => warn!(block_id = %block.id, error = %e, "session start notice failed"),
            }
            windows.push(report);
        }

        debug!(windows = windows.len(), failed = failed.len(), "window starts processed");
        let delivery = self.notifier.emit(alerts.clone());
        Ok(TickReport {
            windows,
            failed,
            alerts,
            delivery,
        })
    }

    /// Run the no-show and reminder sweeps once.
    pub fn run_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let no_shows = self.evaluator.sweep_no_shows(now)?;
        let reminders = self.evaluator.sweep_reminders(now)?;

        let (no_show_count, reminder_count) = (no_shows.len(), reminders.len());
        let mut alerts = no_shows;
        alerts.extend(reminders);

        let delivery = self.notifier.emit(alerts.clone());
        Ok(SweepReport {
            no_shows: no_show_count,
            reminders: reminder_count,
            alerts,
            delivery,
        })
    }
}
