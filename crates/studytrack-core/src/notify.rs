//! Notification requests and their fire-and-forget delivery.
//!
//! The compliance evaluator produces student-level requests. The [`Notifier`]
//! addresses each one to the student and every guardian, then hands them to
//! a [`NotificationGateway`] on a background task. Each recipient is attempted
//! on its own; a failure is logged and never affects the others or the
//! reconciliation that triggered it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::storage::{RosterStore, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    LateArrival,
    EarlyLeave,
    NoShow,
    Reminder,
    SessionStart,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::LateArrival => "LATE_ARRIVAL",
            NotificationKind::EarlyLeave => "EARLY_LEAVE",
            NotificationKind::NoShow => "NO_SHOW",
            NotificationKind::Reminder => "REMINDER",
            NotificationKind::SessionStart => "SESSION_START",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub kind: NotificationKind,
    pub student_id: String,
    /// Student or guardian id the request is addressed to.
    pub recipient_id: String,
    pub block_id: Option<String>,
    pub minutes: Option<i64>,
}

impl NotificationRequest {
    /// A request about `student_id`, addressed to the student.
    pub fn for_student(
        kind: NotificationKind,
        student_id: impl Into<String>,
        block_id: Option<String>,
        minutes: Option<i64>,
    ) -> Self {
        let student_id = student_id.into();
        Self {
            kind,
            recipient_id: student_id.clone(),
            student_id,
            block_id,
            minutes,
        }
    }

    fn addressed_to(&self, recipient_id: &str) -> Self {
        Self {
            recipient_id: recipient_id.to_string(),
            ..self.clone()
        }
    }
}

/// Errors a gateway can report for one delivery.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("recipient unreachable: {0}")]
    Unreachable(String),

    #[error("gateway rejected request: {0}")]
    Rejected(String),

    #[error("delivery timed out after {0}s")]
    Timeout(u64),
}

/// External collaborator that actually sends notifications.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn deliver(&self, request: &NotificationRequest) -> std::result::Result<(), DeliveryError>;

    /// Human-readable name for logs.
    fn name(&self) -> &str {
        "gateway"
    }
}

/// Gateway that only writes each request to the log.
#[derive(Debug, Default, Clone)]
pub struct LoggingGateway;

#[async_trait]
impl NotificationGateway for LoggingGateway {
    async fn deliver(&self, request: &NotificationRequest) -> std::result::Result<(), DeliveryError> {
        info!(
            kind = %request.kind,
            student_id = %request.student_id,
            recipient_id = %request.recipient_id,
            block_id = request.block_id.as_deref().unwrap_or("-"),
            minutes = request.minutes.unwrap_or(0),
            "notification"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Result of delivering one request to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub kind: NotificationKind,
    pub recipient_id: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Addresses requests to every recipient and delivers them in the background.
#[derive(Clone)]
pub struct Notifier {
    gateway: Arc<dyn NotificationGateway>,
    roster: Arc<dyn Store>,
}

impl Notifier {
    pub fn new(gateway: Arc<dyn NotificationGateway>, roster: Arc<dyn Store>) -> Self {
        Self { gateway, roster }
    }

    /// Copy each request once per recipient: the student, then each guardian.
    ///
    /// Guardians of all involved students are looked up in a single batch.
    pub fn fan_out(&self, requests: &[NotificationRequest]) -> Result<Vec<NotificationRequest>> {
        let mut student_ids: Vec<String> = requests.iter().map(|r| r.student_id.clone()).collect();
        student_ids.sort();
        student_ids.dedup();
        let guardians = self.roster.guardians_for(&student_ids)?;

        let mut addressed = Vec::with_capacity(requests.len() * 2);
        for request in requests {
            addressed.push(request.addressed_to(&request.student_id));
            for guardian in guardians.iter().filter(|g| g.student_id == request.student_id) {
                addressed.push(request.addressed_to(&guardian.id));
            }
        }
        Ok(addressed)
    }

    /// Deliver every request, continuing past failures.
    pub async fn deliver_all(&self, requests: &[NotificationRequest]) -> Vec<DeliveryResult> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let outcome = self.gateway.deliver(request).await;
            let (success, error) = match outcome {
                Ok(()) => {
                    debug!(
                        kind = %request.kind,
                        recipient_id = %request.recipient_id,
                        gateway = self.gateway.name(),
                        "notification delivered"
                    );
                    (true, None)
                }
                Err(e) => {
                    warn!(
                        kind = %request.kind,
                        recipient_id = %request.recipient_id,
                        gateway = self.gateway.name(),
                        error = %e,
                        "notification delivery failed"
                    );
                    (false, Some(e.to_string()))
                }
            };
            results.push(DeliveryResult {
                kind: request.kind,
                recipient_id: request.recipient_id.clone(),
                success,
                error,
            });
        }
        results
    }

    /// Fan out and deliver on a background task.
    ///
    /// Returns `None` when there is nothing to send. The handle may be dropped;
    /// it exists so tests and shutdown paths can wait for delivery.
    pub fn emit(&self, requests: Vec<NotificationRequest>) -> Option<JoinHandle<Vec<DeliveryResult>>> {
        if requests.is_empty() {
            return None;
        }
        let notifier = self.clone();
        Some(tokio::spawn(async move {
            let addressed = match notifier.fan_out(&requests) {
                Ok(addressed) => addressed,
                Err(e) => {
                    warn!(error = %e, "guardian lookup failed, notifying students only");
                    requests
                }
            };
            notifier.deliver_all(&addressed).await
        }))
    }
}
