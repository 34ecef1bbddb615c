//! # Studytrack Core Library
//!
//! This library schedules study blocks for students, reconciles them against
//! presence signals from a voice-chat style channel, and reports attendance.
//! All operations are available through the standalone CLI binary, which is a
//! thin layer over this crate.
//!
//! ## Architecture
//!
//! - **Schedule**: overlap-free study blocks per student, closed-interval
//!   boundary policy for both conflicts and "covers now"
//! - **Session**: per-student reconciliation of join/leave/move events and
//!   block window starts into attendance intervals, at most one open at a time
//! - **Compliance**: late arrival, early leave, no-show and reminder alerts
//! - **Monitor**: batched cohort status view whose query count does not grow
//!   with the number of students
//! - **Storage**: SQLite-backed stores and TOML-based configuration
//!
//! ## Key Components
//!
//! - [`AttendanceEngine`]: wires every component over one store
//! - [`ScheduleService`]: block assignment with validation and conflict checks
//! - [`SessionReconciler`]: presence-to-attendance state machine
//! - [`MonitoringAggregator`]: cohort status for dashboards
//! - [`Watcher`]: periodic window-start ticks and sweeps

pub mod attendance;
pub mod compliance;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod notify;
pub mod roster;
pub mod schedule;
pub mod session;
pub mod storage;
pub mod watcher;

pub use attendance::{AttendanceInterval, PresenceEvent, PresenceKind};
pub use compliance::{ComplianceEvaluator, CompliancePolicy, JoinClassification};
pub use engine::{AttendanceEngine, PresenceAction, PresenceReport, SweepReport, TickReport};
pub use error::{ConfigError, CoreError, DatabaseError, Result, ValidationError};
pub use monitor::{CohortStatus, CohortStatusView, MonitoringAggregator, StudentRow};
pub use notify::{
    LoggingGateway, NotificationGateway, NotificationKind, NotificationRequest, Notifier,
};
pub use roster::{Activity, Guardian, Student};
pub use schedule::{AssignmentCommand, BlockPatch, ScheduleService, ScheduledBlock};
pub use session::{JoinOutcome, SessionReconciler, WindowStartOutcome, WindowStartReport};
pub use storage::{
    AttendanceStore, Config, RosterStore, ScheduleStore, SqliteStore, Store,
};
pub use watcher::{Watcher, WatcherHandle};
