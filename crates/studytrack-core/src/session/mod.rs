//! Presence reconciliation and the per-student locking it runs under.

pub mod locks;
pub mod reconciler;

pub use locks::StudentLocks;
pub use reconciler::{JoinOutcome, SessionReconciler, WindowStartOutcome, WindowStartReport};
