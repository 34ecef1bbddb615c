//! Per-student async locks.
//!
//! Presence events and window-start ticks for the same student are serialized
//! through one lock; different students never share a lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry size above which idle entries are pruned on the next acquire.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Default)]
pub struct StudentLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl StudentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to one student's open-interval slot.
    pub async fn acquire(&self, student_id: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = match self.slots.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if slots.len() > PRUNE_THRESHOLD {
                // Only the registry holds these, so nobody is waiting on them.
                slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            slots
                .entry(student_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    /// Number of students with a registered lock.
    pub fn len(&self) -> usize {
        match self.slots.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_student_waits_for_the_holder() {
        let locks = Arc::new(StudentLocks::new());
        let guard = locks.acquire("s1").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire("s1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_students_do_not_contend() {
        let locks = StudentLocks::new();
        let _a = locks.acquire("s1").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("s2")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }
}
