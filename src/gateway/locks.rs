// Per-transaction serialization of reconciliation work

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Hands out one async mutex per transaction id so duplicate callbacks for
/// the same transaction run one after another. Other transactions are not
/// affected.
#[derive(Default)]
pub struct TransactionLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TransactionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, tid: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;

            // Clean up idle entries opportunistically
            locks.retain(|_, l| Arc::strong_count(l) > 1);

            locks
                .entry(tid.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = lock.lock_owned().await;
        debug!(tid = %tid, "acquired transaction lock");
        guard
    }

    #[cfg(test)]
    pub async fn tracked(&self) -> usize {
        self.locks.lock().await.len()
    }
}
