//! Capture Vault - Per-Capture Locks
//!
//! Serializes every multi-step operation on one capture (upload finalize,
//! discard, eviction, manual retry) while leaving other captures free.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = HashMap<String, Arc<AsyncMutex<()>>>;

/// Keyed async mutexes, one per capture id
#[derive(Clone, Default)]
pub struct CaptureLocks {
    locks: Arc<Mutex<LockMap>>,
}

impl CaptureLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `capture_id`
    pub async fn lock(&self, capture_id: &str) -> CaptureGuard {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(
                locks
                    .entry(capture_id.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };

        let guard = lock.lock_owned().await;
        CaptureGuard {
            capture_id: capture_id.to_string(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Number of ids with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

/// Exclusive access to one capture; released on drop
pub struct CaptureGuard {
    capture_id: String,
    locks: Arc<Mutex<LockMap>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl CaptureGuard {
    pub fn capture_id(&self) -> &str {
        &self.capture_id
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        // Release first so the map holds the only remaining reference
        drop(self.guard.take());

        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(&self.capture_id) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&self.capture_id);
            }
        }
    }
}
