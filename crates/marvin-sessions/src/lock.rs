//! Per-session turn serialization.
//!
//! A session is owned by at most one in-flight turn. Later messages for the
//! same session queue FIFO on the per-key semaphore, which is what gives the
//! serial turn boundary: turn N's outgoing messages are dispatched before
//! turn N+1 starts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Maps session keys to single-permit semaphores.
#[derive(Default)]
pub struct SessionLockMap {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl SessionLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the run permit for a session, waiting in FIFO order.
    ///
    /// Hold the returned permit for the duration of the turn; it releases on
    /// drop.
    pub async fn acquire(&self, session_key: &str) -> OwnedSemaphorePermit {
        let sem = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(session_key.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        // The semaphore is never closed, so acquire cannot fail.
        sem.acquire_owned().await.expect("session semaphore closed")
    }
}
