//! Tool confirmation broker.
//!
//! A tool that wants human sign-off registers a pending confirmation keyed by
//! a short random id; the channel renders approve/deny affordances and the
//! platform callback resolves it. Unanswered confirmations resolve as denied
//! after the timeout, and a background sweeper evicts anything the callback
//! never reached.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

struct Pending {
    tx: oneshot::Sender<bool>,
    created_at: Instant,
}

/// Shared broker for pending tool confirmations.
pub struct ConfirmationBroker {
    pending: Arc<DashMap<String, Pending>>,
    timeout: Duration,
}

impl ConfirmationBroker {
    /// Create the broker and spawn its sweeper task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(timeout: Duration) -> Self {
        let broker = Self::without_sweeper(timeout);
        let pending = Arc::clone(&broker.pending);
        let horizon = timeout + Duration::from_secs(30);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tick.tick().await;
                sweep_stale(&pending, horizon);
            }
        });
        broker
    }

    /// Broker without the background sweeper (tests drive `sweep` manually).
    pub fn without_sweeper(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            timeout,
        }
    }

    /// Register a pending confirmation.
    ///
    /// Returns the short id (for the channel affordance) and a receiver to
    /// await with [`await_decision`](Self::await_decision).
    pub fn request(&self) -> (String, oneshot::Receiver<bool>) {
        let id = short_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            Pending {
                tx,
                created_at: Instant::now(),
            },
        );
        debug!(id = %id, "confirmation requested");
        (id, rx)
    }

    /// Wait for the user's decision; timeout and dropped senders deny.
    pub async fn await_decision(&self, id: &str, rx: oneshot::Receiver<bool>) -> bool {
        let decision = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(approved)) => approved,
            Ok(Err(_)) => false,
            Err(_) => {
                info!(id = %id, "confirmation timed out, denying");
                false
            }
        };
        self.pending.remove(id);
        decision
    }

    /// Channel-side callback entry point, as dispatched by the platform
    /// (`chat_id`/`message_id` identify the affordance that was tapped).
    pub fn on_confirmation_callback(
        &self,
        id: &str,
        approved: bool,
        chat_id: &str,
        message_id: &str,
    ) -> bool {
        debug!(id = %id, chat = %chat_id, message = %message_id, "confirmation callback");
        self.resolve(id, approved)
    }

    /// Resolve a pending confirmation. Duplicate or unknown ids are ignored.
    pub fn resolve(&self, id: &str, approved: bool) -> bool {
        match self.pending.remove(id) {
            Some((_, pending)) => {
                let _ = pending.tx.send(approved);
                info!(id = %id, approved, "confirmation resolved");
                true
            }
            None => {
                debug!(id = %id, "confirmation callback for unknown id ignored");
                false
            }
        }
    }

    /// Drop pending entries older than `timeout + 30s`.
    pub fn sweep(&self) {
        sweep_stale(&self.pending, self.timeout + Duration::from_secs(30));
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn sweep_stale(pending: &DashMap<String, Pending>, horizon: Duration) {
    let before = pending.len();
    pending.retain(|_, entry| entry.created_at.elapsed() < horizon);
    let evicted = before - pending.len();
    if evicted > 0 {
        warn!(evicted, "confirmation sweeper evicted stale entries");
    }
}

/// Short random id — enough entropy for in-flight confirmations, short
/// enough for callback payloads.
fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
