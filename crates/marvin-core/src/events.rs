//! Domain events published by the turn scheduler.
//!
//! Fan-out via a tokio broadcast channel: emitters never block, lagging
//! subscribers lose old events rather than stalling a turn.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Events observable by dashboards, loggers and channel hosts.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    TurnStarted {
        session_key: String,
    },
    PlanReady {
        plan_id: String,
        session_key: String,
    },
    TurnCompleted {
        session_key: String,
        model_used: String,
        tool_calls: u32,
        duration_ms: u64,
    },
    TurnFailed {
        session_key: String,
        error_kind: String,
        message: String,
    },
}

/// Broadcast wrapper shared across turns.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. A send error only means nobody is listening.
    pub fn emit(&self, event: AgentEvent) {
        debug!(?event, "event emitted");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
