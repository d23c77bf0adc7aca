//! Plan registry — the state machine behind plan mode.
//!
//! At most one active plan per session. Transitions are serialized on the
//! per-session active entry, and terminal plans are never mutated. The
//! canonical plan document only changes through `set_content`.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use marvin_sessions::{Plan, PlanStatus, SessionKey, SessionStore};

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("plan mode inactive")]
    Inactive,

    #[error("plan {id} is {status:?} and cannot change")]
    Terminal { id: String, status: PlanStatus },

    #[error("plan is not awaiting approval")]
    NotReady,

    #[error("Store error: {0}")]
    Store(#[from] marvin_sessions::SessionError),
}

/// Result of a `set_content` call.
#[derive(Debug, Clone)]
pub struct PlanUpdate {
    pub plan: Plan,
    /// True when the plan just entered READY (first draft or a successor).
    pub newly_ready: bool,
    /// Id of the superseded predecessor, when a revision during execution
    /// replaced the active plan.
    pub superseded: Option<String>,
}

/// Owns every plan; the turn context only ever holds plan ids.
pub struct PlanRegistry {
    store: Arc<SessionStore>,
    plans: DashMap<String, Plan>,
    /// session key → active plan id. Entry-level locking serializes all
    /// transitions for a session.
    active: DashMap<String, String>,
}

impl PlanRegistry {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self {
            store,
            plans: DashMap::new(),
            active: DashMap::new(),
        }
    }

    /// Whether the session currently has plan mode active.
    pub fn is_active(&self, key: &SessionKey) -> bool {
        self.active.contains_key(&key.format())
    }

    /// Current active plan, if any.
    pub fn get_active(&self, key: &SessionKey) -> Option<Plan> {
        let id = self.active.get(&key.format())?.clone();
        self.plans.get(&id).map(|p| p.clone())
    }

    /// Load a plan by id.
    pub fn get(&self, id: &str) -> Option<Plan> {
        self.plans.get(id).map(|p| p.clone())
    }

    /// `plan on`: create a fresh COLLECTING plan unless one is already active.
    pub fn activate(&self, key: &SessionKey, model_tier: &str) -> Result<Plan, PlanError> {
        let entry = self.active.entry(key.format());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                // Plan mode already on — keep the existing plan.
                let id = occupied.get().clone();
                Ok(self.plans.get(&id).map(|p| p.clone()).expect("active plan exists"))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let now = chrono::Utc::now().to_rfc3339();
                let plan = Plan {
                    id: Uuid::now_v7().to_string(),
                    session_key: key.clone(),
                    status: PlanStatus::Collecting,
                    title: None,
                    markdown: String::new(),
                    model_tier: model_tier.to_string(),
                    created_at: now.clone(),
                    updated_at: now,
                };
                self.store.save_plan(&plan)?;
                self.plans.insert(plan.id.clone(), plan.clone());
                vacant.insert(plan.id.clone());
                info!(plan = %plan.id, session = %key, "plan mode activated");
                Ok(plan)
            }
        }
    }

    /// `plan_set_content`: persist the canonical markdown.
    ///
    /// COLLECTING → READY, READY → READY (overwrite), EXECUTING → supersede
    /// the current plan and start a READY successor. Denied when plan mode is
    /// inactive; terminal plans are unreachable through the active entry.
    pub fn set_content(
        &self,
        key: &SessionKey,
        markdown: &str,
        title: Option<&str>,
    ) -> Result<PlanUpdate, PlanError> {
        let key_str = key.format();
        let mut active = self.active.get_mut(&key_str).ok_or(PlanError::Inactive)?;
        let current_id = active.clone();
        let now = chrono::Utc::now().to_rfc3339();

        let mut current = self
            .plans
            .get_mut(&current_id)
            .expect("active plan must exist in the registry");

        match current.status {
            PlanStatus::Collecting | PlanStatus::Ready => {
                let newly_ready = current.status == PlanStatus::Collecting;
                current.status = PlanStatus::Ready;
                current.markdown = markdown.to_string();
                if let Some(title) = title {
                    current.title = Some(title.to_string());
                }
                current.updated_at = now;
                self.store.save_plan(&current)?;
                Ok(PlanUpdate {
                    plan: current.clone(),
                    newly_ready,
                    superseded: None,
                })
            }
            PlanStatus::Executing => {
                // Revision during execution: supersede atomically with
                // creating the successor. Both sides happen under the active
                // entry lock, so no reader sees a gap.
                current.status = PlanStatus::Superseded;
                current.updated_at = now.clone();
                self.store.save_plan(&current)?;
                let predecessor = current.clone();
                drop(current);

                let successor = Plan {
                    id: Uuid::now_v7().to_string(),
                    session_key: key.clone(),
                    status: PlanStatus::Ready,
                    title: title.map(String::from).or(predecessor.title.clone()),
                    markdown: markdown.to_string(),
                    model_tier: predecessor.model_tier.clone(),
                    created_at: chrono::Utc::now().to_rfc3339(),
                    updated_at: chrono::Utc::now().to_rfc3339(),
                };
                self.store.save_plan(&successor)?;
                self.plans.insert(successor.id.clone(), successor.clone());
                *active = successor.id.clone();
                info!(
                    superseded = %predecessor.id,
                    successor = %successor.id,
                    "plan revised during execution"
                );
                Ok(PlanUpdate {
                    plan: successor,
                    newly_ready: true,
                    superseded: Some(predecessor.id),
                })
            }
            status => {
                warn!(plan = %current_id, ?status, "set_content on terminal plan");
                Err(PlanError::Terminal {
                    id: current_id,
                    status,
                })
            }
        }
    }

    /// User approval: READY → EXECUTING.
    pub fn approve(&self, key: &SessionKey) -> Result<Plan, PlanError> {
        let key_str = key.format();
        let active = self.active.get(&key_str).ok_or(PlanError::Inactive)?;
        let mut plan = self
            .plans
            .get_mut(active.value())
            .expect("active plan must exist in the registry");
        if plan.status != PlanStatus::Ready {
            return Err(PlanError::NotReady);
        }
        plan.status = PlanStatus::Executing;
        plan.updated_at = chrono::Utc::now().to_rfc3339();
        self.store.save_plan(&plan)?;
        info!(plan = %plan.id, session = %key_str, "plan approved, execution unlocked");
        Ok(plan.clone())
    }

    /// `plan off` / reset: cancel the active plan, deactivate plan mode.
    pub fn cancel(&self, key: &SessionKey) -> Option<Plan> {
        self.finish(key, PlanStatus::Cancelled)
    }

    /// Execution finished: mark DONE, deactivate plan mode.
    pub fn complete(&self, key: &SessionKey) -> Option<Plan> {
        self.finish(key, PlanStatus::Done)
    }

    fn finish(&self, key: &SessionKey, status: PlanStatus) -> Option<Plan> {
        let (_, id) = self.active.remove(&key.format())?;
        let mut plan = self.plans.get_mut(&id)?;
        if plan.status.is_terminal() {
            return Some(plan.clone());
        }
        plan.status = status;
        plan.updated_at = chrono::Utc::now().to_rfc3339();
        let _ = self.store.save_plan(&plan);
        info!(plan = %plan.id, status = %status.as_str(), "plan deactivated");
        Some(plan.clone())
    }
}

/// Compact markdown card shown to the user when a plan awaits approval.
pub fn render_plan_card(plan: &Plan) -> String {
    let title = plan.title.as_deref().unwrap_or("Untitled plan");
    let preview: String = plan
        .markdown
        .lines()
        .take(12)
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "**Plan: {title}** _({status})_\n\n{preview}\n\nReply `/plan approve` to run it, `/plan off` to discard.",
        status = plan.status.as_str(),
    )
}
