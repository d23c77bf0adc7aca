//! User command layer — intercepted before the AI pipeline.
//!
//! Commands drive plan mode and runtime switches without spending an LLM
//! call. Both `/plan on` and `plan on` forms are accepted. Returns
//! `Some(response)` when the message was a command, `None` when it should go
//! to the model.

use std::sync::RwLock;

use tracing::info;

use marvin_channels::OutgoingResponse;
use marvin_sessions::{SessionKey, SessionStore};

use crate::plan::{render_plan_card, PlanError, PlanRegistry};
use crate::skill_router::ModelTier;

/// What the command layer may touch.
pub struct CommandDeps<'a> {
    pub plans: &'a PlanRegistry,
    pub store: &'a SessionStore,
    pub tier_override: &'a RwLock<Option<ModelTier>>,
}

const HELP: &str = "**Commands**\n\
- `/plan on` — start drafting a plan\n\
- `/plan show` — show the current plan\n\
- `/plan approve` — approve the plan and unlock execution\n\
- `/plan off` — discard the plan and leave plan mode\n\
- `/model <fast|balanced|smart|coding|deep>` — pin a model tier\n\
- `/model auto` — let routing pick the tier again\n\
- `/reset` — clear this conversation\n\
- `/help` — this message";

/// Handle a user command. `None` means "not a command".
pub fn handle_command(
    text: &str,
    key: &SessionKey,
    deps: &CommandDeps<'_>,
) -> Option<OutgoingResponse> {
    let trimmed = text.trim();
    let normalized = trimmed.strip_prefix('/').unwrap_or(trimmed).to_lowercase();

    let reply = match normalized.as_str() {
        "help" => HELP.to_string(),

        "plan on" => match deps.plans.activate(key, ModelTier::Balanced.as_str()) {
            Ok(plan) => {
                info!(session = %key, plan = %plan.id, "plan mode enabled by user");
                "Plan mode enabled. Tell me what you want to achieve and I'll \
                 draft a plan for your approval."
                    .to_string()
            }
            Err(e) => format!("Could not enable plan mode: {e}"),
        },

        "plan off" => match deps.plans.cancel(key) {
            Some(_) => "Plan mode disabled; the draft was discarded.".to_string(),
            None => "Plan mode was not active.".to_string(),
        },

        "plan show" => match deps.plans.get_active(key) {
            Some(plan) => render_plan_card(&plan),
            None => "No active plan. Start one with `/plan on`.".to_string(),
        },

        "plan approve" => match deps.plans.approve(key) {
            Ok(plan) => {
                info!(session = %key, plan = %plan.id, "plan approved by user");
                "Plan approved — execution is unlocked. Tell me to proceed.".to_string()
            }
            Err(PlanError::Inactive) => "Plan mode is not active.".to_string(),
            Err(PlanError::NotReady) => {
                "There is no plan awaiting approval yet.".to_string()
            }
            Err(e) => format!("Could not approve the plan: {e}"),
        },

        "reset" => {
            deps.plans.cancel(key);
            match deps.store.replace_messages(key, &[]) {
                Ok(()) => "Conversation cleared. Fresh start.".to_string(),
                Err(e) => format!("Reset failed: {e}"),
            }
        }

        "model" => {
            let current = *deps.tier_override.read().unwrap();
            match current {
                Some(tier) => format!(
                    "Model tier is pinned to **{}**. Use `/model auto` to unpin.",
                    tier.as_str()
                ),
                None => "Model tier is chosen by routing. Pin one with \
                         `/model <fast|balanced|smart|coding|deep>`."
                    .to_string(),
            }
        }

        _ => {
            if let Some(arg) = normalized.strip_prefix("model ") {
                let arg = arg.trim();
                if arg == "auto" {
                    *deps.tier_override.write().unwrap() = None;
                    "Model tier unpinned — routing decides again.".to_string()
                } else if matches!(arg, "fast" | "balanced" | "smart" | "coding" | "deep") {
                    let tier = ModelTier::parse_lenient(arg);
                    *deps.tier_override.write().unwrap() = Some(tier);
                    info!(tier = %tier.as_str(), "model tier pinned via command");
                    format!("Model tier pinned to **{}**.", tier.as_str())
                } else {
                    format!(
                        "Unknown tier `{arg}`. Available: `fast`, `balanced`, \
                         `smart`, `coding`, `deep`, or `auto`."
                    )
                }
            } else {
                return None;
            }
        }
    };

    Some(OutgoingResponse::text_only(reply))
}
