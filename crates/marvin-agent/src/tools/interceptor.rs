//! Plan-mode tool-call interception.
//!
//! Sits between the LLM response and real tool execution. While a plan is
//! being drafted, ordinary tool calls become synthetic `[Planned]` results
//! instead of running; `plan_set_content` persists the canonical document and
//! finalizes the turn; `plan_get` answers from the registry. Outside plan
//! mode the plan tools are denied and everything else passes through.

use serde_json::json;
use tracing::{debug, info};

use marvin_sessions::{PlanStatus, SessionKey, ToolCallRecord};

use crate::plan::{PlanError, PlanRegistry, PlanUpdate};
use crate::provider::ToolDefinition;
use crate::tools::{ToolOutcome, ToolResult, PLANNED_MARKER};

pub const PLAN_SET_CONTENT: &str = "plan_set_content";
pub const PLAN_GET: &str = "plan_get";

/// Definitions for the plan tools, advertised only while plan mode is active.
pub fn plan_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: PLAN_SET_CONTENT.to_string(),
            description: "Save the canonical plan document. Writing the plan \
                          finalizes the draft and presents it for approval."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "plan_markdown": {
                        "type": "string",
                        "description": "Full plan document in markdown"
                    },
                    "title": {
                        "type": "string",
                        "description": "Short plan title"
                    }
                },
                "required": ["plan_markdown"]
            }),
        },
        ToolDefinition {
            name: PLAN_GET.to_string(),
            description: "Retrieve the canonical plan document and its status.".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        },
    ]
}

/// What should happen to one tool call after interception.
pub enum Disposition {
    /// Execute for real through the tool registry.
    Execute(ToolCallRecord),
    /// Append this outcome without executing anything.
    Synthetic(ToolOutcome),
}

/// Result of intercepting one batch of tool calls.
pub struct Interception {
    /// One entry per incoming call, in the LLM's original order.
    pub dispositions: Vec<Disposition>,
    /// Set when a `plan_set_content` landed; the tool loop then terminates
    /// the turn with the plan card.
    pub finalized: Option<PlanUpdate>,
}

/// Run the state machine over one batch of tool calls.
pub fn intercept(
    plans: &PlanRegistry,
    key: &SessionKey,
    calls: &[ToolCallRecord],
) -> Interception {
    let mut status = plans.get_active(key).map(|p| p.status);
    let mut dispositions = Vec::with_capacity(calls.len());
    let mut finalized: Option<PlanUpdate> = None;

    for call in calls {
        match call.name.as_str() {
            PLAN_GET => dispositions.push(Disposition::Synthetic(handle_plan_get(
                plans, key, call,
            ))),
            PLAN_SET_CONTENT => {
                let (outcome, update) = handle_set_content(plans, key, call);
                dispositions.push(Disposition::Synthetic(outcome));
                if let Some(update) = update {
                    status = Some(update.plan.status);
                    finalized = Some(update);
                }
            }
            _ => match status {
                // Drafting: consume the call as a plan step.
                Some(PlanStatus::Collecting) | Some(PlanStatus::Ready) => {
                    debug!(tool = %call.name, "plan mode: call recorded as plan step");
                    dispositions.push(Disposition::Synthetic(planned(call)));
                }
                // Executing or no plan: run it for real.
                _ => dispositions.push(Disposition::Execute(call.clone())),
            },
        }
    }

    Interception {
        dispositions,
        finalized,
    }
}

fn handle_plan_get(plans: &PlanRegistry, key: &SessionKey, call: &ToolCallRecord) -> ToolOutcome {
    let result = match plans.get_active(key) {
        None => policy_denied(),
        Some(plan) => ToolResult::success(
            json!({
                "id": plan.id,
                "title": plan.title,
                "status": plan.status.as_str(),
                "markdown": plan.markdown,
            })
            .to_string(),
        ),
    };
    ToolOutcome {
        call_id: call.id.clone(),
        name: call.name.clone(),
        result,
        confirmation_denied: false,
    }
}

fn handle_set_content(
    plans: &PlanRegistry,
    key: &SessionKey,
    call: &ToolCallRecord,
) -> (ToolOutcome, Option<PlanUpdate>) {
    let markdown = call
        .arguments
        .get("plan_markdown")
        .and_then(|v| v.as_str());
    let title = call.arguments.get("title").and_then(|v| v.as_str());

    let (result, update) = match markdown {
        None => (ToolResult::error("plan_markdown is required"), None),
        Some(markdown) => match plans.set_content(key, markdown, title) {
            Ok(update) => {
                info!(plan = %update.plan.id, "plan content saved");
                (
                    ToolResult::success(format!(
                        "Plan saved (status: {})",
                        update.plan.status.as_str()
                    )),
                    Some(update),
                )
            }
            Err(PlanError::Inactive) => (policy_denied(), None),
            Err(e) => (ToolResult::error(e.to_string()), None),
        },
    };

    (
        ToolOutcome {
            call_id: call.id.clone(),
            name: call.name.clone(),
            result,
            confirmation_denied: false,
        },
        update,
    )
}

fn policy_denied() -> ToolResult {
    ToolResult::error("plan mode inactive — enable it with /plan on")
}

fn planned(call: &ToolCallRecord) -> ToolOutcome {
    ToolOutcome {
        call_id: call.id.clone(),
        name: call.name.clone(),
        result: ToolResult::success(format!(
            "{PLANNED_MARKER} {} recorded as a plan step, not executed",
            call.name
        )),
        confirmation_denied: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marvin_sessions::SessionStore;
    use std::sync::Arc;

    fn registry() -> PlanRegistry {
        PlanRegistry::new(Arc::new(SessionStore::in_memory().unwrap()))
    }

    fn key() -> SessionKey {
        SessionKey::new("telegram", "42")
    }

    fn call(name: &str, args: serde_json::Value) -> ToolCallRecord {
        ToolCallRecord {
            id: format!("call-{name}"),
            name: name.into(),
            arguments: args,
        }
    }

    #[test]
    fn plan_tools_denied_outside_plan_mode() {
        let plans = registry();
        let batch = [call(PLAN_SET_CONTENT, json!({"plan_markdown": "# P"}))];
        let interception = intercept(&plans, &key(), &batch);

        assert!(interception.finalized.is_none());
        match &interception.dispositions[0] {
            Disposition::Synthetic(outcome) => {
                assert!(outcome.result.is_error);
                assert!(outcome.result.content.contains("plan mode inactive"));
            }
            Disposition::Execute(_) => panic!("must not execute"),
        }
        // Registry untouched.
        assert!(!plans.is_active(&key()));
    }

    #[test]
    fn ordinary_calls_pass_through_outside_plan_mode() {
        let plans = registry();
        let batch = [call("fs_read", json!({"path": "README.md"}))];
        let interception = intercept(&plans, &key(), &batch);
        assert!(matches!(
            interception.dispositions[0],
            Disposition::Execute(_)
        ));
    }

    #[test]
    fn drafting_consumes_ordinary_calls_as_planned() {
        let plans = registry();
        plans.activate(&key(), "balanced").unwrap();
        let batch = [call("fs_read", json!({"path": "README.md"}))];
        let interception = intercept(&plans, &key(), &batch);
        match &interception.dispositions[0] {
            Disposition::Synthetic(outcome) => {
                assert!(outcome.result.content.starts_with(PLANNED_MARKER));
                assert!(!outcome.result.is_error);
            }
            Disposition::Execute(_) => panic!("drafting must not execute tools"),
        }
    }

    #[test]
    fn set_content_finalizes_and_readies_plan() {
        let plans = registry();
        plans.activate(&key(), "balanced").unwrap();
        let batch = [call(
            PLAN_SET_CONTENT,
            json!({"plan_markdown": "# Plan\n- step", "title": "Deploy"}),
        )];
        let interception = intercept(&plans, &key(), &batch);

        let update = interception.finalized.expect("finalized");
        assert_eq!(update.plan.status, PlanStatus::Ready);
        assert!(update.newly_ready);
        match &interception.dispositions[0] {
            Disposition::Synthetic(outcome) => {
                assert!(outcome.result.content.contains("ready"));
            }
            Disposition::Execute(_) => panic!("plan tool must not execute"),
        }
    }

    #[test]
    fn plan_get_returns_canonical_markdown() {
        let plans = registry();
        plans.activate(&key(), "balanced").unwrap();
        plans.set_content(&key(), "# The plan", None).unwrap();

        let batch = [call(PLAN_GET, json!({}))];
        let interception = intercept(&plans, &key(), &batch);
        match &interception.dispositions[0] {
            Disposition::Synthetic(outcome) => {
                let parsed: serde_json::Value =
                    serde_json::from_str(&outcome.result.content).unwrap();
                assert_eq!(parsed["markdown"], "# The plan");
                assert_eq!(parsed["status"], "ready");
            }
            Disposition::Execute(_) => panic!("plan tool must not execute"),
        }
    }

    #[test]
    fn executing_plan_passes_ordinary_calls_through() {
        let plans = registry();
        plans.activate(&key(), "balanced").unwrap();
        plans.set_content(&key(), "# P", None).unwrap();
        plans.approve(&key()).unwrap();

        let batch = [call("fs_read", json!({}))];
        let interception = intercept(&plans, &key(), &batch);
        assert!(matches!(
            interception.dispositions[0],
            Disposition::Execute(_)
        ));
    }

    #[test]
    fn revision_mid_execution_plans_subsequent_calls() {
        let plans = registry();
        plans.activate(&key(), "balanced").unwrap();
        plans.set_content(&key(), "v1", None).unwrap();
        plans.approve(&key()).unwrap();

        // One batch: revise the plan, then try another tool call.
        let batch = [
            call(PLAN_SET_CONTENT, json!({"plan_markdown": "v2"})),
            call("fs_read", json!({})),
        ];
        let interception = intercept(&plans, &key(), &batch);

        let update = interception.finalized.expect("finalized");
        assert!(update.superseded.is_some());
        // The follow-up call is consumed, not executed — the successor plan
        // is READY again.
        match &interception.dispositions[1] {
            Disposition::Synthetic(outcome) => {
                assert!(outcome.result.content.starts_with(PLANNED_MARKER));
            }
            Disposition::Execute(_) => panic!("post-revision call must not execute"),
        }
    }

    #[test]
    fn missing_markdown_argument_is_an_error_without_mutation() {
        let plans = registry();
        plans.activate(&key(), "balanced").unwrap();
        let batch = [call(PLAN_SET_CONTENT, json!({"title": "no body"}))];
        let interception = intercept(&plans, &key(), &batch);
        assert!(interception.finalized.is_none());
        assert_eq!(
            plans.get_active(&key()).unwrap().status,
            PlanStatus::Collecting
        );
    }
}
