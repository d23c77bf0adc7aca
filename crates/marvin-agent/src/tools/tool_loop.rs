//! The bounded LLM ↔ tool fixed-point at the center of every turn.
//!
//! Flow per iteration: compact if oversized → build request → call LLM
//! (with overflow recovery and empty-response retry) → either finish with
//! the assistant's answer or run the tool calls (after plan interception)
//! and feed the results back. Stops on a final answer, plan finalization,
//! the iteration budget, or a fatal LLM error.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use marvin_channels::Channel;
use marvin_core::config::{AgentConfig, CompactionConfig, ConfirmationConfig, TurnConfig};
use marvin_core::MarvinError;
use marvin_sessions::{SessionStore, ToolCallRecord, UsageRecord};

use crate::confirm::ConfirmationBroker;
use crate::pipeline::compact::{compact_if_needed, Summarizer};
use crate::pipeline::context::TurnContext;
use crate::pipeline::flatten;
use crate::pipeline::history::HistoryWriter;
use crate::plan::{PlanRegistry, PlanUpdate};
use crate::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError, Usage};
use crate::skills::Skill;
use crate::tools::interceptor::{self, Disposition};
use crate::tools::{ToolOutcome, ToolRegistry, ToolResult};

/// Appended when emergency truncation trims an oversized message.
pub const TRUNCATION_MARKER: &str = "\n[content truncated after context overflow]";

/// Synthesized when the iteration budget runs out.
pub const BUDGET_FALLBACK: &str =
    "I hit the limit of tool calls for one message before finishing. \
     Here is where I got — ask me to continue if you'd like.";

/// Everything the loop needs, borrowed from the composition root.
pub struct ToolLoopDeps<'a> {
    pub provider: &'a dyn LlmProvider,
    pub registry: &'a ToolRegistry,
    pub plans: &'a PlanRegistry,
    pub broker: &'a ConfirmationBroker,
    /// Channel used to render confirmation affordances, when one exists.
    pub channel: Option<Arc<dyn Channel>>,
    pub history: &'a HistoryWriter,
    pub store: &'a SessionStore,
    pub summarizer: &'a dyn Summarizer,
    pub skills: &'a [Skill],
    pub turn: &'a TurnConfig,
    pub agent: &'a AgentConfig,
    pub compaction: &'a CompactionConfig,
    pub confirmation: &'a ConfirmationConfig,
}

/// How the loop ended.
pub enum LoopOutcome {
    /// Final assistant answer appended; `llm_response` holds it.
    FinalAnswer,
    /// A plan draft landed; the turn ends with the plan card.
    PlanFinalized(PlanUpdate),
    /// Fatal LLM failure; `llm_error` carries the user-facing text.
    Error,
}

/// Run the tool loop for one turn.
pub async fn run_tool_loop(
    ctx: &mut TurnContext,
    deps: &ToolLoopDeps<'_>,
) -> Result<LoopOutcome, MarvinError> {
    let model = ctx
        .selected_model()
        .ok_or_else(|| MarvinError::Internal("no model selected before tool loop".into()))?
        .to_string();

    // Model switch: rewrite provider-specific tool artifacts before the new
    // model sees them. The rewrite and the model stamp land together.
    if flatten::needs_flatten(ctx.session.last_model.as_deref(), &model, &ctx.messages) {
        info!(
            session = %ctx.key(),
            from = ctx.session.last_model.as_deref().unwrap_or("none"),
            to = %model,
            "flattening history for model switch"
        );
        let flat = flatten::flatten_messages(&ctx.messages);
        deps.history
            .rewrite(ctx, flat)
            .map_err(|e| MarvinError::Session(e.to_string()))?;
        deps.store
            .set_last_model(ctx.key(), &model)
            .map_err(|e| MarvinError::Session(e.to_string()))?;
        ctx.session.last_model = Some(model.clone());
    }

    for iteration in 0..deps.turn.max_iterations {
        ctx.attributes.current_iteration = iteration;
        if ctx.cancel.is_cancelled() {
            return Err(MarvinError::Timeout {
                ms: deps.turn.turn_timeout_secs * 1000,
            });
        }

        compact_if_needed(ctx, deps.compaction, deps.summarizer, deps.history).await;

        let request = ChatRequest {
            model: model.clone(),
            system: ctx.attributes.system_prompt.clone().unwrap_or_default(),
            messages: ctx.messages.clone(),
            max_tokens: deps.agent.max_tokens,
            tools: tool_definitions(ctx, deps),
        };

        debug!(iteration, session = %ctx.key(), "tool loop iteration");
        let Some(response) = call_llm(ctx, deps, request).await? else {
            return Ok(LoopOutcome::Error);
        };
        ctx.attributes.llm_response = Some(response.clone());

        if response.tool_calls.is_empty() {
            deps.history
                .append_final_assistant_answer(ctx, &response.content)
                .map_err(|e| MarvinError::Session(e.to_string()))?;
            info!(iteration, session = %ctx.key(), "tool loop complete");
            return Ok(LoopOutcome::FinalAnswer);
        }

        deps.history
            .append_assistant_tool_calls(ctx, &response)
            .map_err(|e| MarvinError::Session(e.to_string()))?;
        ctx.attributes.tool_calls = Some(response.tool_calls.clone());
        ctx.tool_call_count += response.tool_calls.len() as u32;

        let interception = interceptor::intercept(deps.plans, ctx.key(), &response.tool_calls);
        let outcomes = dispatch(ctx, deps, interception.dispositions).await;

        for outcome in &outcomes {
            ctx.tool_attachments
                .extend(outcome.result.attachments.iter().cloned());
            deps.history
                .append_tool_result(ctx, outcome)
                .map_err(|e| MarvinError::Session(e.to_string()))?;
        }

        if let Some(update) = interception.finalized {
            info!(plan = %update.plan.id, session = %ctx.key(), "tool loop: plan finalized");
            return Ok(LoopOutcome::PlanFinalized(update));
        }
    }

    warn!(
        max_iterations = deps.turn.max_iterations,
        session = %ctx.key(),
        "tool loop exhausted its iteration budget"
    );
    deps.history
        .append_final_assistant_answer(ctx, BUDGET_FALLBACK)
        .map_err(|e| MarvinError::Session(e.to_string()))?;
    ctx.attributes.llm_response = Some(ChatResponse {
        content: BUDGET_FALLBACK.to_string(),
        tool_calls: Vec::new(),
        model,
        finish_reason: "max_iterations".into(),
        usage: Usage::default(),
    });
    Ok(LoopOutcome::FinalAnswer)
}

/// Tool schemas for this iteration: registry filtered by the active skill,
/// plus the plan tools while plan mode is on.
fn tool_definitions(
    ctx: &TurnContext,
    deps: &ToolLoopDeps<'_>,
) -> Vec<crate::provider::ToolDefinition> {
    let active_skill = ctx
        .attributes
        .active_skill
        .as_deref()
        .and_then(|name| deps.skills.iter().find(|s| s.name == name));
    let mut defs = deps.registry.definitions_for(active_skill);
    if deps.plans.is_active(ctx.key()) {
        defs.extend(interceptor::plan_tool_definitions());
    }
    defs
}

/// One LLM call with the full recovery ladder:
/// timeout → surfaced; context overflow → truncate once and retry;
/// transient failure → one retry; empty response → one retry.
///
/// Returns `None` after setting `llm_error` when nothing usable came back.
async fn call_llm(
    ctx: &mut TurnContext,
    deps: &ToolLoopDeps<'_>,
    mut request: ChatRequest,
) -> Result<Option<ChatResponse>, MarvinError> {
    let call_timeout = Duration::from_secs(deps.turn.llm_timeout_secs);
    let mut truncated = false;
    let mut retried_empty = false;
    let mut retried_transient = false;

    loop {
        let outcome = match tokio::time::timeout(call_timeout, deps.provider.chat(&request)).await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                ms: call_timeout.as_millis() as u64,
            }),
        };

        match outcome {
            Ok(response) => {
                record_usage(ctx, deps, &request.model, response.usage);
                if response.is_empty() {
                    if !retried_empty {
                        retried_empty = true;
                        warn!(session = %ctx.key(), "LLM returned empty response, retrying once");
                        continue;
                    }
                    ctx.attributes.llm_error = Some("LLM returned empty response".into());
                    return Ok(None);
                }
                return Ok(Some(response));
            }
            Err(e) if e.is_context_overflow() && !truncated => {
                warn!(session = %ctx.key(), err = %e, "context overflow, emergency truncation");
                truncated = true;
                emergency_truncate(ctx, deps).await?;
                request.messages = ctx.messages.clone();
            }
            Err(e) => {
                let transient = matches!(
                    &e,
                    ProviderError::Unavailable(_) | ProviderError::Api { status: 500..=599, .. }
                );
                if transient && !retried_transient {
                    retried_transient = true;
                    warn!(session = %ctx.key(), err = %e, "transient LLM failure, retrying once");
                    continue;
                }
                warn!(session = %ctx.key(), err = %e, "LLM call failed");
                let friendly = match &e {
                    ProviderError::Timeout { .. } => {
                        "The model took too long to answer. Please try again."
                    }
                    ProviderError::RateLimited { .. } => {
                        "The model is rate limited right now. Please retry shortly."
                    }
                    _ if e.is_context_overflow() => {
                        "The conversation grew too large for the model. Try /reset to start fresh."
                    }
                    _ => "The language model is currently unavailable. Please try again shortly.",
                };
                ctx.attributes.llm_error = Some(friendly.to_string());
                return Ok(None);
            }
        }
    }
}

/// Trim every oversized message and append the truncation marker.
async fn emergency_truncate(
    ctx: &mut TurnContext,
    deps: &ToolLoopDeps<'_>,
) -> Result<(), MarvinError> {
    let max_chars = deps.agent.max_message_chars();
    let keep = max_chars.saturating_sub(TRUNCATION_MARKER.len());
    let mut changed = false;

    let rewritten: Vec<_> = ctx
        .messages
        .iter()
        .map(|msg| {
            if msg.text().chars().count() <= max_chars {
                return msg.clone();
            }
            changed = true;
            let mut trimmed = msg.clone();
            let mut content: String = msg.text().chars().take(keep).collect();
            content.push_str(TRUNCATION_MARKER);
            trimmed.content = Some(content);
            trimmed
        })
        .collect();

    if changed {
        info!(session = %ctx.key(), max_chars, "emergency truncation rewrote history");
        deps.history
            .rewrite(ctx, rewritten)
            .map_err(|e| MarvinError::Session(e.to_string()))?;
    }
    Ok(())
}

fn record_usage(ctx: &mut TurnContext, deps: &ToolLoopDeps<'_>, model: &str, usage: Usage) {
    ctx.tokens_used += (usage.tokens_in + usage.tokens_out) as u64;
    let record = UsageRecord {
        session_key: ctx.key().clone(),
        model: model.to_string(),
        tokens_in: usage.tokens_in,
        tokens_out: usage.tokens_out,
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    if let Err(e) = deps.store.record_usage(&record) {
        warn!(err = %e, "usage record failed");
    }
}

/// Execute the surviving calls and merge all outcomes back into the LLM's
/// original call order. Independent executions run concurrently; on turn
/// cancellation the in-flight futures are dropped and the batch reports
/// cancellation instead of fabricated results.
async fn dispatch(
    ctx: &TurnContext,
    deps: &ToolLoopDeps<'_>,
    dispositions: Vec<Disposition>,
) -> Vec<ToolOutcome> {
    let mut slots: Vec<Option<ToolOutcome>> = Vec::with_capacity(dispositions.len());
    let mut pending: Vec<(usize, ToolCallRecord)> = Vec::new();

    for (index, disposition) in dispositions.into_iter().enumerate() {
        match disposition {
            Disposition::Synthetic(outcome) => slots.push(Some(outcome)),
            Disposition::Execute(call) => {
                slots.push(None);
                pending.push((index, call));
            }
        }
    }

    let chat_id = ctx.inbound.chat_id.clone();
    let futures = pending.into_iter().map(|(index, call)| {
        let chat_id = chat_id.clone();
        async move { (index, execute_call(deps, &chat_id, call).await) }
    });

    let executed = tokio::select! {
        results = join_all(futures) => results,
        _ = ctx.cancel.cancelled() => {
            warn!(session = %ctx.key(), "tool batch cancelled mid-flight");
            Vec::new()
        }
    };
    for (index, outcome) in executed {
        slots[index] = Some(outcome);
    }

    // Cancelled slots still need a result so history stays one-to-one with
    // the call list.
    slots
        .into_iter()
        .enumerate()
        .map(|(i, slot)| {
            slot.unwrap_or_else(|| ToolOutcome {
                call_id: format!("cancelled-{i}"),
                name: "unknown".into(),
                result: ToolResult::error("execution cancelled"),
                confirmation_denied: false,
            })
        })
        .collect()
}

/// Execute one tool call, running the confirmation protocol when the tool
/// asks for it.
async fn execute_call(
    deps: &ToolLoopDeps<'_>,
    chat_id: &str,
    call: ToolCallRecord,
) -> ToolOutcome {
    let Some(tool) = deps.registry.get(&call.name) else {
        return ToolOutcome {
            call_id: call.id,
            name: call.name.clone(),
            result: ToolResult::error(format!("unknown tool: {}", call.name)),
            confirmation_denied: false,
        };
    };

    if let Some(description) = tool.confirmation_prompt(&call.arguments) {
        let approved = confirm(deps, chat_id, &call.name, &description).await;
        if !approved {
            info!(tool = %call.name, "tool execution denied");
            return ToolOutcome::denied(call.id, call.name);
        }
    }

    debug!(tool = %call.name, "executing tool");
    let result = tool.execute(call.arguments).await;
    ToolOutcome {
        call_id: call.id,
        name: call.name,
        result,
        confirmation_denied: false,
    }
}

/// Ask the user. Without a channel affordance the configured policy decides:
/// fail-open auto-approves, fail-closed denies.
async fn confirm(
    deps: &ToolLoopDeps<'_>,
    chat_id: &str,
    tool_name: &str,
    description: &str,
) -> bool {
    let Some(channel) = deps.channel.as_ref() else {
        if deps.confirmation.fail_open {
            warn!(tool = %tool_name, "no confirmation affordance; policy is fail-open, approving");
            return true;
        }
        warn!(tool = %tool_name, "no confirmation affordance; policy is fail-closed, denying");
        return false;
    };

    let (id, rx) = deps.broker.request();
    if let Err(e) = channel
        .present_confirmation(chat_id, &id, tool_name, description)
        .await
    {
        warn!(err = %e, tool = %tool_name, "confirmation affordance failed");
        let _ = deps.broker.resolve(&id, deps.confirmation.fail_open);
    }
    deps.broker.await_decision(&id, rx).await
}
