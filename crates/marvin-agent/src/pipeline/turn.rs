//! Per-turn lifecycle: ordering, timeout, cancellation, feedback guarantee.
//!
//! One inbound message → one turn. The scheduler acquires the session lock
//! (turns for one session are strictly serial), runs the stages in fixed
//! order, converts every failure into a user-visible response, and publishes
//! the domain events. Errors never cross the turn boundary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use marvin_channels::{InboundMessage, OutgoingResponse};
use marvin_core::sanitize::sanitize;
use marvin_core::{AgentEvent, MarvinError};
use marvin_sessions::SessionKey;

use crate::aggregate::build_routing_query;
use crate::pipeline::commands::{handle_command, CommandDeps};
use crate::pipeline::context::TurnContext;
use crate::pipeline::outgoing::prepare_outgoing;
use crate::pipeline::prompt::build_system_prompt;
use crate::plan::render_plan_card;
use crate::runtime::AgentRuntime;
use crate::tools::tool_loop::{run_tool_loop, LoopOutcome, ToolLoopDeps};

/// Synthesized when a finished turn still has nothing to say.
pub const FEEDBACK_FALLBACK: &str = "I was unable to produce a response.";

/// How much history one turn loads into its working list.
const HISTORY_WINDOW: usize = 40;

pub struct TurnScheduler {
    runtime: Arc<AgentRuntime>,
}

impl TurnScheduler {
    pub fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self { runtime }
    }

    /// Process one inbound message end to end.
    ///
    /// Returns the response that was handed to the response router (useful
    /// for hosts that also carry the reply in-band, e.g. request/response
    /// channels).
    pub async fn handle_message(&self, mut inbound: InboundMessage) -> OutgoingResponse {
        let rt = &self.runtime;
        let key = SessionKey::new(&inbound.channel, &inbound.chat_id);
        // FIFO per-session permit: turn N's sends finish before N+1 starts.
        let _permit = rt.locks.acquire(&key.format()).await;
        let started = Instant::now();
        rt.events.emit(AgentEvent::TurnStarted {
            session_key: key.format(),
        });

        // Admission control — a rejected turn never reaches the LLM.
        if let Some(denied) = self.rate_gate(&inbound) {
            rt.events.emit(AgentEvent::TurnFailed {
                session_key: key.format(),
                error_kind: "RateLimited".into(),
                message: "admission rejected".into(),
            });
            return self.dispatch(&inbound, denied).await;
        }

        inbound.content = sanitize(&inbound.content);
        inbound.validate_attachments();

        // Command layer: replies without spending an LLM call.
        let command_deps = CommandDeps {
            plans: &rt.plans,
            store: &rt.store,
            tier_override: rt.tier_override(),
        };
        if let Some(response) = handle_command(&inbound.content, &key, &command_deps) {
            rt.events.emit(AgentEvent::TurnCompleted {
                session_key: key.format(),
                model_used: "command".into(),
                tool_calls: 0,
                duration_ms: started.elapsed().as_millis() as u64,
            });
            return self.dispatch(&inbound, response).await;
        }

        let mut ctx = match self.build_context(&key, inbound.clone()) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(session = %key, err = %e, "turn setup failed");
                rt.events.emit(AgentEvent::TurnFailed {
                    session_key: key.format(),
                    error_kind: e.kind().into(),
                    message: e.to_string(),
                });
                return self
                    .dispatch(&inbound, OutgoingResponse::from_error(e.kind(), e.user_message()))
                    .await;
            }
        };

        // The whole turn runs under one deadline; expiry cancels in-flight
        // tool executions and their late results are discarded with them.
        let deadline = Duration::from_secs(rt.config.turn.turn_timeout_secs);
        let cancel = ctx.cancel.clone();
        let result = tokio::select! {
            result = self.run_stages(&mut ctx) => result,
            _ = tokio::time::sleep(deadline) => {
                cancel.cancel();
                Err(MarvinError::Timeout {
                    ms: deadline.as_millis() as u64,
                })
            }
        };

        let mut failure: Option<MarvinError> = None;
        if let Err(e) = result {
            warn!(session = %key, err = %e, kind = e.kind(), "turn failed");
            if ctx.attributes.outgoing_response.is_none() && ctx.attributes.llm_error.is_none() {
                ctx.attributes.llm_error = Some(e.user_message());
            }
            failure = Some(e);
        }

        prepare_outgoing(&mut ctx);

        // Feedback guarantee: every non-auto turn says *something*.
        let needs_fallback = !ctx.auto_mode
            && ctx
                .attributes
                .outgoing_response
                .as_ref()
                .is_none_or(|r| r.is_empty());
        if needs_fallback {
            ctx.attributes.outgoing_response =
                Some(OutgoingResponse::text_only(FEEDBACK_FALLBACK));
        }

        let response = ctx
            .attributes
            .outgoing_response
            .clone()
            .unwrap_or_default();
        let dispatched = self.dispatch(&inbound, response).await;

        match failure {
            Some(e) => rt.events.emit(AgentEvent::TurnFailed {
                session_key: key.format(),
                error_kind: e.kind().into(),
                message: e.to_string(),
            }),
            None => {
                let model_used = ctx
                    .attributes
                    .llm_model
                    .clone()
                    .unwrap_or_else(|| "none".into());
                if ctx.tokens_used > 0 {
                    if let Err(e) = rt.store.update_stats(&key, ctx.tokens_used, &model_used) {
                        warn!(session = %key, err = %e, "stats update failed");
                    }
                }
                info!(
                    session = %key,
                    model = %model_used,
                    tool_calls = ctx.tool_call_count,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "turn complete"
                );
                rt.events.emit(AgentEvent::TurnCompleted {
                    session_key: key.format(),
                    model_used,
                    tool_calls: ctx.tool_call_count,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
        }

        dispatched
    }

    /// Check the user / channel / provider buckets.
    fn rate_gate(&self, inbound: &InboundMessage) -> Option<OutgoingResponse> {
        let rt = &self.runtime;
        let decisions = [
            rt.rate_limit.try_consume(),
            rt.rate_limit.try_consume_channel(&inbound.channel),
            rt.rate_limit.try_consume_llm(rt.provider.name()),
        ];
        for decision in decisions {
            if !decision.allowed {
                let retry_after_ms = decision
                    .retry_after
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(1_000);
                warn!(channel = %inbound.channel, retry_after_ms, "turn rejected by rate limit");
                let err = MarvinError::RateLimited { retry_after_ms };
                return Some(OutgoingResponse::from_error(err.kind(), err.user_message()));
            }
        }
        None
    }

    /// Load the session, snapshot its history and append the user message.
    fn build_context(
        &self,
        key: &SessionKey,
        inbound: InboundMessage,
    ) -> Result<TurnContext, MarvinError> {
        let rt = &self.runtime;
        let session = rt
            .store
            .get_or_create(key)
            .map_err(|e| MarvinError::Session(e.to_string()))?;
        let history = rt
            .store
            .history(key, HISTORY_WINDOW)
            .map_err(|e| MarvinError::Session(e.to_string()))?;

        let auto_mode = inbound
            .metadata
            .get("auto_mode")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let content = inbound.content.clone();

        let mut ctx = TurnContext::new(session, history, inbound, CancellationToken::new());
        ctx.auto_mode = auto_mode;
        rt.history
            .append_user_message(&mut ctx, &content)
            .map_err(|e| MarvinError::Session(e.to_string()))?;
        Ok(ctx)
    }

    /// Stages 4–6: aggregation, routing, context build, tool loop.
    async fn run_stages(&self, ctx: &mut TurnContext) -> Result<(), MarvinError> {
        let rt = &self.runtime;

        // Fragmented turns route on the joined burst, not the last fragment.
        let query = build_routing_query(&ctx.messages);
        if query.analysis.fragmented {
            info!(
                session = %ctx.key(),
                joined = query.analysis.joined,
                signals = ?query.analysis.signals,
                "aggregated fragmented user turn for routing"
            );
        }

        let skills = rt.skills();
        let routing = rt.skill_router.route(&query.text, &ctx.messages, &skills).await;
        info!(
            session = %ctx.key(),
            skill = routing.skill.as_deref().unwrap_or("none"),
            tier = %routing.model_tier.as_str(),
            cached = routing.cached,
            classifier = routing.llm_classifier_used,
            "routing decided"
        );
        ctx.attributes.active_skill = routing.skill.clone();
        ctx.attributes.model_tier = Some(routing.model_tier);
        ctx.attributes.llm_model = Some(rt.resolve_model(routing.model_tier));
        ctx.attributes.routing_result = Some(routing);

        let memory_context = rt.memory.render_context(ctx.key()).await;
        let active_skill = ctx
            .attributes
            .active_skill
            .as_deref()
            .and_then(|name| skills.iter().find(|s| s.name == name));
        let active_plan = rt.plans.get_active(ctx.key());
        ctx.attributes.system_prompt = Some(build_system_prompt(
            &skills,
            active_skill,
            memory_context.as_deref(),
            active_plan.as_ref(),
        ));

        let deps = ToolLoopDeps {
            provider: rt.provider.as_ref(),
            registry: &rt.tools,
            plans: &rt.plans,
            broker: rt.broker.as_ref(),
            channel: rt.channels.channel(&ctx.inbound.channel),
            history: &rt.history,
            store: &rt.store,
            summarizer: rt.summarizer.as_ref(),
            skills: &skills,
            turn: &rt.config.turn,
            agent: &rt.config.agent,
            compaction: &rt.config.compaction,
            confirmation: &rt.config.confirmation,
        };

        match run_tool_loop(ctx, &deps).await? {
            LoopOutcome::FinalAnswer | LoopOutcome::Error => {}
            LoopOutcome::PlanFinalized(update) => {
                ctx.attributes.plan_approval_needed = true;
                ctx.attributes.outgoing_response =
                    Some(OutgoingResponse::text_only(render_plan_card(&update.plan)));
                if update.newly_ready {
                    rt.events.emit(AgentEvent::PlanReady {
                        plan_id: update.plan.id.clone(),
                        session_key: ctx.key().format(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Hand the finished response to the transport router.
    async fn dispatch(
        &self,
        inbound: &InboundMessage,
        response: OutgoingResponse,
    ) -> OutgoingResponse {
        let outcome = self
            .runtime
            .channels
            .dispatch(&inbound.channel, &inbound.chat_id, &response)
            .await;
        if !outcome.failures.is_empty() {
            warn!(
                channel = %inbound.channel,
                failures = ?outcome.failures,
                "some response parts failed to send"
            );
        }
        response
    }
}
