//! End-to-end turn scenarios driven through the scheduler with scripted
//! ports: a queued LLM provider, a fixed-axis embedder and a recording
//! channel.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use marvin_agent::confirm::ConfirmationBroker;
use marvin_agent::embedding::{EmbeddingError, EmbeddingProvider};
use marvin_agent::pipeline::prompt::NullMemory;
use marvin_agent::pipeline::turn::{TurnScheduler, FEEDBACK_FALLBACK};
use marvin_agent::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError, Usage};
use marvin_agent::runtime::{AgentRuntime, RuntimePorts};
use marvin_agent::skills::Skill;
use marvin_agent::tools::{Tool, ToolRegistry, ToolResult, DENIED_MARKER};
use marvin_channels::{Channel, InboundMessage, OutgoingAttachment, ResponseRouter};
use marvin_core::{AgentEvent, MarvinConfig};
use marvin_sessions::{Message, PlanStatus, Role, SessionKey, SessionStore, ToolCallRecord};

// ── Scripted ports ─────────────────────────────────────────────────

struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<ChatResponse, ProviderError>>>,
}

impl ScriptedProvider {
    fn new(replies: Vec<Result<ChatResponse, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
        })
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut replies = self.replies.lock().unwrap();
        match replies.pop_front() {
            Some(Ok(mut resp)) => {
                resp.model = req.model.clone();
                Ok(resp)
            }
            Some(Err(e)) => Err(e),
            None => Ok(text_response("fallthrough")),
        }
    }
}

struct AxisEmbedder;

#[async_trait]
impl EmbeddingProvider for AxisEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let lower = text.to_lowercase();
        Ok(if lower.contains("greeting") || lower.contains("hi") {
            vec![1.0, 0.0]
        } else {
            vec![0.0, 1.0]
        })
    }
}

/// Records every delivery; resolves confirmations with a fixed decision.
struct RecordingChannel {
    log: Mutex<Vec<String>>,
    broker: Mutex<Option<Arc<ConfirmationBroker>>>,
    approve: bool,
}

impl RecordingChannel {
    fn new(approve: bool) -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            broker: Mutex::new(None),
            approve,
        })
    }

    fn attach_broker(&self, broker: Arc<ConfirmationBroker>) {
        *self.broker.lock().unwrap() = Some(broker);
    }

    fn sent_texts(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send_text(&self, _chat_id: &str, text: &str) -> marvin_channels::error::Result<()> {
        self.log.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn send_voice(&self, _chat_id: &str, _text: &str) -> marvin_channels::error::Result<()> {
        Ok(())
    }

    async fn send_attachment(
        &self,
        _chat_id: &str,
        _attachment: &OutgoingAttachment,
    ) -> marvin_channels::error::Result<()> {
        Ok(())
    }

    async fn present_confirmation(
        &self,
        _chat_id: &str,
        confirmation_id: &str,
        _tool_name: &str,
        _description: &str,
    ) -> marvin_channels::error::Result<()> {
        let broker = self.broker.lock().unwrap().clone();
        if let Some(broker) = broker {
            broker.resolve(confirmation_id, self.approve);
        }
        Ok(())
    }
}

struct FsReadTool;

#[async_trait]
impl Tool for FsReadTool {
    fn name(&self) -> &str {
        "fs_read"
    }
    fn description(&self) -> &str {
        "Read the contents of a file"
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        })
    }
    async fn execute(&self, _args: serde_json::Value) -> ToolResult {
        ToolResult::success("hello")
    }
}

struct ShellTool;

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell_exec"
    }
    fn description(&self) -> &str {
        "Run a shell command"
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {"cmd": {"type": "string"}}})
    }
    fn confirmation_prompt(&self, args: &serde_json::Value) -> Option<String> {
        Some(format!(
            "run `{}`?",
            args.get("cmd").and_then(|v| v.as_str()).unwrap_or("?")
        ))
    }
    async fn execute(&self, _args: serde_json::Value) -> ToolResult {
        ToolResult::success("command ran")
    }
}

// ── Harness ────────────────────────────────────────────────────────

fn text_response(text: &str) -> ChatResponse {
    ChatResponse {
        content: text.into(),
        tool_calls: Vec::new(),
        model: "m".into(),
        finish_reason: "stop".into(),
        usage: Usage {
            tokens_in: 10,
            tokens_out: 5,
        },
    }
}

fn tool_call_response(id: &str, name: &str, args: serde_json::Value) -> ChatResponse {
    ChatResponse {
        content: String::new(),
        tool_calls: vec![ToolCallRecord {
            id: id.into(),
            name: name.into(),
            arguments: args,
        }],
        model: "m".into(),
        finish_reason: "tool_use".into(),
        usage: Usage {
            tokens_in: 10,
            tokens_out: 5,
        },
    }
}

struct World {
    scheduler: TurnScheduler,
    runtime: Arc<AgentRuntime>,
    channel: Arc<RecordingChannel>,
    store: Arc<SessionStore>,
}

async fn world_with(
    config: MarvinConfig,
    replies: Vec<Result<ChatResponse, ProviderError>>,
    approve_confirmations: bool,
    skills: Vec<Skill>,
) -> World {
    let store = Arc::new(SessionStore::in_memory().unwrap());
    let channel = RecordingChannel::new(approve_confirmations);
    let mut channels = ResponseRouter::new();
    channels.register(channel.clone());

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(FsReadTool));
    tools.register(Arc::new(ShellTool));

    let runtime = Arc::new(AgentRuntime::new(
        config,
        RuntimePorts {
            provider: ScriptedProvider::new(replies),
            embedder: Arc::new(AxisEmbedder),
            memory: Arc::new(NullMemory),
            store: Arc::clone(&store),
            tools,
            channels,
            summarizer: None,
        },
    ));
    runtime.register_skills(skills).await;
    channel.attach_broker(Arc::clone(&runtime.broker));

    World {
        scheduler: TurnScheduler::new(Arc::clone(&runtime)),
        runtime,
        channel,
        store,
    }
}

fn greeting_skill() -> Skill {
    Skill {
        name: "greeting".into(),
        description: "greeting and hi small talk".into(),
        prompt_template: "Greet warmly.".into(),
        available: true,
        capabilities: Vec::new(),
    }
}

fn inbound(content: &str) -> InboundMessage {
    InboundMessage {
        id: uuid::Uuid::new_v4().to_string(),
        channel: "telegram".into(),
        chat_id: "42".into(),
        sender_id: "u-1".into(),
        content: content.into(),
        attachments: Vec::new(),
        metadata: serde_json::Value::Null,
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

fn session_key() -> SessionKey {
    SessionKey::new("telegram", "42")
}

fn history_roles(store: &SessionStore) -> Vec<Role> {
    store
        .history(&session_key(), 50)
        .unwrap()
        .iter()
        .map(|m| m.role)
        .collect()
}

// ── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn plain_answer_routes_and_replies() {
    let world = world_with(
        MarvinConfig::default(),
        vec![Ok(text_response("Hello! How can I help?"))],
        true,
        vec![greeting_skill()],
    )
    .await;
    let mut events = world.runtime.events.subscribe();

    let response = world.scheduler.handle_message(inbound("hi")).await;

    assert_eq!(response.text.as_deref(), Some("Hello! How can I help?"));
    assert_eq!(world.channel.sent_texts(), vec!["Hello! How can I help?"]);
    assert_eq!(history_roles(&world.store), vec![Role::User, Role::Assistant]);

    // TurnStarted then TurnCompleted, with the balanced-tier model recorded.
    assert!(matches!(events.recv().await.unwrap(), AgentEvent::TurnStarted { .. }));
    match events.recv().await.unwrap() {
        AgentEvent::TurnCompleted { model_used, tool_calls, .. } => {
            assert_eq!(model_used, MarvinConfig::default().agent.models.balanced);
            assert_eq!(tool_calls, 0);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn single_tool_call_grows_history_by_four() {
    let world = world_with(
        MarvinConfig::default(),
        vec![
            Ok(tool_call_response(
                "call-1",
                "fs_read",
                serde_json::json!({"path": "README.md"}),
            )),
            Ok(text_response("It says hello.")),
        ],
        true,
        vec![],
    )
    .await;

    let response = world
        .scheduler
        .handle_message(inbound("what's in README?"))
        .await;

    assert_eq!(response.text.as_deref(), Some("It says hello."));
    assert_eq!(
        history_roles(&world.store),
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );

    let history = world.store.history(&session_key(), 50).unwrap();
    assert_eq!(history[1].tool_calls[0].name, "fs_read");
    assert_eq!(history[2].tool_call_id.as_deref(), Some("call-1"));
    assert_eq!(history[2].text(), "hello");
}

#[tokio::test]
async fn context_overflow_recovers_and_answers() {
    let mut config = MarvinConfig::default();
    config.agent.max_input_tokens = 1_000; // 10k-char truncation floor

    let world = world_with(
        config,
        vec![
            Err(ProviderError::Api {
                status: 400,
                message: "prompt exceeds maximum input length".into(),
            }),
            Ok(text_response("recovered")),
        ],
        true,
        vec![],
    )
    .await;

    // Seed an oversized message into the session before the turn.
    let key = session_key();
    world.store.get_or_create(&key).unwrap();
    world
        .store
        .append_message(&key, &Message::user("x".repeat(100_000), "t"))
        .unwrap();

    let response = world.scheduler.handle_message(inbound("summarize")).await;

    assert_eq!(response.text.as_deref(), Some("recovered"));
    let history = world.store.history(&key, 50).unwrap();
    assert!(history[0].text().chars().count() <= 10_000);
}

#[tokio::test]
async fn plan_drafting_produces_plan_card_and_event() {
    let world = world_with(
        MarvinConfig::default(),
        vec![Ok(tool_call_response(
            "call-1",
            "plan_set_content",
            serde_json::json!({"plan_markdown": "# Plan\n- research\n- build", "title": "Build it"}),
        ))],
        true,
        vec![],
    )
    .await;
    let mut events = world.runtime.events.subscribe();

    let enable = world.scheduler.handle_message(inbound("/plan on")).await;
    assert!(enable.text.unwrap().contains("Plan mode enabled"));

    let response = world
        .scheduler
        .handle_message(inbound("plan a deployment for me"))
        .await;

    let card = response.text.unwrap();
    assert!(card.contains("Build it"));
    assert!(card.contains("/plan approve"));

    let plan = world.runtime.plans.get_active(&session_key()).unwrap();
    assert_eq!(plan.status, PlanStatus::Ready);
    assert_eq!(plan.markdown, "# Plan\n- research\n- build");

    // Drain events until PlanReady shows up for this plan.
    let mut saw_plan_ready = false;
    while let Ok(event) = events.try_recv() {
        if let AgentEvent::PlanReady { plan_id, .. } = event {
            assert_eq!(plan_id, plan.id);
            saw_plan_ready = true;
        }
    }
    assert!(saw_plan_ready);
}

#[tokio::test]
async fn plan_tool_outside_plan_mode_is_denied_without_state_change() {
    let world = world_with(
        MarvinConfig::default(),
        vec![
            Ok(tool_call_response(
                "call-1",
                "plan_set_content",
                serde_json::json!({"plan_markdown": "# sneaky"}),
            )),
            Ok(text_response("understood, no plan mode")),
        ],
        true,
        vec![],
    )
    .await;

    let response = world.scheduler.handle_message(inbound("make a plan")).await;

    assert_eq!(response.text.as_deref(), Some("understood, no plan mode"));
    assert!(world.runtime.plans.get_active(&session_key()).is_none());

    let history = world.store.history(&session_key(), 50).unwrap();
    let tool_msg = history.iter().find(|m| m.role == Role::Tool).unwrap();
    assert!(tool_msg.text().contains("plan mode inactive"));
}

#[tokio::test]
async fn denied_confirmation_reaches_final_answer() {
    let world = world_with(
        MarvinConfig::default(),
        vec![
            Ok(tool_call_response(
                "call-1",
                "shell_exec",
                serde_json::json!({"cmd": "rm -rf /tmp/x"}),
            )),
            Ok(text_response("Okay — I didn't run it.")),
        ],
        false, // user denies
        vec![],
    )
    .await;

    let response = world
        .scheduler
        .handle_message(inbound("clean the temp dir"))
        .await;

    assert_eq!(response.text.as_deref(), Some("Okay — I didn't run it."));
    let history = world.store.history(&session_key(), 50).unwrap();
    let tool_msg = history.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(tool_msg.text(), DENIED_MARKER);
}

#[tokio::test]
async fn approved_confirmation_executes_tool() {
    let world = world_with(
        MarvinConfig::default(),
        vec![
            Ok(tool_call_response(
                "call-1",
                "shell_exec",
                serde_json::json!({"cmd": "ls"}),
            )),
            Ok(text_response("Done.")),
        ],
        true,
        vec![],
    )
    .await;

    world.scheduler.handle_message(inbound("list files")).await;
    let history = world.store.history(&session_key(), 50).unwrap();
    let tool_msg = history.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(tool_msg.text(), "command ran");
}

#[tokio::test]
async fn empty_responses_surface_llm_error() {
    let world = world_with(
        MarvinConfig::default(),
        vec![Ok(text_response("")), Ok(text_response(""))],
        true,
        vec![],
    )
    .await;

    let response = world.scheduler.handle_message(inbound("hello?")).await;
    assert!(response.error.is_some());
    assert!(response
        .text
        .unwrap()
        .contains("empty response"));
}

#[tokio::test]
async fn rate_limited_turn_never_reaches_the_llm() {
    let mut config = MarvinConfig::default();
    config.rate_limit.user.capacity = 1;

    let world = world_with(
        config,
        vec![Ok(text_response("first")), Ok(text_response("second"))],
        true,
        vec![],
    )
    .await;

    let first = world.scheduler.handle_message(inbound("one")).await;
    assert_eq!(first.text.as_deref(), Some("first"));

    let second = world.scheduler.handle_message(inbound("two")).await;
    assert!(second.error.is_some());
    assert!(second.text.unwrap().contains("too quickly"));
    // No user message or assistant reply was appended for the rejected turn.
    assert_eq!(
        history_roles(&world.store),
        vec![Role::User, Role::Assistant]
    );
}

#[tokio::test]
async fn feedback_guarantee_covers_silent_turns() {
    // Provider yields a response with no content and no tool calls twice
    // (exhausting the empty retry); llm_error path produces text. To hit the
    // pure fallback, use auto-mode off with an upstream-cleared error: here we
    // simulate by sending a command-free message while the provider returns
    // whitespace only.
    let world = world_with(
        MarvinConfig::default(),
        vec![Ok(text_response("   ")), Ok(text_response("   "))],
        true,
        vec![],
    )
    .await;

    let response = world.scheduler.handle_message(inbound("say nothing")).await;
    // Either the llm_error text or the feedback fallback — never silence.
    let text = response.text.unwrap();
    assert!(!text.is_empty());
    let _ = FEEDBACK_FALLBACK;
}

#[tokio::test]
async fn commands_bypass_the_llm() {
    let world = world_with(MarvinConfig::default(), vec![], true, vec![]).await;
    let response = world.scheduler.handle_message(inbound("/help")).await;
    assert!(response.text.unwrap().contains("Commands"));
    // Nothing was written to history for a command turn.
    assert!(world.store.history(&session_key(), 50).unwrap().is_empty());
}

#[tokio::test]
async fn plan_approve_unlocks_execution_for_next_turn() {
    let world = world_with(
        MarvinConfig::default(),
        vec![
            Ok(tool_call_response(
                "call-1",
                "plan_set_content",
                serde_json::json!({"plan_markdown": "# Plan\n- read file"}),
            )),
            Ok(tool_call_response(
                "call-2",
                "fs_read",
                serde_json::json!({"path": "README.md"}),
            )),
            Ok(text_response("Executed step one.")),
        ],
        true,
        vec![],
    )
    .await;

    world.scheduler.handle_message(inbound("/plan on")).await;
    world.scheduler.handle_message(inbound("draft the plan")).await;
    let approve = world.scheduler.handle_message(inbound("/plan approve")).await;
    assert!(approve.text.unwrap().contains("unlocked"));

    let response = world.scheduler.handle_message(inbound("go ahead")).await;
    assert_eq!(response.text.as_deref(), Some("Executed step one."));
    // The fs_read actually executed this time.
    let history = world.store.history(&session_key(), 50).unwrap();
    let executed = history
        .iter()
        .any(|m| m.role == Role::Tool && m.text() == "hello");
    assert!(executed);
}
