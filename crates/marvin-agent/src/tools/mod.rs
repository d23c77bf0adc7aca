//! Tool system for LLM tool calling.
//!
//! `Tool` is the outbound execution port; the registry is a frozen lookup
//! table built at composition time. The tool loop in `tool_loop.rs` drives
//! execution; plan-mode interception lives in `interceptor.rs`.

pub mod interceptor;
pub mod tool_loop;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use marvin_channels::OutgoingAttachment;

use crate::provider::ToolDefinition;
use crate::skills::Skill;

/// Canonical tool-result text when the user denies a confirmation.
pub const DENIED_MARKER: &str = "[user denied tool execution]";

/// Synthetic result for calls consumed as plan steps.
pub const PLANNED_MARKER: &str = "[Planned]";

/// Result of executing a tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResult {
    /// Text content returned to the LLM.
    pub content: String,
    /// Whether the tool execution failed.
    pub is_error: bool,
    /// Files/images produced by the tool, forwarded to the outgoing response.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<OutgoingAttachment>,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            attachments: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
            attachments: Vec::new(),
        }
    }
}

/// One tool call's outcome, ready to append to history.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call_id: String,
    pub name: String,
    pub result: ToolResult,
    pub confirmation_denied: bool,
}

impl ToolOutcome {
    pub fn denied(call_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            result: ToolResult::error(DENIED_MARKER),
            confirmation_denied: true,
        }
    }
}

/// Trait that all tools implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name for this tool (e.g. "fs_read").
    fn name(&self) -> &str;
    /// Human-readable description of what this tool does.
    fn description(&self) -> &str;
    /// JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;
    /// When `Some`, the invocation needs user confirmation; the string is the
    /// description shown next to the approve/deny affordances.
    fn confirmation_prompt(&self, _args: &serde_json::Value) -> Option<String> {
        None
    }
    /// Execute the tool with the given input.
    async fn execute(&self, args: serde_json::Value) -> ToolResult;
}

/// Frozen name → tool lookup table.
///
/// Built once at composition time, before the first turn runs.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// API-level definitions for the tools the active skill may use.
    ///
    /// `active_skill = None` exposes the full registry. The list is sorted by
    /// name so requests are deterministic.
    pub fn definitions_for(&self, active_skill: Option<&Skill>) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|t| active_skill.is_none_or(|s| s.allows_tool(t.name())))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}
