//! System prompt assembly.
//!
//! The prompt is rebuilt from the same inputs every iteration, so for a given
//! turn context the result is stable: skill index + active skill prompt +
//! memory pack + plan-mode block. Tool schemas travel separately on the
//! request (see `tool_loop::tool_definitions`).

use async_trait::async_trait;

use marvin_sessions::{Plan, SessionKey};

use crate::skills::Skill;

/// Outbound port to the memory component. The core only consumes the
/// rendered context string; how it is produced is not its business.
#[async_trait]
pub trait MemoryPort: Send + Sync {
    async fn render_context(&self, key: &SessionKey) -> Option<String>;
}

/// Memory port for deployments without a memory component.
pub struct NullMemory;

#[async_trait]
impl MemoryPort for NullMemory {
    async fn render_context(&self, _key: &SessionKey) -> Option<String> {
        None
    }
}

const BASE_PROMPT: &str = "You are Marvin, a conversational assistant reachable \
through chat channels. Answer concisely; use tools when they genuinely help.";

/// Assemble the system prompt for one turn.
pub fn build_system_prompt(
    skills: &[Skill],
    active_skill: Option<&Skill>,
    memory_context: Option<&str>,
    active_plan: Option<&Plan>,
) -> String {
    let mut prompt = String::from(BASE_PROMPT);

    let available: Vec<&Skill> = skills.iter().filter(|s| s.available).collect();
    if !available.is_empty() {
        prompt.push_str("\n\n## Skills\n");
        for skill in &available {
            prompt.push_str(&format!("- {}: {}\n", skill.name, skill.description));
        }
    }

    if let Some(skill) = active_skill {
        if !skill.prompt_template.trim().is_empty() {
            prompt.push_str(&format!(
                "\n\n## Active skill: {}\n{}",
                skill.name, skill.prompt_template
            ));
        }
    }

    if let Some(memory) = memory_context {
        if !memory.trim().is_empty() {
            prompt.push_str(&format!("\n\n## What you know about this user\n{memory}"));
        }
    }

    if let Some(plan) = active_plan {
        prompt.push_str(&format!(
            "\n\n## Plan mode\n\
             Plan mode is active (plan status: {status}). The canonical plan \
             document lives outside this prompt: read it with the `plan_get` \
             tool and write it with `plan_set_content`. While the plan is \
             being drafted, other tool calls are recorded as plan steps \
             instead of executing. Saving the plan presents it to the user \
             for approval.",
            status = plan.status.as_str(),
        ));
    }

    prompt
}
