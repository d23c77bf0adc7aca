//! Skill catalog types.
//!
//! A skill is a named persona/prompt bundle. The router picks one per turn;
//! the context builder injects its full prompt and filters the advertised
//! tools by its capability list.

use serde::{Deserialize, Serialize};

/// A routable skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    /// One-paragraph description — this is what gets embedded for routing.
    pub description: String,
    /// Full prompt injected when the skill is active.
    pub prompt_template: String,
    /// Unavailable skills are kept in the catalog but never indexed or routed.
    #[serde(default = "bool_true")]
    pub available: bool,
    /// Tool names this skill may use. Empty means every registered tool.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn bool_true() -> bool {
    true
}

impl Skill {
    /// Whether the named tool is visible while this skill is active.
    pub fn allows_tool(&self, tool_name: &str) -> bool {
        self.capabilities.is_empty() || self.capabilities.iter().any(|c| c == tool_name)
    }

    /// Text sent to the embedding provider for this skill.
    pub fn embedding_text(&self) -> String {
        format!("{}: {}", self.name, self.description)
    }
}
