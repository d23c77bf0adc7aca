use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level config (marvin.toml + MARVIN_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MarvinConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Model selection and request shaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Concrete model id per abstract tier.
    #[serde(default)]
    pub models: ModelTable,
    /// Max tokens requested per completion.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Input window assumed for the selected models. Drives the emergency
    /// truncation budget on context-overflow recovery.
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            models: ModelTable::default(),
            max_tokens: default_max_tokens(),
            max_input_tokens: default_max_input_tokens(),
        }
    }
}

impl AgentConfig {
    /// Character budget per message used by emergency truncation.
    ///
    /// `max(10_000, max_input_tokens * 3.5 * 0.25)` — a quarter of the window
    /// at ~3.5 chars/token, floored so short windows still keep useful text.
    pub fn max_message_chars(&self) -> usize {
        let scaled = (self.max_input_tokens as f64 * 3.5 * 0.25) as usize;
        scaled.max(10_000)
    }
}

/// Concrete model id for each routing tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTable {
    #[serde(default = "default_model_fast")]
    pub fast: String,
    #[serde(default = "default_model_balanced")]
    pub balanced: String,
    #[serde(default = "default_model_smart")]
    pub smart: String,
    #[serde(default = "default_model_coding")]
    pub coding: String,
    #[serde(default = "default_model_deep")]
    pub deep: String,
}

impl Default for ModelTable {
    fn default() -> Self {
        Self {
            fast: default_model_fast(),
            balanced: default_model_balanced(),
            smart: default_model_smart(),
            coding: default_model_coding(),
            deep: default_model_deep(),
        }
    }
}

/// Per-turn orchestration limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Maximum tool-loop iterations before the fallback answer is synthesized.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Per-LLM-call timeout in seconds.
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    /// Whole-turn timeout in seconds.
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            llm_timeout_secs: default_llm_timeout_secs(),
            turn_timeout_secs: default_turn_timeout_secs(),
        }
    }
}

/// Skill routing (semantic pre-filter + LLM classifier).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Above this stage-1 score the classifier is skipped entirely.
    #[serde(default = "default_skip_classifier_threshold")]
    pub skip_classifier_threshold: f32,
    /// Minimum cosine score for a skill to survive the semantic pre-filter.
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    /// Candidates forwarded from stage 1 to the classifier.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// When false, stage 2 never runs and the semantic top hit wins.
    #[serde(default = "bool_true")]
    pub classifier_enabled: bool,
    /// Budget for the whole `match` call, in milliseconds.
    #[serde(default = "default_routing_timeout_ms")]
    pub timeout_ms: u64,
    /// Result cache TTL in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Result cache size bound; ~10% oldest entries are dropped when full.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            skip_classifier_threshold: default_skip_classifier_threshold(),
            min_score: default_min_score(),
            top_k: default_top_k(),
            classifier_enabled: true,
            timeout_ms: default_routing_timeout_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_max_entries: default_cache_max_entries(),
        }
    }
}

/// One token-bucket shape: `capacity` permits refilled every `period_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub capacity: u32,
    pub period_secs: u64,
}

/// Admission-control buckets per scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_user_bucket")]
    pub user: BucketConfig,
    #[serde(default = "default_channel_bucket")]
    pub channel: BucketConfig,
    #[serde(default = "default_llm_bucket")]
    pub llm: BucketConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            user: default_user_bucket(),
            channel: default_channel_bucket(),
            llm: default_llm_bucket(),
        }
    }
}

/// History summarization thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Estimated-token ceiling for the working message list.
    #[serde(default = "default_compaction_max_context_tokens")]
    pub max_context_tokens: u64,
    /// Messages preserved verbatim at the tail after a rewrite.
    #[serde(default = "default_keep_last_messages")]
    pub keep_last_messages: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_compaction_max_context_tokens(),
            keep_last_messages: default_keep_last_messages(),
        }
    }
}

/// Tool confirmation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    /// Seconds before an unanswered confirmation resolves as denied.
    #[serde(default = "default_confirmation_timeout_secs")]
    pub timeout_secs: u64,
    /// When true (the default), a missing confirmation affordance
    /// auto-approves instead of deadlocking the tool loop. Production
    /// deployments that prefer fail-closed set this to false.
    #[serde(default = "bool_true")]
    pub fail_open: bool,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_confirmation_timeout_secs(),
            fail_open: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_max_tokens() -> u32 {
    4096
}
fn default_max_input_tokens() -> u32 {
    200_000
}
fn default_model_fast() -> String {
    "claude-haiku-4-5".to_string()
}
fn default_model_balanced() -> String {
    "claude-sonnet-4-6".to_string()
}
fn default_model_smart() -> String {
    "claude-opus-4-6".to_string()
}
fn default_model_coding() -> String {
    "claude-sonnet-4-6".to_string()
}
fn default_model_deep() -> String {
    "claude-opus-4-6".to_string()
}
fn default_max_iterations() -> u32 {
    8
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_turn_timeout_secs() -> u64 {
    300
}
fn default_skip_classifier_threshold() -> f32 {
    0.95
}
fn default_min_score() -> f32 {
    0.30
}
fn default_top_k() -> usize {
    5
}
fn default_routing_timeout_ms() -> u64 {
    400
}
fn default_cache_ttl_secs() -> u64 {
    3600
}
fn default_cache_max_entries() -> usize {
    256
}
fn default_user_bucket() -> BucketConfig {
    BucketConfig {
        capacity: 20,
        period_secs: 60,
    }
}
fn default_channel_bucket() -> BucketConfig {
    BucketConfig {
        capacity: 60,
        period_secs: 60,
    }
}
fn default_llm_bucket() -> BucketConfig {
    BucketConfig {
        capacity: 120,
        period_secs: 60,
    }
}
fn default_compaction_max_context_tokens() -> u64 {
    24_000
}
fn default_keep_last_messages() -> usize {
    5
}
fn default_confirmation_timeout_secs() -> u64 {
    60
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.marvin/marvin.db", home)
}
fn bool_true() -> bool {
    true
}

impl MarvinConfig {
    /// Load config from a TOML file with MARVIN_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: MarvinConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("MARVIN_").split("_"))
            .extract()
            .map_err(|e| crate::error::MarvinError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.marvin/marvin.toml", home)
}
