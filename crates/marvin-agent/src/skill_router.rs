//! Hybrid skill routing: semantic pre-filter + LLM classifier.
//!
//! Stage 1 embeds the routing query and asks the skill index for the top
//! candidates. A very confident top hit short-circuits; otherwise stage 2
//! asks a cheap model to pick the skill and a model tier. Results are cached
//! per (query, candidate set) with TTL, and the whole match is bounded by a
//! routing timeout so a slow embedding endpoint cannot stall the turn.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use marvin_core::config::RouterConfig;
use marvin_sessions::{Message, Role};

use crate::embedding::EmbeddingProvider;
use crate::provider::{ChatRequest, LlmProvider};
use crate::skill_index::{ScoredSkill, SkillEmbeddingStore};
use crate::skills::Skill;

/// Abstract difficulty class selecting a concrete model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Fast,
    #[default]
    Balanced,
    Smart,
    Coding,
    Deep,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Fast => "fast",
            ModelTier::Balanced => "balanced",
            ModelTier::Smart => "smart",
            ModelTier::Coding => "coding",
            ModelTier::Deep => "deep",
        }
    }

    /// Parse a tier name; anything unrecognized maps to `Balanced`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "fast" => ModelTier::Fast,
            "balanced" => ModelTier::Balanced,
            "smart" => ModelTier::Smart,
            "coding" => ModelTier::Coding,
            "deep" => ModelTier::Deep,
            other => {
                debug!(tier = %other, "unknown model tier, using balanced");
                ModelTier::Balanced
            }
        }
    }
}

/// Outcome of one routing decision.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingResult {
    /// Selected skill, `None` when nothing matched.
    pub skill: Option<String>,
    pub confidence: f32,
    pub model_tier: ModelTier,
    pub llm_classifier_used: bool,
    pub cached: bool,
    pub reason: String,
}

impl RoutingResult {
    pub fn no_match(reason: impl Into<String>, tier: ModelTier) -> Self {
        Self {
            skill: None,
            confidence: 0.0,
            model_tier: tier,
            llm_classifier_used: false,
            cached: false,
            reason: reason.into(),
        }
    }
}

/// Strict reply shape expected from the classifier model.
#[derive(Debug, Deserialize)]
struct ClassifierVerdict {
    skill: String,
    #[serde(default = "default_confidence")]
    confidence: f32,
    #[serde(default)]
    model_tier: String,
    #[serde(default)]
    reason: String,
}

fn default_confidence() -> f32 {
    0.5
}

struct CachedRouting {
    result: RoutingResult,
    created_at: Instant,
}

/// Two-stage router shared across turns.
pub struct HybridSkillRouter {
    config: RouterConfig,
    store: Arc<SkillEmbeddingStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    classifier: Arc<dyn LlmProvider>,
    classifier_model: String,
    cache: DashMap<u64, CachedRouting>,
}

impl HybridSkillRouter {
    pub fn new(
        config: RouterConfig,
        store: Arc<SkillEmbeddingStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        classifier: Arc<dyn LlmProvider>,
        classifier_model: String,
    ) -> Self {
        Self {
            config,
            store,
            embedder,
            classifier,
            classifier_model,
            cache: DashMap::new(),
        }
    }

    /// Match a routing query against the available skills.
    ///
    /// Bounded by `router.timeout_ms`; on expiry the result is
    /// `no_match("timeout")` with the fast tier so the turn still proceeds.
    pub async fn route(
        &self,
        query: &str,
        recent: &[Message],
        skills: &[Skill],
    ) -> RoutingResult {
        let budget = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(budget, self.route_inner(query, recent, skills)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = self.config.timeout_ms, "router: match timed out");
                RoutingResult::no_match("timeout", ModelTier::Fast)
            }
        }
    }

    async fn route_inner(
        &self,
        query: &str,
        recent: &[Message],
        skills: &[Skill],
    ) -> RoutingResult {
        if query.trim().is_empty() || skills.is_empty() {
            return RoutingResult::no_match("nothing to route", ModelTier::Balanced);
        }

        let fingerprint = fingerprint(query, skills);
        if let Some(hit) = self.cache_get(fingerprint) {
            debug!(query_len = query.len(), "router: cache hit");
            return hit;
        }

        // Stage 1: semantic pre-filter.
        let candidates = match self.embedder.embed(query).await {
            Ok(vector) => {
                self.store
                    .find_similar(&vector, self.config.top_k, self.config.min_score)
            }
            Err(e) => {
                warn!(err = %e, "router: query embedding failed");
                Vec::new()
            }
        };

        let result = self.decide(query, recent, skills, candidates).await;
        self.cache_put(fingerprint, &result);
        result
    }

    async fn decide(
        &self,
        query: &str,
        recent: &[Message],
        skills: &[Skill],
        candidates: Vec<ScoredSkill>,
    ) -> RoutingResult {
        if let Some(top) = candidates.first() {
            if top.score >= self.config.skip_classifier_threshold {
                return RoutingResult {
                    skill: Some(top.name.clone()),
                    confidence: top.score,
                    model_tier: ModelTier::Balanced,
                    llm_classifier_used: false,
                    cached: false,
                    reason: "semantic match".into(),
                };
            }
        }

        if candidates.is_empty() {
            // No semantic candidates: the classifier still runs over the full
            // catalog, purely to derive a model tier for the turn.
            if self.config.classifier_enabled {
                let all: Vec<ScoredSkill> = skills
                    .iter()
                    .filter(|s| s.available)
                    .map(|s| ScoredSkill {
                        name: s.name.clone(),
                        description: s.description.clone(),
                        score: 0.0,
                    })
                    .collect();
                if let Some(verdict) = self.classify(query, recent, &all).await {
                    return RoutingResult {
                        skill: None,
                        confidence: 0.0,
                        model_tier: ModelTier::parse_lenient(&verdict.model_tier),
                        llm_classifier_used: true,
                        cached: false,
                        reason: "no semantic candidates; tier from classifier".into(),
                    };
                }
            }
            return RoutingResult::no_match("no candidates", ModelTier::Balanced);
        }

        if !self.config.classifier_enabled {
            let top = &candidates[0];
            return RoutingResult {
                skill: Some(top.name.clone()),
                confidence: top.score,
                model_tier: ModelTier::Balanced,
                llm_classifier_used: false,
                cached: false,
                reason: "classifier disabled".into(),
            };
        }

        // Stage 2: LLM classifier over the candidate set.
        if let Some(verdict) = self.classify(query, recent, &candidates).await {
            if candidates.iter().any(|c| c.name == verdict.skill) {
                return RoutingResult {
                    skill: Some(verdict.skill),
                    confidence: verdict.confidence,
                    model_tier: ModelTier::parse_lenient(&verdict.model_tier),
                    llm_classifier_used: true,
                    cached: false,
                    reason: if verdict.reason.is_empty() {
                        "classifier".into()
                    } else {
                        verdict.reason
                    },
                };
            }
            warn!(skill = %verdict.skill, "router: classifier named an unknown skill");
        }

        // Classifier failed or hallucinated — trust the embedding space.
        let top = &candidates[0];
        RoutingResult {
            skill: Some(top.name.clone()),
            confidence: top.score,
            model_tier: ModelTier::Balanced,
            llm_classifier_used: false,
            cached: false,
            reason: "semantic fallback".into(),
        }
    }

    /// Run the classifier model and parse its strict JSON reply.
    async fn classify(
        &self,
        query: &str,
        recent: &[Message],
        candidates: &[ScoredSkill],
    ) -> Option<ClassifierVerdict> {
        let request = ChatRequest {
            model: self.classifier_model.clone(),
            system: CLASSIFIER_SYSTEM.to_string(),
            messages: vec![Message::user(
                classifier_input(query, recent, candidates),
                chrono::Utc::now().to_rfc3339(),
            )],
            max_tokens: 256,
            tools: Vec::new(),
        };

        let response = match self.classifier.chat(&request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e, "router: classifier call failed");
                return None;
            }
        };

        parse_verdict(&response.content)
    }

    fn cache_get(&self, fingerprint: u64) -> Option<RoutingResult> {
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        let entry = self.cache.get(&fingerprint)?;
        if entry.created_at.elapsed() > ttl {
            drop(entry);
            self.cache.remove(&fingerprint);
            return None;
        }
        let mut result = entry.result.clone();
        result.cached = true;
        Some(result)
    }

    fn cache_put(&self, fingerprint: u64, result: &RoutingResult) {
        if self.cache.len() >= self.config.cache_max_entries {
            self.evict_oldest();
        }
        self.cache.insert(
            fingerprint,
            CachedRouting {
                result: result.clone(),
                created_at: Instant::now(),
            },
        );
    }

    /// Drop roughly the oldest 10% of entries (at least one).
    fn evict_oldest(&self) {
        let mut entries: Vec<(u64, Instant)> = self
            .cache
            .iter()
            .map(|e| (*e.key(), e.value().created_at))
            .collect();
        entries.sort_by_key(|(_, created)| *created);
        let drop_count = (entries.len() / 10).max(1);
        for (key, _) in entries.into_iter().take(drop_count) {
            self.cache.remove(&key);
        }
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

const CLASSIFIER_SYSTEM: &str = "You route user messages to skills. \
Reply with ONLY a JSON object, no prose: \
{\"skill\":\"<name from the candidate list>\",\"confidence\":0.0-1.0,\
\"model_tier\":\"fast|balanced|smart|coding|deep\",\"reason\":\"short\"}";

/// Render the classifier input: candidates, recent context, query.
fn classifier_input(query: &str, recent: &[Message], candidates: &[ScoredSkill]) -> String {
    let mut out = String::from("Candidates:\n");
    for c in candidates {
        out.push_str(&format!("- {} (score {:.2}): {}\n", c.name, c.score, c.description));
    }
    let tail: Vec<&Message> = recent
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant))
        .rev()
        .take(3)
        .collect();
    if !tail.is_empty() {
        out.push_str("\nRecent messages:\n");
        for m in tail.into_iter().rev() {
            out.push_str(&format!("{}: {}\n", m.role.as_str(), m.text()));
        }
    }
    out.push_str(&format!("\nUser query: {query}\n"));
    out
}

/// Extract and parse the verdict JSON, tolerating surrounding prose.
fn parse_verdict(content: &str) -> Option<ClassifierVerdict> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str(&content[start..=end]) {
        Ok(verdict) => Some(verdict),
        Err(e) => {
            warn!(err = %e, "router: classifier reply was not valid JSON");
            None
        }
    }
}

/// Cache key over the query text and the candidate name set.
fn fingerprint(query: &str, skills: &[Skill]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    query.hash(&mut hasher);
    let mut names: Vec<&str> = skills.iter().map(|s| s.name.as_str()).collect();
    names.sort_unstable();
    for name in names {
        name.hash(&mut hasher);
    }
    hasher.finish()
}
