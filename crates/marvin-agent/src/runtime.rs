//! Composition root.
//!
//! Wires ports (LLM, embedding, memory, channels, tools) and shared
//! components (stores, registries, caches, broker, event bus) into one
//! `AgentRuntime`. Everything is resolved here, before the first turn runs;
//! the pipeline only ever borrows.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::info;

use marvin_channels::ResponseRouter;
use marvin_core::{EventBus, MarvinConfig};
use marvin_sessions::{SessionLockMap, SessionStore};

use crate::confirm::ConfirmationBroker;
use crate::embedding::EmbeddingProvider;
use crate::pipeline::compact::{LlmSummarizer, Summarizer};
use crate::pipeline::history::HistoryWriter;
use crate::pipeline::prompt::MemoryPort;
use crate::plan::PlanRegistry;
use crate::provider::LlmProvider;
use crate::ratelimit::RateLimitGate;
use crate::skill_index::SkillEmbeddingStore;
use crate::skill_router::{HybridSkillRouter, ModelTier};
use crate::skills::Skill;
use crate::tools::ToolRegistry;

/// Ports the host must provide.
pub struct RuntimePorts {
    pub provider: Arc<dyn LlmProvider>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub memory: Arc<dyn MemoryPort>,
    pub store: Arc<SessionStore>,
    pub tools: ToolRegistry,
    pub channels: ResponseRouter,
    /// Custom summarizer; `None` uses the LLM provider on the fast tier.
    pub summarizer: Option<Arc<dyn Summarizer>>,
}

/// Central runtime shared by every turn.
pub struct AgentRuntime {
    pub config: MarvinConfig,
    pub provider: Arc<dyn LlmProvider>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub memory: Arc<dyn MemoryPort>,
    pub store: Arc<SessionStore>,
    pub locks: SessionLockMap,
    pub rate_limit: RateLimitGate,
    pub skill_store: Arc<SkillEmbeddingStore>,
    pub skill_router: HybridSkillRouter,
    pub plans: PlanRegistry,
    pub tools: ToolRegistry,
    pub broker: Arc<ConfirmationBroker>,
    pub channels: ResponseRouter,
    pub events: EventBus,
    pub history: HistoryWriter,
    pub summarizer: Arc<dyn Summarizer>,
    skills: RwLock<Vec<Skill>>,
    tier_override: RwLock<Option<ModelTier>>,
}

impl AgentRuntime {
    /// Build the runtime. Must be called from within a Tokio runtime (the
    /// confirmation sweeper is spawned here).
    pub fn new(config: MarvinConfig, ports: RuntimePorts) -> Self {
        let skill_store = Arc::new(SkillEmbeddingStore::new(Arc::clone(&ports.embedder)));
        let skill_router = HybridSkillRouter::new(
            config.router.clone(),
            Arc::clone(&skill_store),
            Arc::clone(&ports.embedder),
            Arc::clone(&ports.provider),
            config.agent.models.fast.clone(),
        );
        let summarizer = ports.summarizer.unwrap_or_else(|| {
            Arc::new(LlmSummarizer::new(
                Arc::clone(&ports.provider),
                config.agent.models.fast.clone(),
            ))
        });

        Self {
            rate_limit: RateLimitGate::new(config.rate_limit.clone()),
            plans: PlanRegistry::new(Arc::clone(&ports.store)),
            broker: Arc::new(ConfirmationBroker::new(Duration::from_secs(
                config.confirmation.timeout_secs,
            ))),
            history: HistoryWriter::new(Arc::clone(&ports.store)),
            locks: SessionLockMap::new(),
            events: EventBus::default(),
            skill_store,
            skill_router,
            summarizer,
            provider: ports.provider,
            embedder: ports.embedder,
            memory: ports.memory,
            store: ports.store,
            tools: ports.tools,
            channels: ports.channels,
            skills: RwLock::new(Vec::new()),
            tier_override: RwLock::new(None),
            config,
        }
    }

    /// Load the skill catalog and (re)build its embedding index.
    pub async fn register_skills(&self, skills: Vec<Skill>) {
        if let Err(e) = self.skill_store.index_skills(&skills).await {
            tracing::warn!(err = %e, "skill indexing failed; routing will fall back");
        }
        let count = skills.len();
        *self.skills.write().unwrap() = skills;
        info!(skills = count, "skill catalog registered");
    }

    /// Snapshot of the current skill catalog.
    pub fn skills(&self) -> Vec<Skill> {
        self.skills.read().unwrap().clone()
    }

    pub fn tier_override(&self) -> &RwLock<Option<ModelTier>> {
        &self.tier_override
    }

    /// Concrete model id for a tier, honoring a user-pinned override.
    pub fn resolve_model(&self, routed: ModelTier) -> String {
        let tier = self.tier_override.read().unwrap().unwrap_or(routed);
        let models = &self.config.agent.models;
        match tier {
            ModelTier::Fast => models.fast.clone(),
            ModelTier::Balanced => models.balanced.clone(),
            ModelTier::Smart => models.smart.clone(),
            ModelTier::Coding => models.coding.clone(),
            ModelTier::Deep => models.deep.clone(),
        }
    }
}
