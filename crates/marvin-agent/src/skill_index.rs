//! In-memory cosine-similarity index over skill descriptions.
//!
//! The index is rebuilt wholesale (e.g. after a skill reload) and swapped in
//! under a write lock, so concurrent readers always see either the previous
//! or the new index, never a torn mix.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::embedding::{cosine_similarity, normalize, EmbeddingError, EmbeddingProvider};
use crate::skills::Skill;

/// One candidate returned by a similarity query.
#[derive(Debug, Clone)]
pub struct ScoredSkill {
    pub name: String,
    pub description: String,
    pub score: f32,
}

struct IndexedSkill {
    /// Unit-length embedding of the skill description.
    embedding: Vec<f32>,
    description: String,
}

/// Skill-name → embedding map with swap-on-rebuild semantics.
pub struct SkillEmbeddingStore {
    embedder: Arc<dyn EmbeddingProvider>,
    index: RwLock<HashMap<String, IndexedSkill>>,
}

impl SkillEmbeddingStore {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            embedder,
            index: RwLock::new(HashMap::new()),
        }
    }

    /// Number of indexed skills.
    pub fn len(&self) -> usize {
        self.index.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (Re)index the given skills. Unavailable skills are skipped.
    ///
    /// Tries one batch call first; if the batch fails, falls back to
    /// per-item embedding so one bad entry cannot sink the whole catalog.
    pub async fn index_skills(&self, skills: &[Skill]) -> Result<(), EmbeddingError> {
        let candidates: Vec<&Skill> = skills.iter().filter(|s| s.available).collect();
        let texts: Vec<String> = candidates.iter().map(|s| s.embedding_text()).collect();

        let vectors = match self.embedder.embed_batch(&texts).await {
            Ok(vectors) if vectors.len() == candidates.len() => vectors,
            Ok(vectors) => {
                warn!(
                    expected = candidates.len(),
                    got = vectors.len(),
                    "skill index: batch embedding count mismatch, retrying per item"
                );
                self.embed_one_by_one(&texts).await?
            }
            Err(e) => {
                warn!(err = %e, "skill index: batch embedding failed, retrying per item");
                self.embed_one_by_one(&texts).await?
            }
        };

        let mut fresh = HashMap::with_capacity(candidates.len());
        for (skill, mut vector) in candidates.into_iter().zip(vectors) {
            normalize(&mut vector);
            fresh.insert(
                skill.name.clone(),
                IndexedSkill {
                    embedding: vector,
                    description: skill.description.clone(),
                },
            );
        }

        let count = fresh.len();
        *self.index.write().unwrap() = fresh;
        debug!(skills = count, "skill index rebuilt");
        Ok(())
    }

    async fn embed_one_by_one(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embedder.embed(text).await?);
        }
        Ok(out)
    }

    /// Top-K candidates by cosine similarity, `score >= min_score`, sorted
    /// descending.
    pub fn find_similar(&self, query: &[f32], top_k: usize, min_score: f32) -> Vec<ScoredSkill> {
        let index = self.index.read().unwrap();
        let mut scored: Vec<ScoredSkill> = index
            .iter()
            .map(|(name, entry)| ScoredSkill {
                name: name.clone(),
                description: entry.description.clone(),
                score: cosine_similarity(query, &entry.embedding),
            })
            .filter(|s| s.score >= min_score)
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Deterministic embedder: maps known words onto fixed unit axes.
    struct StubEmbedder {
        fail_batch: AtomicBool,
    }

    impl StubEmbedder {
        fn vector_for(text: &str) -> Vec<f32> {
            let lower = text.to_lowercase();
            if lower.contains("weather") {
                vec![1.0, 0.0, 0.0]
            } else if lower.contains("code") {
                vec![0.0, 1.0, 0.0]
            } else {
                vec![0.0, 0.0, 1.0]
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(Self::vector_for(text))
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if self.fail_batch.load(Ordering::SeqCst) {
                return Err(EmbeddingError::Request("batch endpoint down".into()));
            }
            Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
        }
    }

    fn skill(name: &str, description: &str) -> Skill {
        Skill {
            name: name.into(),
            description: description.into(),
            prompt_template: String::new(),
            available: true,
            capabilities: Vec::new(),
        }
    }

    fn store(fail_batch: bool) -> SkillEmbeddingStore {
        SkillEmbeddingStore::new(Arc::new(StubEmbedder {
            fail_batch: AtomicBool::new(fail_batch),
        }))
    }

    #[tokio::test]
    async fn finds_nearest_skill_first() {
        let store = store(false);
        store
            .index_skills(&[
                skill("weather", "weather forecasts"),
                skill("coding", "code review and fixes"),
            ])
            .await
            .unwrap();

        let results = store.find_similar(&[0.9, 0.1, 0.0], 5, 0.0);
        assert_eq!(results[0].name, "weather");
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn min_score_filters_candidates() {
        let store = store(false);
        store
            .index_skills(&[skill("weather", "weather forecasts")])
            .await
            .unwrap();
        let results = store.find_similar(&[0.0, 1.0, 0.0], 5, 0.5);
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn top_k_truncates() {
        let store = store(false);
        store
            .index_skills(&[
                skill("a", "weather one"),
                skill("b", "weather two"),
                skill("c", "weather three"),
            ])
            .await
            .unwrap();
        let results = store.find_similar(&[1.0, 0.0, 0.0], 2, 0.0);
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn batch_failure_falls_back_to_per_item() {
        let store = store(true);
        store
            .index_skills(&[skill("weather", "weather forecasts")])
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn unavailable_skills_are_not_indexed() {
        let store = store(false);
        let mut disabled = skill("hidden", "secret skill");
        disabled.available = false;
        store
            .index_skills(&[disabled, skill("weather", "weather forecasts")])
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
    }
}
