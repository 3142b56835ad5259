#![allow(dead_code)]

use anyhow::Result;
use memento::config::RetentionConfig;
use memento::db;
use memento::embedding::{EmbeddingProvider, EMBEDDING_DIM};
use memento::store::{NewObservation, ObservationType, RetentionStore, Scope};
use memento::vector::SqliteVectorIndex;
use std::sync::Arc;

/// Fresh in-memory retention store.
pub fn test_store(config: RetentionConfig) -> RetentionStore {
    RetentionStore::new(db::open_memory_database().unwrap(), config)
}

/// Retention config with small quotas so eviction is cheap to trigger.
pub fn small_quotas(per_project: usize, global: usize, prompts: usize) -> RetentionConfig {
    RetentionConfig {
        max_observations_per_project: per_project,
        max_global_observations: global,
        max_prompts: prompts,
        ..RetentionConfig::default()
    }
}

/// Deterministic embedder: words hash into buckets, so texts sharing words are close.
pub struct FakeEmbedder {
    version: String,
}

impl FakeEmbedder {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
        }
    }
}

impl EmbeddingProvider for FakeEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[0] = 0.01;
        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let bucket = word
                .bytes()
                .fold(17usize, |h, b| h.wrapping_mul(131).wrapping_add(b as usize));
            v[1 + bucket % (EMBEDDING_DIM - 1)] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        Ok(v.into_iter().map(|x| x / norm).collect())
    }

    fn version(&self) -> &str {
        &self.version
    }
}

/// Fresh in-memory vector index using [`FakeEmbedder`].
pub fn test_index(version: &str) -> Arc<SqliteVectorIndex> {
    Arc::new(SqliteVectorIndex::new(
        db::open_memory_vector_database().unwrap(),
        Arc::new(FakeEmbedder::new(version)),
    ))
}

pub fn observation(title: &str, narrative: &str) -> NewObservation {
    NewObservation {
        title: Some(title.into()),
        narrative: Some(narrative.into()),
        scope: Some(Scope::Project),
        ..NewObservation::new(ObservationType::Discovery)
    }
}

pub fn global_observation(title: &str, narrative: &str) -> NewObservation {
    NewObservation {
        scope: Some(Scope::Global),
        ..observation(title, narrative)
    }
}
