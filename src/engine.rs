//! Wires the retention store to the vector index.
//!
//! [`MemoryEngine`] is what the server and CLI hold. Writes go to the store first
//! and are then indexed as granular vector documents; evictions flow back to the
//! index through the store's cleanup callback.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;

use crate::config::MementoConfig;
use crate::db;
use crate::embedding;
use crate::search::SearchManager;
use crate::store::{
    CleanupCallback, NewObservation, NewSummary, OrderBy, RetentionStore, StoredRecord,
};
use crate::vector::documents::{observation_documents, prompt_documents, summary_documents};
use crate::vector::{RebuildStatus, SqliteVectorIndex, VectorDocument, VectorStore};

#[derive(Clone)]
pub struct MemoryEngine {
    store: RetentionStore,
    vectors: Option<Arc<dyn VectorStore>>,
    search: SearchManager,
}

impl MemoryEngine {
    /// Open the record store and, unless embeddings are disabled, the vector index.
    pub fn open(config: &MementoConfig) -> Result<Self> {
        let db_path = config.resolved_db_path();
        let conn = db::open_database(&db_path)?;
        let store = RetentionStore::new(conn, config.retention.clone());

        let vectors: Option<Arc<dyn VectorStore>> = match embedding::create_provider(&config.embedding)? {
            Some(provider) => {
                let path = config.resolved_vector_db_path();
                let conn = db::open_vector_database(&path)
                    .with_context(|| format!("failed to open vector index at {}", path.display()))?;
                let index = SqliteVectorIndex::new(conn, Arc::from(provider));
                Some(Arc::new(index))
            }
            None => {
                tracing::info!("embeddings disabled, search will use the structured path only");
                None
            }
        };

        let engine = Self::new(store, vectors, config.search.clone());
        engine.warn_if_stale();
        Ok(engine)
    }

    /// Assemble an engine from parts and register the eviction cleanup callback.
    pub fn new(
        store: RetentionStore,
        vectors: Option<Arc<dyn VectorStore>>,
        search_config: crate::config::SearchConfig,
    ) -> Self {
        if let Some(index) = &vectors {
            store.set_cleanup_callback(vector_cleanup(Arc::clone(index)));
        }
        let search = SearchManager::new(store.clone(), vectors.clone(), search_config);
        Self {
            store,
            vectors,
            search,
        }
    }

    pub fn store(&self) -> &RetentionStore {
        &self.store
    }

    pub fn search(&self) -> &SearchManager {
        &self.search
    }

    pub fn vectors(&self) -> Option<&Arc<dyn VectorStore>> {
        self.vectors.as_ref()
    }

    pub async fn record_observation(
        &self,
        session_key: &str,
        project: &str,
        obs: NewObservation,
        prompt_number: Option<i64>,
        discovery_tokens: i64,
    ) -> Result<StoredRecord> {
        let stored = self
            .store
            .store_observation(session_key, project, obs, prompt_number, discovery_tokens)
            .await?;
        self.index_observation(stored.id).await;
        Ok(stored)
    }

    /// Store unless a near-duplicate of a recent observation exists. `None` when skipped.
    pub async fn record_observation_deduplicated(
        &self,
        session_key: &str,
        project: &str,
        obs: NewObservation,
        prompt_number: Option<i64>,
        discovery_tokens: i64,
    ) -> Result<Option<StoredRecord>> {
        let stored = self
            .store
            .store_observation_deduplicated(session_key, project, obs, prompt_number, discovery_tokens)
            .await?;
        if let Some(record) = &stored {
            self.index_observation(record.id).await;
        }
        Ok(stored)
    }

    pub async fn record_summary(
        &self,
        session_key: &str,
        project: &str,
        summary: NewSummary,
        prompt_number: Option<i64>,
        discovery_tokens: i64,
    ) -> Result<StoredRecord> {
        let stored = self
            .store
            .store_summary(session_key, project, summary, prompt_number, discovery_tokens)
            .await?;
        if self.vectors.is_some() {
            match self.store.get_summaries(vec![stored.id], OrderBy::Default, None).await {
                Ok(rows) => {
                    let docs = rows.iter().flat_map(summary_documents).collect();
                    self.index(docs).await;
                }
                Err(e) => tracing::warn!(error = %e, id = stored.id, "failed to load summary for indexing"),
            }
        }
        Ok(stored)
    }

    pub async fn record_prompt(
        &self,
        session_key: &str,
        project: &str,
        prompt_number: i64,
        prompt_text: &str,
        token_count: i64,
    ) -> Result<StoredRecord> {
        let stored = self
            .store
            .store_prompt(session_key, project, prompt_number, prompt_text, token_count)
            .await?;
        if self.vectors.is_some() {
            match self.store.get_prompts(vec![stored.id], OrderBy::Default, None).await {
                Ok(rows) => {
                    let docs = rows.iter().flat_map(prompt_documents).collect();
                    self.index(docs).await;
                }
                Err(e) => tracing::warn!(error = %e, id = stored.id, "failed to load prompt for indexing"),
            }
        }
        Ok(stored)
    }

    /// Re-embed vectors written by a different model version. Returns 0 without an index.
    pub async fn reembed_stale(&self) -> Result<usize> {
        let Some(index) = self.vectors.clone() else {
            return Ok(0);
        };
        let updated = tokio::task::spawn_blocking(move || index.reembed_stale())
            .await
            .map_err(|e| anyhow!("re-embed task failed: {e}"))??;
        tracing::info!(updated, "re-embedded stale vectors");
        Ok(updated)
    }

    /// `None` when embeddings are disabled.
    pub async fn index_status(&self) -> Result<Option<RebuildStatus>> {
        let Some(index) = self.vectors.clone() else {
            return Ok(None);
        };
        let status = tokio::task::spawn_blocking(move || index.needs_rebuild())
            .await
            .map_err(|e| anyhow!("index status task failed: {e}"))??;
        Ok(Some(status))
    }

    /// Block until scheduled evictions (and their cleanup callbacks) finish.
    pub async fn shutdown(&self) {
        self.store.wait_for_evictions().await;
    }

    fn warn_if_stale(&self) {
        let Some(index) = &self.vectors else {
            return;
        };
        match index.needs_rebuild() {
            Ok(status) if status.needed && status.reason.starts_with("model_mismatch") => {
                tracing::warn!(
                    reason = %status.reason,
                    model = %index.model_version(),
                    "vector index has stale embeddings, run `memento reembed`"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to check vector index staleness"),
        }
    }

    async fn index_observation(&self, id: i64) {
        if self.vectors.is_none() {
            return;
        }
        match self.store.get_observations(vec![id], OrderBy::Default, None).await {
            Ok(rows) => {
                let docs = rows.iter().flat_map(observation_documents).collect();
                self.index(docs).await;
            }
            Err(e) => tracing::warn!(error = %e, id, "failed to load observation for indexing"),
        }
    }

    /// Best-effort: the record is already committed, so failures are only logged.
    async fn index(&self, docs: Vec<VectorDocument>) {
        let Some(index) = self.vectors.clone() else {
            return;
        };
        if docs.is_empty() {
            return;
        }
        let result = tokio::task::spawn_blocking(move || index.add_documents(&docs)).await;
        match result {
            Ok(Ok(n)) => tracing::debug!(documents = n, "indexed documents"),
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to index documents"),
            Err(e) => tracing::warn!(error = %e, "index task failed"),
        }
    }
}

/// Deletes the vector documents of every evicted record.
fn vector_cleanup(index: Arc<dyn VectorStore>) -> CleanupCallback {
    Arc::new(move |event| {
        let removed = index.delete_by_source_ids(event.kind.doc_type(), &event.ids)?;
        tracing::debug!(kind = ?event.kind, records = event.ids.len(), removed, "removed evicted vectors");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetentionConfig, SearchConfig};
    use crate::search::{SearchParams, SearchStrategy};
    use crate::store::ObservationType;
    use crate::vector::testing::HashEmbedder;
    use crate::vector::VectorFilter;

    fn engine(retention: RetentionConfig) -> (MemoryEngine, Arc<SqliteVectorIndex>) {
        let store = RetentionStore::new(db::open_memory_database().unwrap(), retention);
        let index = Arc::new(SqliteVectorIndex::new(
            db::open_memory_vector_database().unwrap(),
            Arc::new(HashEmbedder::new("test-model")),
        ));
        let engine = MemoryEngine::new(store, Some(index.clone()), SearchConfig::default());
        (engine, index)
    }

    fn obs(narrative: &str, facts: &[&str]) -> NewObservation {
        NewObservation {
            narrative: Some(narrative.into()),
            facts: facts.iter().map(|f| f.to_string()).collect(),
            ..NewObservation::new(ObservationType::Discovery)
        }
    }

    #[tokio::test]
    async fn observation_indexed_per_field() {
        let (engine, index) = engine(RetentionConfig::default());
        engine
            .record_observation("sess-1", "alpha", obs("parser handles utf8", &["bom stripped", "crlf kept"]), None, 0)
            .await
            .unwrap();
        assert_eq!(index.count().unwrap(), 3);

        let response = engine
            .search()
            .search(SearchParams::query("parser utf8"))
            .await
            .unwrap();
        assert_eq!(response.strategy, SearchStrategy::Vector);
        assert_eq!(response.results.len(), 1);
    }

    #[tokio::test]
    async fn eviction_removes_vectors() {
        let retention = RetentionConfig {
            max_observations_per_project: 2,
            ..RetentionConfig::default()
        };
        let (engine, index) = engine(retention);
        let mut ids = Vec::new();
        for i in 0..4 {
            let stored = engine
                .record_observation("sess-1", "alpha", obs(&format!("note number {i}"), &[]), None, 0)
                .await
                .unwrap();
            ids.push(stored.id);
            engine.shutdown().await;
        }

        assert_eq!(engine.store().count_observations("alpha").await.unwrap(), 2);
        assert_eq!(index.count().unwrap(), 2);
        let remaining = index
            .query("note number", 10, &VectorFilter::default())
            .unwrap()
            .into_iter()
            .map(|m| m.metadata.source_id)
            .collect::<std::collections::HashSet<_>>();
        assert!(remaining.contains(&ids[3]));
        assert!(!remaining.contains(&ids[0]));
    }

    #[tokio::test]
    async fn summaries_and_prompts_indexed() {
        let (engine, index) = engine(RetentionConfig::default());
        engine
            .record_summary(
                "sess-1",
                "alpha",
                NewSummary {
                    request: Some("speed up startup".into()),
                    learned: Some("lazy model load".into()),
                    ..Default::default()
                },
                None,
                0,
            )
            .await
            .unwrap();
        engine.record_prompt("sess-1", "alpha", 1, "why is startup slow", 0).await.unwrap();
        engine.shutdown().await;
        assert_eq!(index.count().unwrap(), 3);
    }

    #[tokio::test]
    async fn engine_without_index_uses_structured_search() {
        let store = RetentionStore::new(db::open_memory_database().unwrap(), RetentionConfig::default());
        let engine = MemoryEngine::new(store, None, SearchConfig::default());
        engine
            .record_observation("sess-1", "alpha", obs("cache invalidation on deploy", &[]), None, 0)
            .await
            .unwrap();
        assert!(engine.index_status().await.unwrap().is_none());
        assert_eq!(engine.reembed_stale().await.unwrap(), 0);

        let response = engine
            .search()
            .search(SearchParams::query("cache invalidation"))
            .await
            .unwrap();
        assert_eq!(response.strategy, SearchStrategy::Structured);
        assert_eq!(response.results.len(), 1);
    }

    #[tokio::test]
    async fn reembed_after_model_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.db");
        let old = SqliteVectorIndex::new(
            db::open_vector_database(&path).unwrap(),
            Arc::new(HashEmbedder::new("model-v1")),
        );
        old.add_documents(&observation_documents_for_test()).unwrap();
        drop(old);

        let store = RetentionStore::new(db::open_memory_database().unwrap(), RetentionConfig::default());
        let index = Arc::new(SqliteVectorIndex::new(
            db::open_vector_database(&path).unwrap(),
            Arc::new(HashEmbedder::new("model-v2")),
        ));
        let engine = MemoryEngine::new(store, Some(index), SearchConfig::default());
        let status = engine.index_status().await.unwrap().unwrap();
        assert_eq!(status.reason, "model_mismatch:1");
        assert_eq!(engine.reembed_stale().await.unwrap(), 1);
        assert!(!engine.index_status().await.unwrap().unwrap().needed);
    }

    fn observation_documents_for_test() -> Vec<VectorDocument> {
        vec![VectorDocument {
            doc_id: "obs_1_narrative".into(),
            content: "retry uploads".into(),
            metadata: crate::vector::DocumentMetadata {
                source_id: 1,
                doc_type: "observation".into(),
                field_type: "narrative".into(),
                project: "alpha".into(),
                scope: Some("project".into()),
            },
        }]
    }
}
