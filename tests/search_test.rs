mod helpers;

use anyhow::{anyhow, Result};
use helpers::{global_observation, observation, test_index, test_store};
use memento::config::{RetentionConfig, SearchConfig};
use memento::engine::MemoryEngine;
use memento::search::{Format, SearchManager, SearchParams, SearchStrategy, SearchType};
use memento::vector::{RebuildStatus, StaleVector, VectorDocument, VectorFilter, VectorMatch, VectorStore};
use std::sync::Arc;

/// Index that is reachable or not, but never answers a query.
struct UnavailableIndex {
    connected: bool,
}

impl VectorStore for UnavailableIndex {
    fn add_documents(&self, _: &[VectorDocument]) -> Result<usize> {
        Err(anyhow!("index offline"))
    }
    fn delete_documents(&self, _: &[String]) -> Result<usize> {
        Err(anyhow!("index offline"))
    }
    fn delete_by_source_ids(&self, _: &str, _: &[i64]) -> Result<usize> {
        Err(anyhow!("index offline"))
    }
    fn query(&self, _: &str, _: usize, _: &VectorFilter) -> Result<Vec<VectorMatch>> {
        Err(anyhow!("index offline"))
    }
    fn count(&self) -> Result<usize> {
        Err(anyhow!("index offline"))
    }
    fn model_version(&self) -> &str {
        "offline"
    }
    fn needs_rebuild(&self) -> Result<RebuildStatus> {
        Err(anyhow!("index offline"))
    }
    fn stale_vectors(&self) -> Result<Vec<StaleVector>> {
        Err(anyhow!("index offline"))
    }
    fn reembed_stale(&self) -> Result<usize> {
        Err(anyhow!("index offline"))
    }
    fn is_connected(&self) -> bool {
        self.connected
    }
}

async fn engine_with(index: Option<Arc<dyn VectorStore>>) -> MemoryEngine {
    let engine = MemoryEngine::new(test_store(RetentionConfig::default()), index, SearchConfig::default());
    engine
        .record_observation("sess-1", "alpha", observation("Connection pool", "pool size raised to sixteen connections"), None, 0)
        .await
        .unwrap();
    engine
        .record_observation("sess-1", "alpha", observation("Log rotation", "logs rotate daily and keep a week"), None, 0)
        .await
        .unwrap();
    engine
}

#[tokio::test]
async fn failing_index_falls_back_to_structured() {
    let engine = engine_with(Some(Arc::new(UnavailableIndex { connected: true }))).await;
    let response = engine
        .search()
        .search(SearchParams::query("pool connections"))
        .await
        .unwrap();
    assert_eq!(response.strategy, SearchStrategy::Structured);
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].title, "Connection pool");
}

#[tokio::test]
async fn disconnected_index_is_skipped() {
    let engine = engine_with(Some(Arc::new(UnavailableIndex { connected: false }))).await;
    let response = engine
        .search()
        .search(SearchParams::query("rotate logs"))
        .await
        .unwrap();
    assert_eq!(response.strategy, SearchStrategy::Structured);
    assert_eq!(response.results[0].title, "Log rotation");
}

#[tokio::test]
async fn missing_index_uses_structured() {
    let engine = engine_with(None).await;
    let response = engine.search().search(SearchParams::query("pool")).await.unwrap();
    assert_eq!(response.strategy, SearchStrategy::Structured);
}

#[tokio::test]
async fn empty_query_never_touches_the_index() {
    let engine = engine_with(Some(test_index("v1"))).await;
    let response = engine
        .search()
        .search(SearchParams {
            query: Some("   ".into()),
            ..SearchParams::default()
        })
        .await
        .unwrap();
    assert_eq!(response.strategy, SearchStrategy::Structured);
    assert_eq!(response.results.len(), 2);
}

#[tokio::test]
async fn vector_search_finds_semantic_match() {
    let engine = engine_with(Some(test_index("v1"))).await;
    let response = engine
        .search()
        .search(SearchParams {
            format: Format::Full,
            ..SearchParams::query("how many connections in the pool")
        })
        .await
        .unwrap();
    assert_eq!(response.strategy, SearchStrategy::Vector);
    assert_eq!(response.results[0].title, "Connection pool");
    assert!(response.results[0]
        .content
        .as_deref()
        .unwrap()
        .contains("sixteen"));
}

#[tokio::test]
async fn global_observations_cross_projects_unless_excluded() {
    let engine = MemoryEngine::new(test_store(RetentionConfig::default()), Some(test_index("v1")), SearchConfig::default());
    engine
        .record_observation("sess-1", "alpha", global_observation("Never log secrets", "redact tokens before logging"), None, 0)
        .await
        .unwrap();
    engine
        .record_observation("sess-2", "beta", observation("Beta logging", "beta logging uses json lines"), None, 0)
        .await
        .unwrap();

    let with_global = engine
        .search()
        .search(SearchParams {
            project: Some("beta".into()),
            search_type: SearchType::Observations,
            ..SearchParams::query("logging tokens")
        })
        .await
        .unwrap();
    let titles: Vec<&str> = with_global.results.iter().map(|r| r.title.as_str()).collect();
    assert!(titles.contains(&"Never log secrets"));
    assert!(titles.contains(&"Beta logging"));

    let project_only = engine
        .search()
        .search(SearchParams {
            project: Some("beta".into()),
            search_type: SearchType::Observations,
            include_global: false,
            ..SearchParams::query("logging tokens")
        })
        .await
        .unwrap();
    let titles: Vec<&str> = project_only.results.iter().map(|r| r.title.as_str()).collect();
    assert_eq!(titles, vec!["Beta logging"]);
}

#[tokio::test]
async fn structured_search_respects_visibility() {
    let store = test_store(RetentionConfig::default());
    store
        .store_observation("sess-1", "alpha", global_observation("Shared rule", "applies everywhere"), None, 0)
        .await
        .unwrap();
    store
        .store_observation("sess-1", "alpha", observation("Alpha only", "private to alpha"), None, 0)
        .await
        .unwrap();
    let manager = SearchManager::new(store, None, SearchConfig::default());

    let beta = manager
        .search(SearchParams {
            project: Some("beta".into()),
            search_type: SearchType::Observations,
            ..SearchParams::default()
        })
        .await
        .unwrap();
    let titles: Vec<&str> = beta.results.iter().map(|r| r.title.as_str()).collect();
    assert_eq!(titles, vec!["Shared rule"]);
}

#[tokio::test]
async fn limit_caps_results() {
    let store = test_store(RetentionConfig::default());
    for i in 0..30 {
        store
            .store_observation("sess-1", "alpha", observation(&format!("cache note {i}"), "cache"), None, 0)
            .await
            .unwrap();
    }
    let manager = SearchManager::new(store, None, SearchConfig::default());
    let default_limit = manager.search(SearchParams::query("cache")).await.unwrap();
    assert_eq!(default_limit.results.len(), 20);

    let small = manager
        .search(SearchParams {
            limit: Some(5),
            ..SearchParams::query("cache")
        })
        .await
        .unwrap();
    assert_eq!(small.total, 5);
}
