//! Unified search across observations, session summaries and prompts.
//!
//! Each request takes one of two branches:
//!
//! - **vector**: the query is non-empty and a connected vector index is present.
//!   Vector hits and full-text hits are fused with RRF, hydrated from the store,
//!   and near-duplicate observations are collapsed before truncation.
//! - **structured**: no query, no index, or the vector query failed. Each
//!   requested record type is read straight from the store and concatenated:
//!   keyword matches when the query has any, the most recent records otherwise.
//!
//! An explicit `order_by` reorders the final list in either branch.
//!
//! Results share one shape, [`SearchResultItem`], whatever their record type.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::cluster;
use crate::config::SearchConfig;
use crate::error::Error;
use crate::rrf::{self, ScoredId};
use crate::store::{
    Observation, ObservationFilter, OrderBy, RecordKind, RetentionStore, Scope, SessionSummary,
    UserPrompt,
};
use crate::vector::{VectorFilter, VectorStore};

/// Titles longer than this are cut and end in `...`.
const MAX_TITLE_CHARS: usize = 100;

/// Importance of records that carry none (summaries, prompts).
const DEFAULT_IMPORTANCE: f64 = 1.0;

const DECISIONS_KEYWORDS: &str = "decision decided chose chosen tradeoff rationale alternative";
const CHANGES_KEYWORDS: &str = "changed modified updated refactored implemented added removed";
const HOW_IT_WORKS_KEYWORDS: &str = "architecture design mechanism works flow pattern";

/// Which record types a search covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    #[default]
    All,
    Observations,
    Sessions,
    Prompts,
}

impl SearchType {
    fn kinds(&self) -> Vec<RecordKind> {
        match self {
            Self::All => vec![RecordKind::Observation, RecordKind::Summary, RecordKind::Prompt],
            Self::Observations => vec![RecordKind::Observation],
            Self::Sessions => vec![RecordKind::Summary],
            Self::Prompts => vec![RecordKind::Prompt],
        }
    }

    fn doc_type(&self) -> Option<&'static str> {
        match self {
            Self::All => None,
            Self::Observations => Some(RecordKind::Observation.doc_type()),
            Self::Sessions => Some(RecordKind::Summary.doc_type()),
            Self::Prompts => Some(RecordKind::Prompt.doc_type()),
        }
    }
}

impl std::str::FromStr for SearchType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "all" => Ok(Self::All),
            "observations" => Ok(Self::Observations),
            "sessions" => Ok(Self::Sessions),
            "prompts" => Ok(Self::Prompts),
            _ => Err(Error::unknown("search type", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    /// Compact: no `content` or `metadata`.
    #[default]
    Index,
    Full,
}

impl std::str::FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "index" => Ok(Self::Index),
            "full" => Ok(Self::Full),
            _ => Err(Error::unknown("format", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub format: Format,
    pub search_type: SearchType,
    /// `None` searches every project.
    pub project: Option<String>,
    pub query: Option<String>,
    pub order_by: OrderBy,
    /// Defaults to the configured limit; clamped to `[1, max_limit]`.
    pub limit: Option<usize>,
    pub include_global: bool,
    pub exclude_superseded: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            format: Format::Index,
            search_type: SearchType::All,
            project: None,
            query: None,
            order_by: OrderBy::Default,
            limit: None,
            include_global: true,
            exclude_superseded: false,
        }
    }
}

impl SearchParams {
    pub fn query(text: impl Into<String>) -> Self {
        Self {
            query: Some(text.into()),
            ..Self::default()
        }
    }

    fn query_text(&self) -> Option<&str> {
        self.query.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }
}

/// One search hit, normalized across record types.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    /// `observation`, `session` or `prompt`.
    #[serde(rename = "type")]
    pub kind: String,
    pub id: i64,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub created_at_epoch: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip)]
    importance: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    Vector,
    Structured,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResultItem>,
    pub total: usize,
    pub strategy: SearchStrategy,
}

#[derive(Clone)]
pub struct SearchManager {
    store: RetentionStore,
    vectors: Option<Arc<dyn VectorStore>>,
    config: SearchConfig,
}

impl SearchManager {
    pub fn new(store: RetentionStore, vectors: Option<Arc<dyn VectorStore>>, config: SearchConfig) -> Self {
        Self {
            store,
            vectors,
            config,
        }
    }

    fn clamp_limit(&self, limit: Option<usize>) -> usize {
        limit
            .unwrap_or(self.config.default_limit)
            .clamp(1, self.config.max_limit.max(1))
    }

    pub async fn search(&self, params: SearchParams) -> Result<SearchResponse> {
        let limit = self.clamp_limit(params.limit);

        if let (Some(query), Some(vectors)) = (params.query_text(), &self.vectors) {
            if vector_ready(vectors).await {
                match self.vector_search(&params, query, vectors, limit).await {
                    Ok(results) => return Ok(respond(results, SearchStrategy::Vector)),
                    Err(e) => {
                        tracing::warn!(error = %e, "vector search failed, falling back to structured search")
                    }
                }
            } else {
                tracing::debug!("vector index not connected, using structured search");
            }
        }

        let results = self.structured_search(&params, limit).await?;
        Ok(respond(results, SearchStrategy::Structured))
    }

    /// Bias toward decision records.
    pub async fn decisions(&self, params: SearchParams) -> Result<SearchResponse> {
        self.search(with_preset(params, DECISIONS_KEYWORDS)).await
    }

    /// Bias toward records describing what changed.
    pub async fn changes(&self, params: SearchParams) -> Result<SearchResponse> {
        self.search(with_preset(params, CHANGES_KEYWORDS)).await
    }

    /// Bias toward records explaining how something works.
    pub async fn how_it_works(&self, params: SearchParams) -> Result<SearchResponse> {
        self.search(with_preset(params, HOW_IT_WORKS_KEYWORDS)).await
    }

    async fn vector_search(
        &self,
        params: &SearchParams,
        query: &str,
        vectors: &Arc<dyn VectorStore>,
        limit: usize,
    ) -> Result<Vec<SearchResultItem>> {
        let candidates = limit * self.config.candidate_multiplier.max(1);
        let filter = VectorFilter {
            doc_type: params.search_type.doc_type().map(str::to_string),
            project: params.project.clone(),
            include_global: params.include_global,
        };

        let index = Arc::clone(vectors);
        let text = query.to_string();
        let matches = tokio::task::spawn_blocking(move || index.query(&text, candidates, &filter))
            .await
            .map_err(|e| anyhow!("vector query task failed: {e}"))??;

        let mut seen = HashSet::new();
        let vector_ranked: Vec<ScoredId> = matches
            .into_iter()
            .filter(|m| seen.insert((m.metadata.doc_type.clone(), m.metadata.source_id)))
            .map(|m| ScoredId::new(m.metadata.doc_type, m.metadata.source_id, m.score))
            .collect();

        let full_text = self.full_text_ranking(params, query, candidates).await;
        let fused = rrf::fuse(&[vector_ranked, full_text]);

        let mut ids_by_kind: HashMap<RecordKind, Vec<i64>> = HashMap::new();
        for item in &fused {
            if let Some(kind) = RecordKind::from_doc_type(&item.doc_type) {
                ids_by_kind.entry(kind).or_default().push(item.id);
            }
        }

        let mut observations: HashMap<i64, Observation> = HashMap::new();
        let mut summaries: HashMap<i64, SessionSummary> = HashMap::new();
        let mut prompts: HashMap<i64, UserPrompt> = HashMap::new();
        for (kind, ids) in ids_by_kind {
            match kind {
                RecordKind::Observation => {
                    for o in self.store.get_observations(ids, params.order_by, None).await? {
                        if observation_visible(&o, params) {
                            observations.insert(o.id, o);
                        }
                    }
                }
                RecordKind::Summary => {
                    for s in self.store.get_summaries(ids, params.order_by, None).await? {
                        summaries.insert(s.id, s);
                    }
                }
                RecordKind::Prompt => {
                    for p in self.store.get_prompts(ids, params.order_by, None).await? {
                        prompts.insert(p.id, p);
                    }
                }
            }
        }

        // Collapse near-duplicate observations, keeping the best-ranked of each cluster.
        let ranked_observations: Vec<Observation> = fused
            .iter()
            .filter(|s| s.doc_type == RecordKind::Observation.doc_type())
            .filter_map(|s| observations.get(&s.id).cloned())
            .collect();
        let representatives: HashSet<i64> =
            cluster::cluster_indices(&ranked_observations, self.config.dedup_threshold)
                .into_iter()
                .map(|i| ranked_observations[i].id)
                .collect();

        let mut results = Vec::with_capacity(limit);
        for scored in &fused {
            let item = match RecordKind::from_doc_type(&scored.doc_type) {
                Some(RecordKind::Observation) if representatives.contains(&scored.id) => {
                    observations.get(&scored.id).map(|o| observation_item(o, params.format))
                }
                Some(RecordKind::Summary) => summaries.get(&scored.id).map(|s| summary_item(s, params.format)),
                Some(RecordKind::Prompt) => prompts.get(&scored.id).map(|p| prompt_item(p, params.format)),
                _ => None,
            };
            if let Some(mut item) = item {
                item.score = Some(scored.score);
                results.push(item);
            }
            if results.len() == limit {
                break;
            }
        }

        sort_results(&mut results, params.order_by);
        self.track_retrieval(&results).await;
        Ok(results)
    }

    /// Full-text hits of every requested type merged into one ranking by
    /// normalized score, best first. A type whose search fails is left out.
    async fn full_text_ranking(&self, params: &SearchParams, query: &str, limit: usize) -> Vec<ScoredId> {
        let project = params.project.as_deref();
        let mut merged = Vec::new();
        for kind in params.search_type.kinds() {
            let doc_type = kind.doc_type();
            let ranked: Result<Vec<ScoredId>> = match kind {
                RecordKind::Observation => self
                    .store
                    .search_observations(query, observation_filter(params), limit)
                    .await
                    .map(|hits| hits.into_iter().map(|(o, s)| ScoredId::new(doc_type, o.id, s)).collect()),
                RecordKind::Summary => self
                    .store
                    .search_summaries(query, project, limit)
                    .await
                    .map(|hits| hits.into_iter().map(|(r, s)| ScoredId::new(doc_type, r.id, s)).collect()),
                RecordKind::Prompt => self
                    .store
                    .search_prompts(query, project, limit)
                    .await
                    .map(|hits| hits.into_iter().map(|(p, s)| ScoredId::new(doc_type, p.id, s)).collect()),
            };
            match ranked {
                Ok(list) => merged.extend(list),
                Err(e) => tracing::warn!(error = %e, doc_type, "full-text ranking unavailable"),
            }
        }
        merged.sort_by(|a, b| b.score.total_cmp(&a.score));
        merged
    }

    /// Keyword matches when the query has any, otherwise the most recent
    /// records of each requested type.
    async fn structured_search(
        &self,
        params: &SearchParams,
        limit: usize,
    ) -> Result<Vec<SearchResultItem>> {
        let mut results = Vec::new();
        if let Some(query) = params.query_text() {
            results = self.keyword_matches(params, query, limit).await?;
            if results.is_empty() {
                tracing::debug!(query, "no keyword matches, listing recent records");
            }
        }
        if results.is_empty() {
            results = self.recent_records(params, limit).await?;
        }

        sort_results(&mut results, params.order_by);
        results.truncate(limit);
        self.track_retrieval(&results).await;
        Ok(results)
    }

    async fn keyword_matches(
        &self,
        params: &SearchParams,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchResultItem>> {
        let project = params.project.as_deref();
        let mut results = Vec::new();
        for kind in params.search_type.kinds() {
            match kind {
                RecordKind::Observation => {
                    let hits = self
                        .store
                        .search_observations(query, observation_filter(params), limit)
                        .await?;
                    results.extend(hits.iter().map(|(o, score)| SearchResultItem {
                        score: Some(*score),
                        ..observation_item(o, params.format)
                    }));
                }
                RecordKind::Summary => {
                    let hits = self.store.search_summaries(query, project, limit).await?;
                    results.extend(hits.iter().map(|(s, score)| SearchResultItem {
                        score: Some(*score),
                        ..summary_item(s, params.format)
                    }));
                }
                RecordKind::Prompt => {
                    let hits = self.store.search_prompts(query, project, limit).await?;
                    results.extend(hits.iter().map(|(p, score)| SearchResultItem {
                        score: Some(*score),
                        ..prompt_item(p, params.format)
                    }));
                }
            }
        }
        Ok(results)
    }

    async fn recent_records(&self, params: &SearchParams, limit: usize) -> Result<Vec<SearchResultItem>> {
        let project = params.project.as_deref();
        let mut results = Vec::new();
        for kind in params.search_type.kinds() {
            match kind {
                RecordKind::Observation => {
                    let rows = self
                        .store
                        .list_observations(observation_filter(params), params.order_by, limit)
                        .await?;
                    results.extend(rows.iter().map(|o| observation_item(o, params.format)));
                }
                RecordKind::Summary => {
                    let rows = self.store.list_summaries(project, params.order_by, limit).await?;
                    results.extend(rows.iter().map(|s| summary_item(s, params.format)));
                }
                RecordKind::Prompt => {
                    let rows = self.store.list_prompts(project, params.order_by, limit).await?;
                    results.extend(rows.iter().map(|p| prompt_item(p, params.format)));
                }
            }
        }
        Ok(results)
    }

    /// Best-effort retrieval bookkeeping for returned observations.
    async fn track_retrieval(&self, results: &[SearchResultItem]) {
        let ids: Vec<i64> = results
            .iter()
            .filter(|r| r.kind == "observation")
            .map(|r| r.id)
            .collect();
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.store.record_retrieval(ids).await {
            tracing::warn!(error = %e, "failed to record retrieval");
        }
    }
}

async fn vector_ready(vectors: &Arc<dyn VectorStore>) -> bool {
    let index = Arc::clone(vectors);
    tokio::task::spawn_blocking(move || index.is_connected())
        .await
        .unwrap_or(false)
}

fn respond(results: Vec<SearchResultItem>, strategy: SearchStrategy) -> SearchResponse {
    SearchResponse {
        total: results.len(),
        results,
        strategy,
    }
}

fn observation_filter(params: &SearchParams) -> ObservationFilter {
    ObservationFilter {
        project: params.project.clone(),
        include_global: params.include_global,
        active_only: params.exclude_superseded,
    }
}

/// Reorder for an explicit `order_by`. `Default` keeps rank order.
fn sort_results(results: &mut [SearchResultItem], order_by: OrderBy) {
    match order_by {
        OrderBy::Default => {}
        OrderBy::DateAsc => results.sort_by_key(|r| (r.created_at_epoch, r.id)),
        OrderBy::DateDesc => results.sort_by_key(|r| Reverse((r.created_at_epoch, r.id))),
        OrderBy::Importance => results.sort_by(|a, b| {
            b.importance
                .unwrap_or(DEFAULT_IMPORTANCE)
                .total_cmp(&a.importance.unwrap_or(DEFAULT_IMPORTANCE))
                .then_with(|| (b.created_at_epoch, b.id).cmp(&(a.created_at_epoch, a.id)))
        }),
    }
}

fn with_preset(mut params: SearchParams, keywords: &str) -> SearchParams {
    params.query = Some(match params.query_text() {
        Some(q) => format!("{q} {keywords}"),
        None => keywords.to_string(),
    });
    params.search_type = SearchType::Observations;
    params
}

fn observation_visible(obs: &Observation, params: &SearchParams) -> bool {
    if params.exclude_superseded && obs.superseded {
        return false;
    }
    params.include_global || obs.scope != Scope::Global
}

/// First `MAX_TITLE_CHARS` characters, ending in `...` when cut.
pub fn truncate_title(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= MAX_TITLE_CHARS {
        return text.to_string();
    }
    let kept: String = text.chars().take(MAX_TITLE_CHARS - 3).collect();
    format!("{}...", kept.trim_end())
}

fn first_non_blank<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> &'a str {
    candidates
        .into_iter()
        .flatten()
        .find(|t| !t.trim().is_empty())
        .unwrap_or("")
}

fn observation_item(obs: &Observation, format: Format) -> SearchResultItem {
    let title = first_non_blank([
        obs.title.as_deref(),
        obs.subtitle.as_deref(),
        obs.narrative.as_deref(),
        obs.facts.first().map(String::as_str),
    ]);
    let full = format == Format::Full;
    SearchResultItem {
        kind: "observation".into(),
        id: obs.id,
        title: truncate_title(title),
        content: full.then(|| observation_content(obs)),
        project: obs.project.clone(),
        scope: Some(obs.scope.as_str().to_string()),
        created_at_epoch: obs.created_at_epoch,
        score: None,
        importance: Some(obs.importance),
        metadata: full.then(|| {
            serde_json::json!({
                "observation_type": obs.observation_type,
                "session_key": obs.session_key,
                "concepts": obs.concepts,
                "files_read": obs.files_read,
                "files_modified": obs.files_modified,
                "importance": obs.importance,
                "superseded": obs.superseded,
            })
        }),
    }
}

fn observation_content(obs: &Observation) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(subtitle) = obs.subtitle.as_deref().filter(|s| !s.trim().is_empty()) {
        parts.push(subtitle.to_string());
    }
    if let Some(narrative) = obs.narrative.as_deref().filter(|s| !s.trim().is_empty()) {
        parts.push(narrative.to_string());
    }
    if !obs.facts.is_empty() {
        let facts: Vec<String> = obs.facts.iter().map(|f| format!("- {f}")).collect();
        parts.push(facts.join("\n"));
    }
    parts.join("\n\n")
}

fn summary_item(summary: &SessionSummary, format: Format) -> SearchResultItem {
    let fields = summary.fields();
    let title = fields.first().map(|(_, text)| *text).unwrap_or("");
    let full = format == Format::Full;
    SearchResultItem {
        kind: "session".into(),
        id: summary.id,
        title: truncate_title(title),
        content: full.then(|| {
            fields
                .iter()
                .map(|(name, text)| format!("{name}: {text}"))
                .collect::<Vec<_>>()
                .join("\n")
        }),
        project: summary.project.clone(),
        scope: None,
        created_at_epoch: summary.created_at_epoch,
        score: None,
        importance: None,
        metadata: full.then(|| {
            serde_json::json!({
                "session_key": summary.session_key,
                "prompt_number": summary.prompt_number,
            })
        }),
    }
}

fn prompt_item(prompt: &UserPrompt, format: Format) -> SearchResultItem {
    let full = format == Format::Full;
    SearchResultItem {
        kind: "prompt".into(),
        id: prompt.id,
        title: truncate_title(&prompt.prompt_text),
        content: full.then(|| prompt.prompt_text.clone()),
        project: prompt.project.clone(),
        scope: None,
        created_at_epoch: prompt.created_at_epoch,
        score: None,
        importance: None,
        metadata: full.then(|| {
            serde_json::json!({
                "session_key": prompt.session_key,
                "prompt_number": prompt.prompt_number,
                "matched_observations": prompt.matched_observations,
                "token_count": prompt.token_count,
            })
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetentionConfig;
    use crate::store::{NewObservation, NewSummary, ObservationType};
    use crate::vector::documents::observation_documents;
    use crate::vector::testing::HashEmbedder;
    use crate::vector::{RebuildStatus, SqliteVectorIndex, StaleVector, VectorDocument, VectorMatch};

    /// A vector store that reports connected but fails every query.
    struct BrokenIndex;

    impl VectorStore for BrokenIndex {
        fn add_documents(&self, _: &[VectorDocument]) -> Result<usize> {
            Err(anyhow!("index unavailable"))
        }
        fn delete_documents(&self, _: &[String]) -> Result<usize> {
            Err(anyhow!("index unavailable"))
        }
        fn delete_by_source_ids(&self, _: &str, _: &[i64]) -> Result<usize> {
            Err(anyhow!("index unavailable"))
        }
        fn query(&self, _: &str, _: usize, _: &VectorFilter) -> Result<Vec<VectorMatch>> {
            Err(anyhow!("index unavailable"))
        }
        fn count(&self) -> Result<usize> {
            Ok(0)
        }
        fn model_version(&self) -> &str {
            "broken"
        }
        fn needs_rebuild(&self) -> Result<RebuildStatus> {
            Ok(RebuildStatus::needed("empty"))
        }
        fn stale_vectors(&self) -> Result<Vec<StaleVector>> {
            Ok(Vec::new())
        }
        fn reembed_stale(&self) -> Result<usize> {
            Ok(0)
        }
        fn is_connected(&self) -> bool {
            true
        }
    }

    fn store() -> RetentionStore {
        RetentionStore::new(crate::db::open_memory_database().unwrap(), RetentionConfig::default())
    }

    fn vector_index() -> Arc<SqliteVectorIndex> {
        let conn = crate::db::open_memory_vector_database().unwrap();
        Arc::new(SqliteVectorIndex::new(conn, Arc::new(HashEmbedder::new("test-model"))))
    }

    fn obs(title: &str, narrative: &str) -> NewObservation {
        NewObservation {
            title: Some(title.into()),
            narrative: Some(narrative.into()),
            ..NewObservation::new(ObservationType::Discovery)
        }
    }

    async fn insert(store: &RetentionStore, index: Option<&SqliteVectorIndex>, project: &str, o: NewObservation) -> i64 {
        let id = store.store_observation("sess-1", project, o, None, 0).await.unwrap().id;
        if let Some(index) = index {
            let saved = store.get_observations(vec![id], OrderBy::Default, None).await.unwrap();
            index.add_documents(&observation_documents(&saved[0])).unwrap();
        }
        id
    }

    #[test]
    fn parse_search_type_and_format() {
        assert_eq!("".parse::<SearchType>().unwrap(), SearchType::All);
        assert_eq!("sessions".parse::<SearchType>().unwrap(), SearchType::Sessions);
        assert!("memories".parse::<SearchType>().is_err());
        assert_eq!("full".parse::<Format>().unwrap(), Format::Full);
        assert!("xml".parse::<Format>().is_err());
    }

    #[test]
    fn truncate_title_caps_length() {
        assert_eq!(truncate_title("short"), "short");
        let long = "x".repeat(150);
        let title = truncate_title(&long);
        assert_eq!(title.chars().count(), 100);
        assert!(title.ends_with("..."));
        let exact = "y".repeat(100);
        assert_eq!(truncate_title(&exact), exact);
    }

    #[test]
    fn preset_appends_keywords_and_forces_observations() {
        let params = with_preset(
            SearchParams {
                search_type: SearchType::Prompts,
                ..SearchParams::query("auth")
            },
            DECISIONS_KEYWORDS,
        );
        assert_eq!(params.search_type, SearchType::Observations);
        assert!(params.query.unwrap().starts_with("auth decision"));

        let empty = with_preset(SearchParams::default(), CHANGES_KEYWORDS);
        assert_eq!(empty.query.as_deref(), Some(CHANGES_KEYWORDS));
    }

    #[tokio::test]
    async fn limit_is_clamped() {
        let store = store();
        for i in 0..5 {
            insert(&store, None, "alpha", obs(&format!("note {i}"), "body")).await;
        }
        let manager = SearchManager::new(store, None, SearchConfig::default());

        let zero = manager
            .search(SearchParams {
                limit: Some(0),
                ..SearchParams::default()
            })
            .await
            .unwrap();
        assert_eq!(zero.total, 1);

        assert_eq!(manager.clamp_limit(Some(1000)), 100);
        assert_eq!(manager.clamp_limit(None), 20);
    }

    #[tokio::test]
    async fn structured_without_query_returns_recent_of_each_type() {
        let store = store();
        insert(&store, None, "alpha", obs("cache layer", "added read-through cache")).await;
        store
            .store_summary(
                "sess-1",
                "alpha",
                NewSummary {
                    request: Some("add caching".into()),
                    ..Default::default()
                },
                None,
                0,
            )
            .await
            .unwrap();
        store.store_prompt("sess-1", "alpha", 1, "please add caching", 0).await.unwrap();

        let manager = SearchManager::new(store, None, SearchConfig::default());
        let response = manager
            .search(SearchParams {
                project: Some("alpha".into()),
                format: Format::Full,
                ..SearchParams::default()
            })
            .await
            .unwrap();

        assert_eq!(response.strategy, SearchStrategy::Structured);
        let kinds: Vec<&str> = response.results.iter().map(|r| r.kind.as_str()).collect();
        assert_eq!(kinds, vec!["observation", "session", "prompt"]);
        assert_eq!(response.results[1].title, "add caching");
        assert!(response.results.iter().all(|r| r.content.is_some()));
    }

    #[tokio::test]
    async fn index_format_omits_content() {
        let store = store();
        insert(&store, None, "alpha", obs("title", "narrative")).await;
        let manager = SearchManager::new(store, None, SearchConfig::default());
        let response = manager.search(SearchParams::default()).await.unwrap();
        assert_eq!(response.results.len(), 1);
        assert!(response.results[0].content.is_none());
        assert!(response.results[0].metadata.is_none());
    }

    #[tokio::test]
    async fn vector_failure_falls_back_to_structured() {
        let store = store();
        let id = insert(&store, None, "alpha", obs("Retry policy", "exponential backoff for uploads")).await;
        let manager = SearchManager::new(store, Some(Arc::new(BrokenIndex)), SearchConfig::default());

        let response = manager
            .search(SearchParams {
                project: Some("alpha".into()),
                ..SearchParams::query("backoff uploads")
            })
            .await
            .unwrap();
        assert_eq!(response.strategy, SearchStrategy::Structured);
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].id, id);
    }

    #[tokio::test]
    async fn vector_branch_ranks_and_fuses() {
        let store = store();
        let index = vector_index();
        let hit = insert(&store, Some(&*index), "alpha", obs("Tokenizer limits", "tokenizer truncates long prompts")).await;
        insert(&store, Some(&*index), "alpha", obs("Pool sizing", "database pool uses eight connections")).await;

        let manager = SearchManager::new(store.clone(), Some(index), SearchConfig::default());
        let response = manager
            .search(SearchParams {
                project: Some("alpha".into()),
                search_type: SearchType::Observations,
                ..SearchParams::query("tokenizer truncates prompts")
            })
            .await
            .unwrap();

        assert_eq!(response.strategy, SearchStrategy::Vector);
        assert_eq!(response.results[0].id, hit);
        assert!(response.results[0].score.unwrap() > 0.0);

        let fetched = store.get_observations(vec![hit], OrderBy::Default, None).await.unwrap();
        assert_eq!(fetched[0].retrieval_count, 1);
    }

    #[tokio::test]
    async fn vector_branch_collapses_near_duplicates() {
        let store = store();
        let index = vector_index();
        let first = insert(&store, Some(&*index), "alpha", obs("websocket reconnect", "client reconnects websocket after timeout")).await;
        insert(&store, Some(&*index), "alpha", obs("websocket reconnect", "client reconnects websocket after timeout")).await;

        let manager = SearchManager::new(store, Some(index), SearchConfig::default());
        let response = manager
            .search(SearchParams::query("websocket reconnect timeout"))
            .await
            .unwrap();
        let observation_ids: Vec<i64> = response
            .results
            .iter()
            .filter(|r| r.kind == "observation")
            .map(|r| r.id)
            .collect();
        assert_eq!(observation_ids.len(), 1);
        assert!(observation_ids[0] >= first);
    }

    #[tokio::test]
    async fn exclude_superseded_filters_vector_results() {
        let store = store();
        let index = vector_index();
        let old = insert(&store, Some(&*index), "alpha", obs("Auth flow", "sessions stored in cookies")).await;
        let new = insert(&store, Some(&*index), "alpha", obs("Auth tokens", "tokens stored in headers")).await;
        store.mark_superseded(vec![old]).await.unwrap();

        let manager = SearchManager::new(store, Some(index), SearchConfig::default());
        let response = manager
            .search(SearchParams {
                exclude_superseded: true,
                search_type: SearchType::Observations,
                ..SearchParams::query("auth stored")
            })
            .await
            .unwrap();
        let ids: Vec<i64> = response.results.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![new]);
    }

    #[tokio::test]
    async fn structured_honors_date_asc() {
        let store = store();
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(insert(&store, None, "alpha", obs(&format!("step {i}"), "migration work")).await);
        }
        let manager = SearchManager::new(store, None, SearchConfig::default());

        let ordered = |order_by| SearchParams {
            project: Some("alpha".into()),
            search_type: SearchType::Observations,
            order_by,
            ..SearchParams::default()
        };
        let asc: Vec<i64> = manager
            .search(ordered(OrderBy::DateAsc))
            .await
            .unwrap()
            .results
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(asc, ids);

        let desc: Vec<i64> = manager
            .search(ordered(OrderBy::DateDesc))
            .await
            .unwrap()
            .results
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(desc, ids.iter().rev().copied().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn vector_branch_honors_date_asc() {
        let store = store();
        let index = vector_index();
        let first = insert(&store, Some(&*index), "alpha", obs("Retry budget", "retry budget for uploads")).await;
        let second = insert(&store, Some(&*index), "alpha", obs("Retry budget", "retry budget uploads raised")).await;

        let manager = SearchManager::new(
            store,
            Some(index),
            SearchConfig {
                dedup_threshold: 1.1,
                ..SearchConfig::default()
            },
        );
        let response = manager
            .search(SearchParams {
                search_type: SearchType::Observations,
                order_by: OrderBy::DateAsc,
                ..SearchParams::query("retry budget uploads")
            })
            .await
            .unwrap();
        assert_eq!(response.strategy, SearchStrategy::Vector);
        let ids: Vec<i64> = response.results.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[tokio::test]
    async fn excluding_global_still_fills_limit() {
        let store = store();
        let mut own = Vec::new();
        for i in 0..3 {
            own.push(insert(&store, None, "alpha", obs(&format!("alpha {i}"), "local note")).await);
        }
        for i in 0..5 {
            let shared = NewObservation {
                scope: Some(Scope::Global),
                ..obs(&format!("shared {i}"), "cross-project lesson")
            };
            insert(&store, None, "beta", shared).await;
        }
        let manager = SearchManager::new(store, None, SearchConfig::default());

        let response = manager
            .search(SearchParams {
                project: Some("alpha".into()),
                search_type: SearchType::Observations,
                include_global: false,
                limit: Some(3),
                ..SearchParams::default()
            })
            .await
            .unwrap();
        let mut ids: Vec<i64> = response.results.iter().map(|r| r.id).collect();
        ids.sort();
        assert_eq!(ids, own);
    }

    #[tokio::test]
    async fn unmatched_query_lists_recent_records() {
        let store = store();
        let id = insert(&store, None, "alpha", obs("cache layer", "read-through cache")).await;
        let manager = SearchManager::new(store, None, SearchConfig::default());

        let response = manager
            .search(SearchParams {
                project: Some("alpha".into()),
                ..SearchParams::query("kubernetes rollout")
            })
            .await
            .unwrap();
        assert_eq!(response.strategy, SearchStrategy::Structured);
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].id, id);
        assert!(response.results[0].score.is_none());
    }

    #[tokio::test]
    async fn full_text_ranking_merges_types_by_score() {
        let store = store();
        insert(&store, None, "alpha", obs("Sharding plan", "sharding by tenant")).await;
        store
            .store_summary(
                "sess-1",
                "alpha",
                NewSummary {
                    request: Some("sharding rollout".into()),
                    learned: Some("sharding by tenant keeps sharding simple".into()),
                    ..Default::default()
                },
                None,
                0,
            )
            .await
            .unwrap();
        store.store_prompt("sess-1", "alpha", 1, "plan the sharding work", 0).await.unwrap();

        let manager = SearchManager::new(store, None, SearchConfig::default());
        let ranked = manager
            .full_text_ranking(&SearchParams::query("sharding"), "sharding", 10)
            .await;
        let kinds: HashSet<&str> = ranked.iter().map(|r| r.doc_type.as_str()).collect();
        assert_eq!(kinds.len(), 3);
        assert!(ranked.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn decisions_preset_searches_observations_only() {
        let store = store();
        let id = insert(
            &store,
            None,
            "alpha",
            NewObservation {
                title: Some("Chose SQLite".into()),
                narrative: Some("decision: SQLite over Postgres for single-node deploys".into()),
                ..NewObservation::new(ObservationType::Decision)
            },
        )
        .await;
        store.store_prompt("sess-1", "alpha", 1, "what decision did we make", 0).await.unwrap();

        let manager = SearchManager::new(store, None, SearchConfig::default());
        let response = manager
            .decisions(SearchParams {
                project: Some("alpha".into()),
                ..SearchParams::query("sqlite")
            })
            .await
            .unwrap();
        assert!(response.results.iter().all(|r| r.kind == "observation"));
        assert_eq!(response.results[0].id, id);
    }
}
