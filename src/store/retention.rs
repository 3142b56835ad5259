//! Async handle over the retention store.
//!
//! Every operation runs its synchronous SQLite work on the blocking pool behind
//! one shared connection. Writes to bounded collections (observations, prompts)
//! spawn a detached eviction task with its own timeout: it is not tied to the
//! caller's future, so dropping or timing out the caller does not cancel it.
//! The timeout is a deadline the pass itself checks, so a pass that is still
//! waiting for the connection when it expires deletes nothing.

use anyhow::{anyhow, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::task::JoinHandle;

use super::types::{
    EvictionEvent, NewObservation, NewSummary, Observation, ObservationFilter, OrderBy, RecordKind,
    RetentionScope, Session, SessionStatus, SessionSummary, StoredRecord, UserPrompt,
};
use super::{observations, prompts, sessions, summaries};
use crate::cluster;
use crate::config::RetentionConfig;

/// Invoked after every eviction pass that removed rows. Runs on the blocking pool.
pub type CleanupCallback = Arc<dyn Fn(&EvictionEvent) -> Result<()> + Send + Sync>;

/// Per-project record counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub project: String,
    /// Project-scoped observations owned by the project.
    pub observations: usize,
    /// Global observations across all projects.
    pub global_observations: usize,
    pub summaries: usize,
    /// Prompts across all projects.
    pub prompts: usize,
}

#[derive(Clone)]
pub struct RetentionStore {
    db: Arc<Mutex<Connection>>,
    config: Arc<RetentionConfig>,
    cleanup: Arc<RwLock<Option<CleanupCallback>>>,
    evictions: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RetentionStore {
    pub fn new(conn: Connection, config: RetentionConfig) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
            config: Arc::new(config),
            cleanup: Arc::new(RwLock::new(None)),
            evictions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Register the callback that receives evicted IDs. Replaces any previous one.
    pub fn set_cleanup_callback(&self, callback: CleanupCallback) {
        match self.cleanup.write() {
            Ok(mut slot) => *slot = Some(callback),
            Err(e) => tracing::error!(error = %e, "cleanup callback lock poisoned"),
        }
    }

    /// Run `f` against the connection on the blocking pool.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|e| anyhow!("db lock poisoned: {e}"))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| anyhow!("db task failed: {e}"))?
    }

    // --- sessions ---

    pub async fn create_session(
        &self,
        session_key: &str,
        project: &str,
        user_prompt: Option<&str>,
    ) -> Result<i64> {
        let (key, project) = (session_key.to_string(), project.to_string());
        let prompt = user_prompt.map(str::to_string);
        self.with_conn(move |conn| sessions::upsert_session(conn, &key, &project, prompt.as_deref()))
            .await
    }

    pub async fn get_session(&self, session_key: &str) -> Result<Option<Session>> {
        let key = session_key.to_string();
        self.with_conn(move |conn| sessions::get_session(conn, &key))
            .await
    }

    pub async fn complete_session(&self, session_key: &str, status: SessionStatus) -> Result<bool> {
        let key = session_key.to_string();
        self.with_conn(move |conn| sessions::complete_session(conn, &key, status))
            .await
    }

    pub async fn increment_prompt_counter(&self, session_key: &str) -> Result<i64> {
        let key = session_key.to_string();
        self.with_conn(move |conn| sessions::increment_prompt_counter(conn, &key))
            .await
    }

    // --- observations ---

    /// Persist an observation and schedule eviction of its retention pool.
    pub async fn store_observation(
        &self,
        session_key: &str,
        project: &str,
        obs: NewObservation,
        prompt_number: Option<i64>,
        discovery_tokens: i64,
    ) -> Result<StoredRecord> {
        let pool = match obs.resolved_scope() {
            super::Scope::Global => RetentionScope::Global,
            super::Scope::Project => RetentionScope::Project(project.to_string()),
        };
        let (key, project) = (session_key.to_string(), project.to_string());
        let stored = self
            .with_conn(move |conn| {
                observations::store_observation(conn, &key, &project, &obs, prompt_number, discovery_tokens)
            })
            .await?;

        self.schedule_eviction(RecordKind::Observation, pool);
        Ok(stored)
    }

    /// Like [`store_observation`](Self::store_observation), but skips the write
    /// when the candidate is a near-duplicate of one of the project's most recent
    /// observations. Returns `None` when skipped.
    pub async fn store_observation_deduplicated(
        &self,
        session_key: &str,
        project: &str,
        obs: NewObservation,
        prompt_number: Option<i64>,
        discovery_tokens: i64,
    ) -> Result<Option<StoredRecord>> {
        let recent = self
            .recent_observations(project, self.config.write_dedup_window)
            .await?;
        if cluster::is_similar_to_any(&obs, &recent, self.config.write_dedup_threshold) {
            tracing::info!(project = %project, title = ?obs.title, "skipping near-duplicate observation");
            return Ok(None);
        }
        self.store_observation(session_key, project, obs, prompt_number, discovery_tokens)
            .await
            .map(Some)
    }

    pub async fn get_observations(
        &self,
        ids: Vec<i64>,
        order_by: OrderBy,
        limit: Option<usize>,
    ) -> Result<Vec<Observation>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(move |conn| observations::get_by_ids(conn, &ids, order_by, limit))
            .await
    }

    /// Observations passing `filter`, filtered in SQL before `limit` applies.
    pub async fn list_observations(
        &self,
        filter: ObservationFilter,
        order_by: OrderBy,
        limit: usize,
    ) -> Result<Vec<Observation>> {
        self.with_conn(move |conn| observations::list(conn, &filter, order_by, limit))
            .await
    }

    pub async fn recent_observations(&self, project: &str, limit: usize) -> Result<Vec<Observation>> {
        let project = project.to_string();
        self.with_conn(move |conn| observations::get_recent(conn, &project, limit))
            .await
    }

    pub async fn active_observations(&self, project: &str, limit: usize) -> Result<Vec<Observation>> {
        let project = project.to_string();
        self.with_conn(move |conn| observations::get_active(conn, &project, limit))
            .await
    }

    pub async fn all_recent_observations(&self, limit: usize) -> Result<Vec<Observation>> {
        self.with_conn(move |conn| observations::get_all_recent(conn, limit))
            .await
    }

    pub async fn search_observations(
        &self,
        query: &str,
        filter: ObservationFilter,
        limit: usize,
    ) -> Result<Vec<(Observation, f64)>> {
        let query = query.to_string();
        self.with_conn(move |conn| observations::search_filtered(conn, &query, &filter, limit))
            .await
    }

    pub async fn delete_observations(&self, ids: Vec<i64>) -> Result<usize> {
        self.with_conn(move |conn| observations::delete_by_ids(conn, &ids))
            .await
    }

    pub async fn count_observations(&self, project: &str) -> Result<usize> {
        let project = project.to_string();
        self.with_conn(move |conn| observations::count(conn, &project))
            .await
    }

    pub async fn mark_superseded(&self, ids: Vec<i64>) -> Result<usize> {
        self.with_conn(move |conn| observations::mark_superseded(conn, &ids))
            .await
    }

    pub async fn record_retrieval(&self, ids: Vec<i64>) -> Result<()> {
        self.with_conn(move |conn| observations::record_retrieval(conn, &ids))
            .await
    }

    pub async fn update_importance(&self, id: i64, importance: f64) -> Result<bool> {
        self.with_conn(move |conn| observations::update_importance(conn, id, importance))
            .await
    }

    // --- summaries ---

    /// Persist a summary. Summaries are not evicted.
    pub async fn store_summary(
        &self,
        session_key: &str,
        project: &str,
        summary: NewSummary,
        prompt_number: Option<i64>,
        discovery_tokens: i64,
    ) -> Result<StoredRecord> {
        let (key, project) = (session_key.to_string(), project.to_string());
        self.with_conn(move |conn| {
            summaries::store_summary(conn, &key, &project, &summary, prompt_number, discovery_tokens)
        })
        .await
    }

    pub async fn get_summaries(
        &self,
        ids: Vec<i64>,
        order_by: OrderBy,
        limit: Option<usize>,
    ) -> Result<Vec<SessionSummary>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(move |conn| summaries::get_by_ids(conn, &ids, order_by, limit))
            .await
    }

    pub async fn list_summaries(
        &self,
        project: Option<&str>,
        order_by: OrderBy,
        limit: usize,
    ) -> Result<Vec<SessionSummary>> {
        let project = project.map(str::to_string);
        self.with_conn(move |conn| summaries::list(conn, project.as_deref(), order_by, limit))
            .await
    }

    pub async fn recent_summaries(&self, project: &str, limit: usize) -> Result<Vec<SessionSummary>> {
        let project = project.to_string();
        self.with_conn(move |conn| summaries::get_recent(conn, &project, limit))
            .await
    }

    pub async fn all_recent_summaries(&self, limit: usize) -> Result<Vec<SessionSummary>> {
        self.with_conn(move |conn| summaries::get_all_recent(conn, limit))
            .await
    }

    pub async fn search_summaries(
        &self,
        query: &str,
        project: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(SessionSummary, f64)>> {
        let query = query.to_string();
        let project = project.map(str::to_string);
        self.with_conn(move |conn| summaries::search_full_text(conn, &query, project.as_deref(), limit))
            .await
    }

    pub async fn delete_summaries(&self, ids: Vec<i64>) -> Result<usize> {
        self.with_conn(move |conn| summaries::delete_by_ids(conn, &ids))
            .await
    }

    // --- prompts ---

    /// Persist a prompt and schedule eviction of the global prompt pool.
    pub async fn store_prompt(
        &self,
        session_key: &str,
        project: &str,
        prompt_number: i64,
        prompt_text: &str,
        token_count: i64,
    ) -> Result<StoredRecord> {
        let (key, project) = (session_key.to_string(), project.to_string());
        let text = prompt_text.to_string();
        let stored = self
            .with_conn(move |conn| {
                prompts::save_prompt(conn, &key, &project, prompt_number, &text, token_count)
            })
            .await?;

        self.schedule_eviction(RecordKind::Prompt, RetentionScope::Global);
        Ok(stored)
    }

    pub async fn get_prompts(
        &self,
        ids: Vec<i64>,
        order_by: OrderBy,
        limit: Option<usize>,
    ) -> Result<Vec<UserPrompt>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(move |conn| prompts::get_by_ids(conn, &ids, order_by, limit))
            .await
    }

    pub async fn list_prompts(
        &self,
        project: Option<&str>,
        order_by: OrderBy,
        limit: usize,
    ) -> Result<Vec<UserPrompt>> {
        let project = project.map(str::to_string);
        self.with_conn(move |conn| prompts::list(conn, project.as_deref(), order_by, limit))
            .await
    }

    pub async fn recent_prompts(&self, project: &str, limit: usize) -> Result<Vec<UserPrompt>> {
        let project = project.to_string();
        self.with_conn(move |conn| prompts::get_recent(conn, &project, limit))
            .await
    }

    pub async fn all_recent_prompts(&self, limit: usize) -> Result<Vec<UserPrompt>> {
        self.with_conn(move |conn| prompts::get_all_recent(conn, limit))
            .await
    }

    pub async fn search_prompts(
        &self,
        query: &str,
        project: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(UserPrompt, f64)>> {
        let query = query.to_string();
        let project = project.map(str::to_string);
        self.with_conn(move |conn| prompts::search_full_text(conn, &query, project.as_deref(), limit))
            .await
    }

    pub async fn update_matched_count(&self, id: i64, matched: i64) -> Result<bool> {
        self.with_conn(move |conn| prompts::update_matched_count(conn, id, matched))
            .await
    }

    pub async fn delete_prompts(&self, ids: Vec<i64>) -> Result<usize> {
        self.with_conn(move |conn| prompts::delete_by_ids(conn, &ids))
            .await
    }

    // --- retention ---

    /// Run one eviction pass now and deliver the evicted IDs to the cleanup callback.
    ///
    /// Unlike the detached pass scheduled by writes, errors propagate to the caller.
    pub async fn cleanup(&self, kind: RecordKind, scope: RetentionScope) -> Result<Vec<i64>> {
        let keep = self.quota(kind, &scope)?;
        let callback = self.callback();
        let ids = self
            .with_conn(move |conn| evict(conn, kind, &scope, keep, None))
            .await?;
        if !ids.is_empty() {
            let event = EvictionEvent {
                kind,
                ids: ids.clone(),
            };
            tokio::task::spawn_blocking(move || notify(callback, &event))
                .await
                .map_err(|e| anyhow!("cleanup callback task failed: {e}"))?;
        }
        Ok(ids)
    }

    /// Spawn a detached eviction pass for `scope`, bounded by the configured timeout.
    ///
    /// The pass keeps running if the caller is cancelled. A pass that reaches its
    /// deadline before committing rolls back and skips the callback; a committed
    /// pass always reports its IDs. Failures are logged.
    pub fn schedule_eviction(&self, kind: RecordKind, scope: RetentionScope) {
        let keep = match self.quota(kind, &scope) {
            Ok(keep) => keep,
            Err(e) => {
                tracing::warn!(error = %e, "eviction not scheduled");
                return;
            }
        };
        let db = Arc::clone(&self.db);
        let callback = self.callback();
        let timeout = self.config.eviction_timeout();
        let deadline = Instant::now() + timeout;

        let handle = tokio::spawn(async move {
            let job = tokio::task::spawn_blocking(move || -> Result<Vec<i64>> {
                let ids = {
                    let mut conn = db
                        .lock()
                        .map_err(|e| anyhow!("db lock poisoned: {e}"))?;
                    evict(&mut conn, kind, &scope, keep, Some(deadline))?
                };
                if !ids.is_empty() {
                    tracing::info!(kind = ?kind, scope = ?scope, evicted = ids.len(), "eviction pass complete");
                    notify(callback, &EvictionEvent {
                        kind,
                        ids: ids.clone(),
                    });
                }
                Ok(ids)
            });

            match tokio::time::timeout(timeout, job).await {
                Ok(Ok(Ok(_))) => {}
                Ok(Ok(Err(e))) => tracing::warn!(error = %e, kind = ?kind, "eviction failed"),
                Ok(Err(e)) => tracing::error!(error = %e, kind = ?kind, "eviction task panicked"),
                Err(_) => tracing::warn!(
                    kind = ?kind,
                    timeout_secs = timeout.as_secs(),
                    "eviction timed out, pass will roll back if it has not committed"
                ),
            }
        });

        match self.evictions.lock() {
            Ok(mut handles) => {
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
            }
            Err(e) => tracing::error!(error = %e, "eviction handle list poisoned"),
        }
    }

    /// Wait for every eviction pass scheduled so far to finish.
    pub async fn wait_for_evictions(&self) {
        let handles: Vec<JoinHandle<()>> = match self.evictions.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(_) => return,
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub async fn stats(&self, project: &str) -> Result<StoreStats> {
        let project = project.to_string();
        self.with_conn(move |conn| {
            Ok(StoreStats {
                observations: observations::count_in_pool(
                    conn,
                    &RetentionScope::Project(project.clone()),
                )?,
                global_observations: observations::count_in_pool(conn, &RetentionScope::Global)?,
                summaries: summaries::count(conn, &project)?,
                prompts: prompts::count(conn)?,
                project,
            })
        })
        .await
    }

    fn quota(&self, kind: RecordKind, scope: &RetentionScope) -> Result<usize> {
        match (kind, scope) {
            (RecordKind::Observation, RetentionScope::Project(_)) => {
                Ok(self.config.max_observations_per_project)
            }
            (RecordKind::Observation, RetentionScope::Global) => {
                Ok(self.config.max_global_observations)
            }
            (RecordKind::Prompt, _) => Ok(self.config.max_prompts),
            (RecordKind::Summary, _) => Err(anyhow!("summaries are not subject to retention")),
        }
    }

    fn callback(&self) -> Option<CleanupCallback> {
        self.cleanup.read().ok().and_then(|slot| slot.clone())
    }
}

fn evict(
    conn: &mut Connection,
    kind: RecordKind,
    scope: &RetentionScope,
    keep: usize,
    deadline: Option<Instant>,
) -> Result<Vec<i64>> {
    match kind {
        RecordKind::Observation => observations::cleanup_old(conn, scope, keep, deadline),
        RecordKind::Prompt => prompts::cleanup_old(conn, scope, keep, deadline),
        RecordKind::Summary => Ok(Vec::new()),
    }
}

fn notify(callback: Option<CleanupCallback>, event: &EvictionEvent) {
    if let Some(callback) = callback {
        if let Err(e) = callback(event) {
            tracing::warn!(error = %e, kind = ?event.kind, ids = event.ids.len(), "cleanup callback failed");
        }
    }
}
