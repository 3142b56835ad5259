//! Observation persistence, visibility-scoped reads, full-text search, and retention.

use anyhow::Result;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use super::eviction::evict_beyond;
use super::keywords::{extract_keywords, fts_match_expression, like_clause};
use super::sessions::upsert_session;
use super::types::{
    NewObservation, Observation, ObservationFilter, OrderBy, RetentionScope, Scope, StoredRecord,
};
use super::{from_json, id_placeholders, now, to_json};
use crate::rrf;

const OBSERVATION_COLUMNS: &str = "o.id, o.session_key, o.project, o.scope, o.type, o.title, \
     o.subtitle, o.narrative, o.facts, o.concepts, o.files_read, o.files_modified, o.file_mtimes, \
     o.prompt_number, o.discovery_tokens, o.importance, o.retrieval_count, \
     o.last_retrieved_at_epoch, o.superseded, o.created_at, o.created_at_epoch";

/// Project-scoped rows of `?1`, plus every global row.
const VISIBLE_TO_PROJECT: &str = "((o.project = ?1 AND o.scope != 'global') OR o.scope = 'global')";

const TEXT_COLUMNS: &[&str] = &["o.title", "o.subtitle", "o.narrative"];

/// Persist an observation, upserting its session in the same transaction.
pub fn store_observation(
    conn: &mut Connection,
    session_key: &str,
    project: &str,
    obs: &NewObservation,
    prompt_number: Option<i64>,
    discovery_tokens: i64,
) -> Result<StoredRecord> {
    let tx = conn.transaction()?;
    upsert_session(&tx, session_key, project, None)?;

    let (now, now_epoch) = now();
    let scope = obs.resolved_scope();
    tx.execute(
        "INSERT INTO observations (session_key, project, scope, type, title, subtitle, narrative, \
         facts, concepts, files_read, files_modified, file_mtimes, prompt_number, discovery_tokens, \
         importance, created_at, created_at_epoch) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            session_key,
            project,
            scope.as_str(),
            obs.observation_type.as_str(),
            obs.title,
            obs.subtitle,
            obs.narrative,
            to_json(&obs.facts)?,
            to_json(&obs.concepts)?,
            to_json(&obs.files_read)?,
            to_json(&obs.files_modified)?,
            to_json(&obs.file_mtimes)?,
            prompt_number,
            discovery_tokens,
            obs.importance.unwrap_or(1.0),
            now,
            now_epoch,
        ],
    )?;
    let id = tx.last_insert_rowid();
    tx.commit()?;

    Ok(StoredRecord {
        id,
        created_at_epoch: now_epoch,
    })
}

/// Batch fetch. Empty `ids` returns empty.
pub fn get_by_ids(
    conn: &Connection,
    ids: &[i64],
    order_by: OrderBy,
    limit: Option<usize>,
) -> Result<Vec<Observation>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let order = match order_by {
        OrderBy::DateAsc => "o.created_at_epoch ASC, o.id ASC",
        OrderBy::DateDesc => "o.created_at_epoch DESC, o.id DESC",
        OrderBy::Importance | OrderBy::Default => {
            "o.importance DESC, o.created_at_epoch DESC, o.id DESC"
        }
    };
    let sql = format!(
        "SELECT {OBSERVATION_COLUMNS} FROM observations o WHERE o.id IN ({}) ORDER BY {order}{}",
        id_placeholders(ids.len()),
        limit_clause(limit),
    );
    query_observations(conn, &sql, params_from_iter(ids))
}

/// Up to `limit` observations passing `filter`. `Default` ordering is newest first.
pub fn list(
    conn: &Connection,
    filter: &ObservationFilter,
    order_by: OrderBy,
    limit: usize,
) -> Result<Vec<Observation>> {
    let order = match order_by {
        OrderBy::DateAsc => "o.created_at_epoch ASC, o.id ASC",
        OrderBy::Importance => "o.importance DESC, o.created_at_epoch DESC, o.id DESC",
        OrderBy::DateDesc | OrderBy::Default => "o.created_at_epoch DESC, o.id DESC",
    };
    let sql = format!(
        "SELECT {OBSERVATION_COLUMNS} FROM observations o WHERE {} ORDER BY {order} LIMIT ?2",
        filter_clause(filter),
    );
    query_observations(conn, &sql, params![filter.project, limit as i64])
}

/// Most recent observations visible to `project`, superseded ones included.
pub fn get_recent(conn: &Connection, project: &str, limit: usize) -> Result<Vec<Observation>> {
    list(conn, &ObservationFilter::visible_to(project), OrderBy::DateDesc, limit)
}

/// Most recent non-superseded observations visible to `project`.
pub fn get_active(conn: &Connection, project: &str, limit: usize) -> Result<Vec<Observation>> {
    let filter = ObservationFilter {
        active_only: true,
        ..ObservationFilter::visible_to(project)
    };
    list(conn, &filter, OrderBy::DateDesc, limit)
}

/// Most recent observations across every project.
pub fn get_all_recent(conn: &Connection, limit: usize) -> Result<Vec<Observation>> {
    list(conn, &ObservationFilter::everywhere(), OrderBy::DateDesc, limit)
}

/// Row predicate for `filter`. `?1` binds the project, or NULL for every project.
fn filter_clause(filter: &ObservationFilter) -> String {
    let mut clause = match (filter.project.is_some(), filter.include_global) {
        (true, true) => VISIBLE_TO_PROJECT,
        (true, false) => "(o.project = ?1 AND o.scope != 'global')",
        (false, true) => "(?1 IS NULL)",
        (false, false) => "(?1 IS NULL AND o.scope != 'global')",
    }
    .to_string();
    if filter.active_only {
        clause.push_str(" AND o.superseded = 0");
    }
    clause
}

/// Keyword search over title/subtitle/narrative, ranked by bm25.
///
/// Falls back to a `LIKE` scan when FTS5 errors or matches nothing. With
/// `project = None` the search spans every project. Scores are bm25 mapped
/// through [`rrf::normalize`]; fallback rows score 0.
pub fn search_full_text(
    conn: &Connection,
    query: &str,
    project: Option<&str>,
    limit: usize,
) -> Result<Vec<(Observation, f64)>> {
    let filter = match project {
        Some(p) => ObservationFilter::visible_to(p),
        None => ObservationFilter::everywhere(),
    };
    search_filtered(conn, query, &filter, limit)
}

/// [`search_full_text`] restricted to rows passing `filter`.
pub fn search_filtered(
    conn: &Connection,
    query: &str,
    filter: &ObservationFilter,
    limit: usize,
) -> Result<Vec<(Observation, f64)>> {
    let keywords = extract_keywords(query);
    if keywords.is_empty() {
        return Ok(Vec::new());
    }

    match fts_search(conn, &keywords, filter, limit) {
        Ok(hits) if !hits.is_empty() => return Ok(hits),
        Ok(_) => tracing::debug!(?keywords, "no FTS matches, trying LIKE fallback"),
        Err(e) => tracing::warn!(error = %e, "observation FTS failed, using LIKE fallback"),
    }

    like_search(conn, &keywords, filter, limit)
}

fn project_value(filter: &ObservationFilter) -> Value {
    filter
        .project
        .as_ref()
        .map_or(Value::Null, |p| Value::Text(p.clone()))
}

fn fts_search(
    conn: &Connection,
    keywords: &[String],
    filter: &ObservationFilter,
    limit: usize,
) -> Result<Vec<(Observation, f64)>> {
    let values = vec![
        project_value(filter),
        Value::Text(fts_match_expression(keywords)),
        Value::Integer(limit as i64),
    ];
    let visibility = filter_clause(filter);
    let sql = format!(
        "SELECT {OBSERVATION_COLUMNS}, bm25(observations_fts) AS rank \
         FROM observations_fts JOIN observations o ON o.id = observations_fts.rowid \
         WHERE observations_fts MATCH ?2 AND {visibility} \
         ORDER BY rank LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), |row| {
            let rank: f64 = row.get(21)?;
            Ok((row_to_observation(row)?, rrf::normalize(rank)))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn like_search(
    conn: &Connection,
    keywords: &[String],
    filter: &ObservationFilter,
    limit: usize,
) -> Result<Vec<(Observation, f64)>> {
    let (clause, like_params) = like_clause(keywords, TEXT_COLUMNS, 3);
    let mut values = vec![project_value(filter), Value::Integer(limit as i64)];
    values.extend(like_params);
    let visibility = filter_clause(filter);
    let sql = format!(
        "SELECT {OBSERVATION_COLUMNS} FROM observations o \
         WHERE {clause} AND {visibility} \
         ORDER BY o.created_at_epoch DESC, o.id DESC LIMIT ?2"
    );
    let rows = query_observations(conn, &sql, params_from_iter(values))?;
    Ok(rows.into_iter().map(|o| (o, 0.0)).collect())
}

pub fn delete_by_ids(conn: &Connection, ids: &[i64]) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "DELETE FROM observations WHERE id IN ({})",
        id_placeholders(ids.len())
    );
    Ok(conn.execute(&sql, params_from_iter(ids))?)
}

/// Observations visible to `project` (its project-scoped rows plus global ones).
pub fn count(conn: &Connection, project: &str) -> Result<usize> {
    let n: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM observations o WHERE {VISIBLE_TO_PROJECT}"),
        params![project],
        |row| row.get(0),
    )?;
    Ok(n as usize)
}

/// Rows that count against a retention pool.
pub fn count_in_pool(conn: &Connection, scope: &RetentionScope) -> Result<usize> {
    let (filter, param) = pool_filter(scope);
    let sql = format!("SELECT COUNT(*) FROM observations WHERE {filter}");
    let n: i64 = match param {
        Some(p) => conn.query_row(&sql, params![p], |row| row.get(0))?,
        None => conn.query_row(&sql, [], |row| row.get(0))?,
    };
    Ok(n as usize)
}

/// Keep the newest `keep` observations of a retention pool; delete the rest.
///
/// A project pool holds only that project's project-scoped rows; global rows
/// are never evicted by a project's quota and live in their own pool.
pub fn cleanup_old(
    conn: &mut Connection,
    scope: &RetentionScope,
    keep: usize,
    deadline: Option<Instant>,
) -> Result<Vec<i64>> {
    let (filter, param) = pool_filter(scope);
    match param {
        Some(p) => evict_beyond(conn, "observations", filter, &[&p], keep, deadline),
        None => evict_beyond(conn, "observations", filter, &[], keep, deadline),
    }
}

fn pool_filter(scope: &RetentionScope) -> (&'static str, Option<String>) {
    match scope {
        RetentionScope::Project(p) => ("project = ?1 AND scope = 'project'", Some(p.clone())),
        RetentionScope::Global => ("scope = 'global'", None),
    }
}

/// Flag observations as superseded. Returns the number updated.
pub fn mark_superseded(conn: &Connection, ids: &[i64]) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "UPDATE observations SET superseded = 1 WHERE id IN ({})",
        id_placeholders(ids.len())
    );
    Ok(conn.execute(&sql, params_from_iter(ids))?)
}

/// Bump retrieval counters for observations returned to a caller.
pub fn record_retrieval(conn: &Connection, ids: &[i64]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let (_, now_epoch) = now();
    let mut stmt = conn.prepare(
        "UPDATE observations SET retrieval_count = retrieval_count + 1, \
         last_retrieved_at_epoch = ?1 WHERE id = ?2",
    )?;
    for id in ids {
        stmt.execute(params![now_epoch, id])?;
    }
    Ok(())
}

pub fn update_importance(conn: &Connection, id: i64, importance: f64) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE observations SET importance = ?1 WHERE id = ?2",
        params![importance, id],
    )?;
    Ok(rows > 0)
}

/// Files whose current modification time no longer matches the one recorded
/// with the observation. Missing files count as stale.
pub fn stale_files(obs: &Observation) -> Vec<String> {
    obs.file_mtimes
        .iter()
        .filter(|(path, recorded)| current_mtime_millis(Path::new(path)) != Some(**recorded))
        .map(|(path, _)| path.clone())
        .collect()
}

/// Modification time in epoch millis, or `None` if the file can't be stat'ed.
pub fn current_mtime_millis(path: &Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(since_epoch.as_millis() as i64)
}

fn limit_clause(limit: Option<usize>) -> String {
    limit.map(|n| format!(" LIMIT {n}")).unwrap_or_default()
}

fn query_observations<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Observation>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, row_to_observation)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn row_to_observation(row: &Row<'_>) -> rusqlite::Result<Observation> {
    let scope: String = row.get(3)?;
    let observation_type: String = row.get(4)?;
    let facts: String = row.get(8)?;
    let concepts: String = row.get(9)?;
    let files_read: String = row.get(10)?;
    let files_modified: String = row.get(11)?;
    let file_mtimes: String = row.get(12)?;
    Ok(Observation {
        id: row.get(0)?,
        session_key: row.get(1)?,
        project: row.get(2)?,
        scope: scope.parse().unwrap_or(Scope::Project),
        observation_type: observation_type
            .parse()
            .unwrap_or(super::types::ObservationType::Change),
        title: row.get(5)?,
        subtitle: row.get(6)?,
        narrative: row.get(7)?,
        facts: from_json(&facts),
        concepts: from_json(&concepts),
        files_read: from_json(&files_read),
        files_modified: from_json(&files_modified),
        file_mtimes: from_json::<BTreeMap<String, i64>>(&file_mtimes),
        prompt_number: row.get(13)?,
        discovery_tokens: row.get(14)?,
        importance: row.get(15)?,
        retrieval_count: row.get(16)?,
        last_retrieved_at_epoch: row.get(17)?,
        superseded: row.get(18)?,
        created_at: row.get(19)?,
        created_at_epoch: row.get(20)?,
    })
}
