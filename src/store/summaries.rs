//! Session summaries. Unbounded by retention.

use anyhow::Result;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};

use super::keywords::{extract_keywords, fts_match_expression, like_clause};
use super::sessions::upsert_session;
use super::types::{NewSummary, OrderBy, SessionSummary, StoredRecord};
use super::{id_placeholders, now};
use crate::rrf;

const SUMMARY_COLUMNS: &str = "s.id, s.session_key, s.project, s.request, s.investigated, \
     s.learned, s.completed, s.next_steps, s.notes, s.prompt_number, s.discovery_tokens, \
     s.created_at, s.created_at_epoch";

const TEXT_COLUMNS: &[&str] = &[
    "s.request",
    "s.investigated",
    "s.learned",
    "s.completed",
    "s.next_steps",
    "s.notes",
];

pub fn store_summary(
    conn: &mut Connection,
    session_key: &str,
    project: &str,
    summary: &NewSummary,
    prompt_number: Option<i64>,
    discovery_tokens: i64,
) -> Result<StoredRecord> {
    let tx = conn.transaction()?;
    upsert_session(&tx, session_key, project, None)?;

    let (now, now_epoch) = now();
    tx.execute(
        "INSERT INTO session_summaries (session_key, project, request, investigated, learned, \
         completed, next_steps, notes, prompt_number, discovery_tokens, created_at, created_at_epoch) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            session_key,
            project,
            summary.request,
            summary.investigated,
            summary.learned,
            summary.completed,
            summary.next_steps,
            summary.notes,
            prompt_number,
            discovery_tokens,
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

pub fn get_by_ids(
    conn: &Connection,
    ids: &[i64],
    order_by: OrderBy,
    limit: Option<usize>,
) -> Result<Vec<SessionSummary>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let order = match order_by {
        OrderBy::DateAsc => "s.created_at_epoch ASC, s.id ASC",
        _ => "s.created_at_epoch DESC, s.id DESC",
    };
    let mut sql = format!(
        "SELECT {SUMMARY_COLUMNS} FROM session_summaries s WHERE s.id IN ({}) ORDER BY {order}",
        id_placeholders(ids.len()),
    );
    if let Some(n) = limit {
        sql.push_str(&format!(" LIMIT {n}"));
    }
    query_summaries(conn, &sql, params_from_iter(ids))
}

/// Up to `limit` summaries of `project` (or of every project). `Default` ordering is newest first.
pub fn list(
    conn: &Connection,
    project: Option<&str>,
    order_by: OrderBy,
    limit: usize,
) -> Result<Vec<SessionSummary>> {
    let order = match order_by {
        OrderBy::DateAsc => "s.created_at_epoch ASC, s.id ASC",
        _ => "s.created_at_epoch DESC, s.id DESC",
    };
    let sql = format!(
        "SELECT {SUMMARY_COLUMNS} FROM session_summaries s \
         WHERE (?1 IS NULL OR s.project = ?1) ORDER BY {order} LIMIT ?2"
    );
    query_summaries(conn, &sql, params![project, limit as i64])
}

pub fn get_recent(conn: &Connection, project: &str, limit: usize) -> Result<Vec<SessionSummary>> {
    list(conn, Some(project), OrderBy::DateDesc, limit)
}

/// Most recent summaries across every project.
pub fn get_all_recent(conn: &Connection, limit: usize) -> Result<Vec<SessionSummary>> {
    list(conn, None, OrderBy::DateDesc, limit)
}

/// Keyword search over all six summary fields, with the same `LIKE` fallback as observations.
pub fn search_full_text(
    conn: &Connection,
    query: &str,
    project: Option<&str>,
    limit: usize,
) -> Result<Vec<(SessionSummary, f64)>> {
    let keywords = extract_keywords(query);
    if keywords.is_empty() {
        return Ok(Vec::new());
    }
    let project_value = project.map_or(Value::Null, |p| Value::Text(p.to_string()));

    let fts_sql = format!(
        "SELECT {SUMMARY_COLUMNS}, bm25(session_summaries_fts) AS rank \
         FROM session_summaries_fts JOIN session_summaries s ON s.id = session_summaries_fts.rowid \
         WHERE session_summaries_fts MATCH ?2 AND (?1 IS NULL OR s.project = ?1) \
         ORDER BY rank LIMIT ?3"
    );
    let fts = conn.prepare(&fts_sql).and_then(|mut stmt| {
        let hits = stmt
            .query_map(
                params![project_value, fts_match_expression(&keywords), limit as i64],
                |row| {
                    let rank: f64 = row.get(13)?;
                    Ok((row_to_summary(row)?, rrf::normalize(rank)))
                },
            )?
            .collect::<Result<Vec<_>, _>>();
        hits
    });
    match fts {
        Ok(hits) if !hits.is_empty() => return Ok(hits),
        Ok(_) => tracing::debug!(?keywords, "no summary FTS matches, trying LIKE fallback"),
        Err(e) => tracing::warn!(error = %e, "summary FTS failed, using LIKE fallback"),
    }

    let (clause, like_params) = like_clause(&keywords, TEXT_COLUMNS, 3);
    let mut values = vec![project_value, Value::Integer(limit as i64)];
    values.extend(like_params);
    let sql = format!(
        "SELECT {SUMMARY_COLUMNS} FROM session_summaries s \
         WHERE {clause} AND (?1 IS NULL OR s.project = ?1) \
         ORDER BY s.created_at_epoch DESC, s.id DESC LIMIT ?2"
    );
    let rows = query_summaries(conn, &sql, params_from_iter(values))?;
    Ok(rows.into_iter().map(|s| (s, 0.0)).collect())
}

pub fn delete_by_ids(conn: &Connection, ids: &[i64]) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "DELETE FROM session_summaries WHERE id IN ({})",
        id_placeholders(ids.len())
    );
    Ok(conn.execute(&sql, params_from_iter(ids))?)
}

pub fn count(conn: &Connection, project: &str) -> Result<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM session_summaries WHERE project = ?1",
        params![project],
        |row| row.get(0),
    )?;
    Ok(n as usize)
}

fn query_summaries<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<SessionSummary>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, row_to_summary)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn row_to_summary(row: &Row<'_>) -> rusqlite::Result<SessionSummary> {
    Ok(SessionSummary {
        id: row.get(0)?,
        session_key: row.get(1)?,
        project: row.get(2)?,
        request: row.get(3)?,
        investigated: row.get(4)?,
        learned: row.get(5)?,
        completed: row.get(6)?,
        next_steps: row.get(7)?,
        notes: row.get(8)?,
        prompt_number: row.get(9)?,
        discovery_tokens: row.get(10)?,
        created_at: row.get(11)?,
        created_at_epoch: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        crate::db::open_memory_database().unwrap()
    }

    fn summary(request: &str, learned: &str) -> NewSummary {
        NewSummary {
            request: Some(request.into()),
            learned: Some(learned.into()),
            ..Default::default()
        }
    }

    #[test]
    fn store_and_fetch() {
        let mut conn = test_db();
        let stored =
            store_summary(&mut conn, "sess-1", "alpha", &summary("add retries", "backoff works"), Some(2), 40)
                .unwrap();
        let fetched = get_by_ids(&conn, &[stored.id], OrderBy::Default, None).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].request.as_deref(), Some("add retries"));
        assert_eq!(fetched[0].prompt_number, Some(2));
        assert_eq!(count(&conn, "alpha").unwrap(), 1);
    }

    #[test]
    fn search_matches_any_field_and_filters_project() {
        let mut conn = test_db();
        store_summary(&mut conn, "sess-1", "alpha", &summary("migrate schema", "indexes help"), None, 0)
            .unwrap();
        store_summary(&mut conn, "sess-2", "beta", &summary("migrate schema", "same in beta"), None, 0)
            .unwrap();
        store_summary(&mut conn, "sess-3", "alpha", &summary("write docs", "readme updated"), None, 0)
            .unwrap();

        let hits = search_full_text(&conn, "schema migrate", Some("alpha"), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.project, "alpha");

        let all = search_full_text(&conn, "schema", None, 10).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn search_falls_back_to_like() {
        let mut conn = test_db();
        store_summary(&mut conn, "sess-1", "alpha", &summary("preconfigure hooks", "ok"), None, 0)
            .unwrap();
        let hits = search_full_text(&conn, "configure", Some("alpha"), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, 0.0);
    }

    #[test]
    fn delete_removes_rows() {
        let mut conn = test_db();
        let a = store_summary(&mut conn, "sess-1", "alpha", &summary("a", "b"), None, 0).unwrap();
        assert_eq!(delete_by_ids(&conn, &[a.id]).unwrap(), 1);
        assert_eq!(count(&conn, "alpha").unwrap(), 0);
    }
}
