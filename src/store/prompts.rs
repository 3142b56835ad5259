//! User prompts, keyed by (session, prompt number).

use anyhow::Result;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use std::time::Instant;

use super::eviction::evict_beyond;
use super::keywords::{extract_keywords, fts_match_expression, like_clause};
use super::sessions::upsert_session;
use super::types::{OrderBy, RetentionScope, StoredRecord, UserPrompt};
use super::{id_placeholders, now};
use crate::rrf;

const PROMPT_COLUMNS: &str = "p.id, p.session_key, p.project, p.prompt_number, p.prompt_text, \
     p.matched_observations, p.created_at, p.created_at_epoch, p.token_count";

/// Record a prompt. Re-saving the same (session, number) replaces its text.
///
/// The owning session is upserted with this prompt as its latest `user_prompt`,
/// and its prompt counter is raised to at least `prompt_number`.
pub fn save_prompt(
    conn: &mut Connection,
    session_key: &str,
    project: &str,
    prompt_number: i64,
    prompt_text: &str,
    token_count: i64,
) -> Result<StoredRecord> {
    let tx = conn.transaction()?;
    upsert_session(&tx, session_key, project, Some(prompt_text))?;

    let (now, now_epoch) = now();
    let (id, created_at_epoch) = tx.query_row(
        "INSERT INTO user_prompts (session_key, project, prompt_number, prompt_text, token_count, \
         created_at, created_at_epoch) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         ON CONFLICT(session_key, prompt_number) DO UPDATE SET prompt_text = excluded.prompt_text, \
         token_count = excluded.token_count \
         RETURNING id, created_at_epoch",
        params![session_key, project, prompt_number, prompt_text, token_count, now, now_epoch],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    tx.execute(
        "UPDATE sessions SET prompt_counter = MAX(prompt_counter, ?1) WHERE session_key = ?2",
        params![prompt_number, session_key],
    )?;
    tx.commit()?;

    Ok(StoredRecord {
        id,
        created_at_epoch,
    })
}

pub fn get_by_ids(
    conn: &Connection,
    ids: &[i64],
    order_by: OrderBy,
    limit: Option<usize>,
) -> Result<Vec<UserPrompt>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let order = match order_by {
        OrderBy::DateAsc => "p.created_at_epoch ASC, p.id ASC",
        _ => "p.created_at_epoch DESC, p.id DESC",
    };
    let mut sql = format!(
        "SELECT {PROMPT_COLUMNS} FROM user_prompts p WHERE p.id IN ({}) ORDER BY {order}",
        id_placeholders(ids.len()),
    );
    if let Some(n) = limit {
        sql.push_str(&format!(" LIMIT {n}"));
    }
    query_prompts(conn, &sql, params_from_iter(ids))
}

/// Up to `limit` prompts of `project` (or of every project). `Default` ordering is newest first.
pub fn list(
    conn: &Connection,
    project: Option<&str>,
    order_by: OrderBy,
    limit: usize,
) -> Result<Vec<UserPrompt>> {
    let order = match order_by {
        OrderBy::DateAsc => "p.created_at_epoch ASC, p.id ASC",
        _ => "p.created_at_epoch DESC, p.id DESC",
    };
    let sql = format!(
        "SELECT {PROMPT_COLUMNS} FROM user_prompts p \
         WHERE (?1 IS NULL OR p.project = ?1) ORDER BY {order} LIMIT ?2"
    );
    query_prompts(conn, &sql, params![project, limit as i64])
}

pub fn get_recent(conn: &Connection, project: &str, limit: usize) -> Result<Vec<UserPrompt>> {
    list(conn, Some(project), OrderBy::DateDesc, limit)
}

/// Most recent prompts across every project.
pub fn get_all_recent(conn: &Connection, limit: usize) -> Result<Vec<UserPrompt>> {
    list(conn, None, OrderBy::DateDesc, limit)
}

pub fn search_full_text(
    conn: &Connection,
    query: &str,
    project: Option<&str>,
    limit: usize,
) -> Result<Vec<(UserPrompt, f64)>> {
    let keywords = extract_keywords(query);
    if keywords.is_empty() {
        return Ok(Vec::new());
    }
    let project_value = project.map_or(Value::Null, |p| Value::Text(p.to_string()));

    let fts_sql = format!(
        "SELECT {PROMPT_COLUMNS}, bm25(user_prompts_fts) AS rank \
         FROM user_prompts_fts JOIN user_prompts p ON p.id = user_prompts_fts.rowid \
         WHERE user_prompts_fts MATCH ?2 AND (?1 IS NULL OR p.project = ?1) \
         ORDER BY rank LIMIT ?3"
    );
    let fts = conn.prepare(&fts_sql).and_then(|mut stmt| {
        let hits = stmt
            .query_map(
                params![project_value, fts_match_expression(&keywords), limit as i64],
                |row| {
                    let rank: f64 = row.get(9)?;
                    Ok((row_to_prompt(row)?, rrf::normalize(rank)))
                },
            )?
            .collect::<Result<Vec<_>, _>>();
        hits
    });
    match fts {
        Ok(hits) if !hits.is_empty() => return Ok(hits),
        Ok(_) => tracing::debug!(?keywords, "no prompt FTS matches, trying LIKE fallback"),
        Err(e) => tracing::warn!(error = %e, "prompt FTS failed, using LIKE fallback"),
    }

    let (clause, like_params) = like_clause(&keywords, &["p.prompt_text"], 3);
    let mut values = vec![project_value, Value::Integer(limit as i64)];
    values.extend(like_params);
    let sql = format!(
        "SELECT {PROMPT_COLUMNS} FROM user_prompts p \
         WHERE {clause} AND (?1 IS NULL OR p.project = ?1) \
         ORDER BY p.created_at_epoch DESC, p.id DESC LIMIT ?2"
    );
    let rows = query_prompts(conn, &sql, params_from_iter(values))?;
    Ok(rows.into_iter().map(|p| (p, 0.0)).collect())
}

/// Record how many observations a prompt's context injection matched.
pub fn update_matched_count(conn: &Connection, id: i64, matched: i64) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE user_prompts SET matched_observations = ?1 WHERE id = ?2",
        params![matched, id],
    )?;
    Ok(rows > 0)
}

pub fn delete_by_ids(conn: &Connection, ids: &[i64]) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "DELETE FROM user_prompts WHERE id IN ({})",
        id_placeholders(ids.len())
    );
    Ok(conn.execute(&sql, params_from_iter(ids))?)
}

pub fn count(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM user_prompts", [], |row| row.get(0))?;
    Ok(n as usize)
}

/// Keep the newest `keep` prompts of the pool; delete the rest.
pub fn cleanup_old(
    conn: &mut Connection,
    scope: &RetentionScope,
    keep: usize,
    deadline: Option<Instant>,
) -> Result<Vec<i64>> {
    match scope {
        RetentionScope::Global => evict_beyond(conn, "user_prompts", "1 = 1", &[], keep, deadline),
        RetentionScope::Project(project) => {
            evict_beyond(conn, "user_prompts", "project = ?1", &[project], keep, deadline)
        }
    }
}

fn query_prompts<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<UserPrompt>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, row_to_prompt)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn row_to_prompt(row: &Row<'_>) -> rusqlite::Result<UserPrompt> {
    Ok(UserPrompt {
        id: row.get(0)?,
        session_key: row.get(1)?,
        project: row.get(2)?,
        prompt_number: row.get(3)?,
        prompt_text: row.get(4)?,
        matched_observations: row.get(5)?,
        created_at: row.get(6)?,
        created_at_epoch: row.get(7)?,
        token_count: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sessions::get_session;

    fn test_db() -> Connection {
        crate::db::open_memory_database().unwrap()
    }

    #[test]
    fn save_updates_session() {
        let mut conn = test_db();
        save_prompt(&mut conn, "sess-1", "alpha", 1, "fix the flaky test", 0).unwrap();
        save_prompt(&mut conn, "sess-1", "alpha", 3, "now add logging", 0).unwrap();

        let session = get_session(&conn, "sess-1").unwrap().unwrap();
        assert_eq!(session.user_prompt.as_deref(), Some("now add logging"));
        assert_eq!(session.prompt_counter, 3);
    }

    #[test]
    fn resave_same_number_replaces_text() {
        let mut conn = test_db();
        let first = save_prompt(&mut conn, "sess-1", "alpha", 1, "draft", 12).unwrap();
        let second = save_prompt(&mut conn, "sess-1", "alpha", 1, "final wording", 40).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(count(&conn).unwrap(), 1);

        let fetched = get_by_ids(&conn, &[first.id], OrderBy::Default, None).unwrap();
        assert_eq!(fetched[0].prompt_text, "final wording");
        assert_eq!(fetched[0].token_count, 40);
    }

    #[test]
    fn search_finds_prompt_text() {
        let mut conn = test_db();
        save_prompt(&mut conn, "sess-1", "alpha", 1, "optimize the tokenizer cache", 0).unwrap();
        save_prompt(&mut conn, "sess-1", "alpha", 2, "write release notes", 0).unwrap();
        save_prompt(&mut conn, "sess-2", "beta", 1, "tokenizer in beta", 0).unwrap();

        let hits = search_full_text(&conn, "tokenizer", Some("alpha"), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.prompt_number, 1);
    }

    #[test]
    fn matched_count_updates() {
        let mut conn = test_db();
        let p = save_prompt(&mut conn, "sess-1", "alpha", 1, "anything", 0).unwrap();
        assert!(update_matched_count(&conn, p.id, 7).unwrap());
        assert!(!update_matched_count(&conn, 9999, 7).unwrap());
        let fetched = get_by_ids(&conn, &[p.id], OrderBy::Default, None).unwrap();
        assert_eq!(fetched[0].matched_observations, 7);
    }

    #[test]
    fn cleanup_keeps_newest_globally() {
        let mut conn = test_db();
        let mut ids = Vec::new();
        for i in 0..12 {
            let project = if i % 2 == 0 { "alpha" } else { "beta" };
            let p = save_prompt(&mut conn, &format!("sess-{project}"), project, i, "prompt", 0).unwrap();
            conn.execute(
                "UPDATE user_prompts SET created_at_epoch = ?1 WHERE id = ?2",
                params![100 + i, p.id],
            )
            .unwrap();
            ids.push(p.id);
        }

        let evicted = cleanup_old(&mut conn, &RetentionScope::Global, 10, None).unwrap();
        assert_eq!(evicted, ids[..2].to_vec());
        assert_eq!(count(&conn).unwrap(), 10);
        assert!(cleanup_old(&mut conn, &RetentionScope::Global, 10, None).unwrap().is_empty());
    }
}
