//! Session identity anchor.
//!
//! Every write path upserts its owning session first, so a session row exists
//! before any observation, summary or prompt references its key.

use anyhow::{bail, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::now;
use super::types::{Session, SessionStatus};

const SESSION_COLUMNS: &str = "id, session_key, project, user_prompt, status, prompt_counter, \
     started_at, started_at_epoch, completed_at, completed_at_epoch";

/// Insert the session if absent; otherwise update its mutable fields. Returns the internal ID.
///
/// An empty `project` never overwrites an existing one, and a `None` prompt keeps
/// the previously recorded prompt text.
pub fn upsert_session(
    conn: &Connection,
    session_key: &str,
    project: &str,
    user_prompt: Option<&str>,
) -> Result<i64> {
    if session_key.is_empty() {
        bail!("session key must not be empty");
    }
    let (now, now_epoch) = now();
    let id = conn.query_row(
        "INSERT INTO sessions (session_key, project, user_prompt, status, started_at, started_at_epoch) \
         VALUES (?1, ?2, ?3, 'active', ?4, ?5) \
         ON CONFLICT(session_key) DO UPDATE SET \
             project = CASE WHEN excluded.project != '' THEN excluded.project ELSE sessions.project END, \
             user_prompt = COALESCE(excluded.user_prompt, sessions.user_prompt) \
         RETURNING id",
        params![session_key, project, user_prompt, now, now_epoch],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub fn get_session(conn: &Connection, session_key: &str) -> Result<Option<Session>> {
    let session = conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_key = ?1"),
            params![session_key],
            row_to_session,
        )
        .optional()?;
    Ok(session)
}

/// Mark a session finished. Returns `false` if the key is unknown.
pub fn complete_session(conn: &Connection, session_key: &str, status: SessionStatus) -> Result<bool> {
    let (now, now_epoch) = now();
    let rows = conn.execute(
        "UPDATE sessions SET status = ?1, completed_at = ?2, completed_at_epoch = ?3 \
         WHERE session_key = ?4",
        params![status.as_str(), now, now_epoch, session_key],
    )?;
    Ok(rows > 0)
}

/// Bump the prompt counter and return its new value.
pub fn increment_prompt_counter(conn: &Connection, session_key: &str) -> Result<i64> {
    let counter = conn
        .query_row(
            "UPDATE sessions SET prompt_counter = prompt_counter + 1 \
             WHERE session_key = ?1 RETURNING prompt_counter",
            params![session_key],
            |row| row.get(0),
        )
        .optional()?;
    match counter {
        Some(counter) => Ok(counter),
        None => bail!("session not found: {session_key}"),
    }
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get(4)?;
    Ok(Session {
        id: row.get(0)?,
        session_key: row.get(1)?,
        project: row.get(2)?,
        user_prompt: row.get(3)?,
        status: status.parse().unwrap_or(SessionStatus::Active),
        prompt_counter: row.get(5)?,
        started_at: row.get(6)?,
        started_at_epoch: row.get(7)?,
        completed_at: row.get(8)?,
        completed_at_epoch: row.get(9)?,
    })
}
