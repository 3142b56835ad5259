//! SQL DDL for the record store and the vector index.
//!
//! The record store holds `sessions`, `observations`, `session_summaries` and
//! `user_prompts`, each text-bearing table mirrored into an FTS5 external-content
//! table kept in sync by triggers (so eviction deletes never leave stale index
//! rows). The vector index lives in its own database: `vector_documents` for
//! metadata and a `vec0` table for embeddings. All DDL uses `IF NOT EXISTS`.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_key TEXT NOT NULL UNIQUE,
    project TEXT NOT NULL,
    user_prompt TEXT,
    status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active','completed','failed')),
    prompt_counter INTEGER NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL,
    started_at_epoch INTEGER NOT NULL,
    completed_at TEXT,
    completed_at_epoch INTEGER
);

CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project);

CREATE TABLE IF NOT EXISTS observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_key TEXT NOT NULL REFERENCES sessions(session_key) ON DELETE CASCADE,
    project TEXT NOT NULL,
    scope TEXT NOT NULL DEFAULT 'project' CHECK(scope IN ('project','global')),
    type TEXT NOT NULL CHECK(type IN ('decision','bugfix','feature','refactor','discovery','change')),
    title TEXT,
    subtitle TEXT,
    narrative TEXT,
    facts TEXT NOT NULL DEFAULT '[]',
    concepts TEXT NOT NULL DEFAULT '[]',
    files_read TEXT NOT NULL DEFAULT '[]',
    files_modified TEXT NOT NULL DEFAULT '[]',
    file_mtimes TEXT NOT NULL DEFAULT '{}',
    prompt_number INTEGER,
    discovery_tokens INTEGER NOT NULL DEFAULT 0,
    importance REAL NOT NULL DEFAULT 1.0,
    retrieval_count INTEGER NOT NULL DEFAULT 0,
    last_retrieved_at_epoch INTEGER,
    superseded INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    created_at_epoch INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_observations_project ON observations(project);
CREATE INDEX IF NOT EXISTS idx_observations_scope ON observations(scope);
CREATE INDEX IF NOT EXISTS idx_observations_created ON observations(created_at_epoch);

CREATE VIRTUAL TABLE IF NOT EXISTS observations_fts USING fts5(
    title,
    subtitle,
    narrative,
    content='observations',
    content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS observations_ai AFTER INSERT ON observations BEGIN
    INSERT INTO observations_fts(rowid, title, subtitle, narrative)
    VALUES (new.id, new.title, new.subtitle, new.narrative);
END;
CREATE TRIGGER IF NOT EXISTS observations_ad AFTER DELETE ON observations BEGIN
    INSERT INTO observations_fts(observations_fts, rowid, title, subtitle, narrative)
    VALUES ('delete', old.id, old.title, old.subtitle, old.narrative);
END;
CREATE TRIGGER IF NOT EXISTS observations_au AFTER UPDATE OF title, subtitle, narrative ON observations BEGIN
    INSERT INTO observations_fts(observations_fts, rowid, title, subtitle, narrative)
    VALUES ('delete', old.id, old.title, old.subtitle, old.narrative);
    INSERT INTO observations_fts(rowid, title, subtitle, narrative)
    VALUES (new.id, new.title, new.subtitle, new.narrative);
END;

CREATE TABLE IF NOT EXISTS session_summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_key TEXT NOT NULL REFERENCES sessions(session_key) ON DELETE CASCADE,
    project TEXT NOT NULL,
    request TEXT,
    investigated TEXT,
    learned TEXT,
    completed TEXT,
    next_steps TEXT,
    notes TEXT,
    prompt_number INTEGER,
    discovery_tokens INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    created_at_epoch INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_summaries_project ON session_summaries(project);
CREATE INDEX IF NOT EXISTS idx_summaries_created ON session_summaries(created_at_epoch);

CREATE VIRTUAL TABLE IF NOT EXISTS session_summaries_fts USING fts5(
    request,
    investigated,
    learned,
    completed,
    next_steps,
    notes,
    content='session_summaries',
    content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS session_summaries_ai AFTER INSERT ON session_summaries BEGIN
    INSERT INTO session_summaries_fts(rowid, request, investigated, learned, completed, next_steps, notes)
    VALUES (new.id, new.request, new.investigated, new.learned, new.completed, new.next_steps, new.notes);
END;
CREATE TRIGGER IF NOT EXISTS session_summaries_ad AFTER DELETE ON session_summaries BEGIN
    INSERT INTO session_summaries_fts(session_summaries_fts, rowid, request, investigated, learned, completed, next_steps, notes)
    VALUES ('delete', old.id, old.request, old.investigated, old.learned, old.completed, old.next_steps, old.notes);
END;

CREATE TABLE IF NOT EXISTS user_prompts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_key TEXT NOT NULL REFERENCES sessions(session_key) ON DELETE CASCADE,
    project TEXT NOT NULL,
    prompt_number INTEGER NOT NULL,
    prompt_text TEXT NOT NULL,
    matched_observations INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    created_at_epoch INTEGER NOT NULL,
    UNIQUE(session_key, prompt_number)
);

CREATE INDEX IF NOT EXISTS idx_prompts_created ON user_prompts(created_at_epoch);

CREATE VIRTUAL TABLE IF NOT EXISTS user_prompts_fts USING fts5(
    prompt_text,
    content='user_prompts',
    content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS user_prompts_ai AFTER INSERT ON user_prompts BEGIN
    INSERT INTO user_prompts_fts(rowid, prompt_text) VALUES (new.id, new.prompt_text);
END;
CREATE TRIGGER IF NOT EXISTS user_prompts_ad AFTER DELETE ON user_prompts BEGIN
    INSERT INTO user_prompts_fts(user_prompts_fts, rowid, prompt_text)
    VALUES ('delete', old.id, old.prompt_text);
END;
CREATE TRIGGER IF NOT EXISTS user_prompts_au AFTER UPDATE OF prompt_text ON user_prompts BEGIN
    INSERT INTO user_prompts_fts(user_prompts_fts, rowid, prompt_text)
    VALUES ('delete', old.id, old.prompt_text);
    INSERT INTO user_prompts_fts(rowid, prompt_text) VALUES (new.id, new.prompt_text);
END;

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Per-document metadata for the vector index. Embeddings live in `vector_embeddings`.
const VECTOR_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS vector_documents (
    doc_id TEXT PRIMARY KEY,
    source_id INTEGER NOT NULL,
    doc_type TEXT NOT NULL,
    field_type TEXT NOT NULL,
    project TEXT NOT NULL,
    scope TEXT,
    model_version TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at_epoch INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_vector_documents_source ON vector_documents(doc_type, source_id);
CREATE INDEX IF NOT EXISTS idx_vector_documents_model ON vector_documents(model_version);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax).
const VEC_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS vector_embeddings USING vec0(
    doc_id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);
"#;

/// Initialize the record store tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

/// Initialize the vector index tables. Idempotent.
pub fn init_vector_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(VECTOR_SCHEMA_SQL)?;
    conn.execute_batch(VEC_TABLE_SQL)?;
    Ok(())
}
