//! sqlite-vec backed [`VectorStore`].
//!
//! Metadata lives in `vector_documents`, embeddings in the `vector_embeddings`
//! vec0 table, both keyed by document ID. Queries apply the metadata filter in
//! the join and rank the survivors by cosine distance.

use anyhow::{anyhow, Result};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    embedding_to_bytes, DocumentMetadata, RebuildStatus, StaleVector, VectorDocument, VectorFilter,
    VectorMatch, VectorStore,
};
use crate::embedding::EmbeddingProvider;
use crate::store::id_placeholders;

/// Texts embedded per inference call.
const EMBED_BATCH_SIZE: usize = 32;

pub struct SqliteVectorIndex {
    conn: Mutex<Connection>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl SqliteVectorIndex {
    /// Wrap a connection opened with [`crate::db::open_vector_database`].
    pub fn new(conn: Connection, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            conn: Mutex::new(conn),
            embedder,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("vector db lock poisoned: {e}"))
    }

    fn embed_all(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(EMBED_BATCH_SIZE) {
            embeddings.extend(self.embedder.embed_batch(chunk)?);
        }
        anyhow::ensure!(
            embeddings.len() == texts.len(),
            "embedder returned {} vectors for {} texts",
            embeddings.len(),
            texts.len()
        );
        Ok(embeddings)
    }

    fn doc_ids_for_sources(
        conn: &Connection,
        doc_type: &str,
        source_ids: &[i64],
    ) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT doc_id FROM vector_documents WHERE doc_type = ? AND source_id IN ({})",
            id_placeholders(source_ids.len())
        );
        let mut values = vec![Value::Text(doc_type.to_string())];
        values.extend(source_ids.iter().map(|id| Value::Integer(*id)));
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(values), |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn delete_ids(conn: &mut Connection, doc_ids: &[String]) -> Result<usize> {
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut meta = tx.prepare("DELETE FROM vector_documents WHERE doc_id = ?1")?;
            let mut embeddings = tx.prepare("DELETE FROM vector_embeddings WHERE doc_id = ?1")?;
            for id in doc_ids {
                deleted += meta.execute(params![id])?;
                embeddings.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }
}

impl VectorStore for SqliteVectorIndex {
    fn add_documents(&self, docs: &[VectorDocument]) -> Result<usize> {
        if docs.is_empty() {
            return Ok(0);
        }
        let texts: Vec<&str> = docs.iter().map(|d| d.content.as_str()).collect();
        let embeddings = self.embed_all(&texts)?;
        let version = self.embedder.version().to_string();
        let now_epoch = chrono::Utc::now().timestamp_millis();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut meta = tx.prepare(
                "INSERT OR REPLACE INTO vector_documents \
                 (doc_id, source_id, doc_type, field_type, project, scope, model_version, content, created_at_epoch) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            // vec0 has no upsert
            let mut clear = tx.prepare("DELETE FROM vector_embeddings WHERE doc_id = ?1")?;
            let mut insert =
                tx.prepare("INSERT INTO vector_embeddings (doc_id, embedding) VALUES (?1, ?2)")?;

            for (doc, embedding) in docs.iter().zip(&embeddings) {
                let m = &doc.metadata;
                meta.execute(params![
                    doc.doc_id,
                    m.source_id,
                    m.doc_type,
                    m.field_type,
                    m.project,
                    m.scope,
                    version,
                    doc.content,
                    now_epoch,
                ])?;
                clear.execute(params![doc.doc_id])?;
                insert.execute(params![doc.doc_id, embedding_to_bytes(embedding)])?;
            }
        }
        tx.commit()?;

        tracing::debug!(count = docs.len(), model = %version, "vector documents indexed");
        Ok(docs.len())
    }

    fn delete_documents(&self, doc_ids: &[String]) -> Result<usize> {
        if doc_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        Self::delete_ids(&mut conn, doc_ids)
    }

    fn delete_by_source_ids(&self, doc_type: &str, source_ids: &[i64]) -> Result<usize> {
        if source_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let doc_ids = Self::doc_ids_for_sources(&conn, doc_type, source_ids)?;
        let deleted = Self::delete_ids(&mut conn, &doc_ids)?;
        tracing::debug!(doc_type, sources = source_ids.len(), deleted, "vector group delete");
        Ok(deleted)
    }

    fn query(&self, text: &str, limit: usize, filter: &VectorFilter) -> Result<Vec<VectorMatch>> {
        if text.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let embedding = self.embedder.embed(text)?;

        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT d.doc_id, d.source_id, d.doc_type, d.field_type, d.project, d.scope, \
                    vec_distance_cosine(e.embedding, ?1) AS distance \
             FROM vector_documents d JOIN vector_embeddings e ON e.doc_id = d.doc_id \
             WHERE (?2 IS NULL OR d.doc_type = ?2) \
               AND (?3 IS NULL OR d.project = ?3 OR (?4 AND d.scope = 'global')) \
             ORDER BY distance ASC LIMIT ?5",
        )?;
        let matches = stmt
            .query_map(
                params![
                    embedding_to_bytes(&embedding),
                    filter.doc_type,
                    filter.project,
                    filter.include_global,
                    limit as i64,
                ],
                |row| {
                    let distance: f64 = row.get(6)?;
                    Ok(VectorMatch {
                        doc_id: row.get(0)?,
                        score: 1.0 - distance,
                        metadata: DocumentMetadata {
                            source_id: row.get(1)?,
                            doc_type: row.get(2)?,
                            field_type: row.get(3)?,
                            project: row.get(4)?,
                            scope: row.get(5)?,
                        },
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(matches)
    }

    fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM vector_documents", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    fn model_version(&self) -> &str {
        self.embedder.version()
    }

    fn needs_rebuild(&self) -> Result<RebuildStatus> {
        if self.count()? == 0 {
            return Ok(RebuildStatus::needed("empty"));
        }
        let conn = self.lock()?;
        let stale: i64 = conn.query_row(
            "SELECT COUNT(*) FROM vector_documents WHERE model_version != ?1",
            params![self.model_version()],
            |row| row.get(0),
        )?;
        if stale > 0 {
            return Ok(RebuildStatus::needed(format!("model_mismatch:{stale}")));
        }
        Ok(RebuildStatus::not_needed())
    }

    fn stale_vectors(&self) -> Result<Vec<StaleVector>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT doc_id, source_id, doc_type, field_type, project, scope \
             FROM vector_documents WHERE model_version != ?1 ORDER BY doc_id",
        )?;
        let stale = stmt
            .query_map(params![self.model_version()], |row| {
                Ok(StaleVector {
                    doc_id: row.get(0)?,
                    source_id: row.get(1)?,
                    doc_type: row.get(2)?,
                    field_type: row.get(3)?,
                    project: row.get(4)?,
                    scope: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stale)
    }

    fn reembed_stale(&self) -> Result<usize> {
        let stale: Vec<VectorDocument> = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT doc_id, content, source_id, doc_type, field_type, project, scope \
                 FROM vector_documents WHERE model_version != ?1",
            )?;
            let rows = stmt
                .query_map(params![self.model_version()], |row| {
                    Ok(VectorDocument {
                        doc_id: row.get(0)?,
                        content: row.get(1)?,
                        metadata: DocumentMetadata {
                            source_id: row.get(2)?,
                            doc_type: row.get(3)?,
                            field_type: row.get(4)?,
                            project: row.get(5)?,
                            scope: row.get(6)?,
                        },
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        if stale.is_empty() {
            return Ok(0);
        }
        tracing::info!(count = stale.len(), model = %self.model_version(), "re-embedding stale vectors");
        self.add_documents(&stale)
    }

    fn is_connected(&self) -> bool {
        match self.lock() {
            Ok(conn) => conn
                .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .optional()
                .map(|r| r.is_some())
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}
