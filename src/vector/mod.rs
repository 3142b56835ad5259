//! Vector index client.
//!
//! Records are indexed granularly: one [`VectorDocument`] per narrative, fact or
//! summary field (see [`documents`]). Each stored vector is stamped with the
//! embedding model version so stale vectors can be found and re-embedded after
//! a model change instead of rebuilding the whole index.

pub mod documents;
pub mod sqlite;

pub use sqlite::SqliteVectorIndex;

use anyhow::Result;
use serde::Serialize;

/// A unit of indexed text.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorDocument {
    /// `{type}_{sourceID}_{field}[_{index}]`
    pub doc_id: String,
    pub content: String,
    pub metadata: DocumentMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentMetadata {
    pub source_id: i64,
    /// `observation`, `session_summary` or `user_prompt`.
    pub doc_type: String,
    /// Which field of the source record produced the text (`narrative`, `fact`, `learned`, ...).
    pub field_type: String,
    pub project: String,
    pub scope: Option<String>,
}

/// Exact-match metadata constraints applied before similarity ranking.
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub doc_type: Option<String>,
    pub project: Option<String>,
    /// With a project filter, also admit documents whose scope is `global`.
    pub include_global: bool,
}

/// A ranked query hit. `score` is cosine similarity (`1 - distance`).
#[derive(Debug, Clone, Serialize)]
pub struct VectorMatch {
    pub doc_id: String,
    pub score: f64,
    pub metadata: DocumentMetadata,
}

/// A document whose stored model version differs from the current one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaleVector {
    pub doc_id: String,
    pub source_id: i64,
    pub doc_type: String,
    pub field_type: String,
    pub project: String,
    pub scope: Option<String>,
}

/// Whether the index must be (partly) rebuilt, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildStatus {
    pub needed: bool,
    /// `"empty"`, `"model_mismatch:<N>"`, or empty when no rebuild is needed.
    pub reason: String,
}

impl RebuildStatus {
    pub fn not_needed() -> Self {
        Self {
            needed: false,
            reason: String::new(),
        }
    }

    pub fn needed(reason: impl Into<String>) -> Self {
        Self {
            needed: true,
            reason: reason.into(),
        }
    }
}

/// Storage port for the semantic index.
///
/// Methods are synchronous; async callers go through `spawn_blocking`.
pub trait VectorStore: Send + Sync {
    /// Embed and upsert documents. Empty input is a no-op.
    fn add_documents(&self, docs: &[VectorDocument]) -> Result<usize>;

    fn delete_documents(&self, doc_ids: &[String]) -> Result<usize>;

    /// Delete every document generated from the given source records, however
    /// many per-field documents each produced.
    fn delete_by_source_ids(&self, doc_type: &str, source_ids: &[i64]) -> Result<usize>;

    /// Nearest documents to `text`, best first.
    fn query(&self, text: &str, limit: usize, filter: &VectorFilter) -> Result<Vec<VectorMatch>>;

    fn count(&self) -> Result<usize>;

    /// Version of the embedding model currently in use.
    fn model_version(&self) -> &str;

    fn needs_rebuild(&self) -> Result<RebuildStatus>;

    fn stale_vectors(&self) -> Result<Vec<StaleVector>>;

    /// Re-embed every stale document with the current model. Returns how many were updated.
    fn reembed_stale(&self) -> Result<usize>;

    fn is_connected(&self) -> bool;
}

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_bytes_are_raw_f32() {
        let v = [1.0f32, -2.5];
        let bytes = embedding_to_bytes(&v);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &1.0f32.to_ne_bytes());
    }

    #[test]
    fn rebuild_status_constructors() {
        assert!(!RebuildStatus::not_needed().needed);
        assert_eq!(RebuildStatus::needed("empty").reason, "empty");
    }
}
