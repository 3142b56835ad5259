//! Text-to-vector embedding pipeline.
//!
//! Provides the [`EmbeddingProvider`] trait and a local implementation using
//! all-MiniLM-L6-v2 (384 dimensions, L2-normalized). The provider is created
//! via [`create_provider`] from configuration.

pub mod local;

use anyhow::Result;

/// Number of dimensions in the embedding vectors (all-MiniLM-L6-v2).
pub const EMBEDDING_DIM: usize = 384;

/// Trait for embedding text into vectors.
///
/// Implementations produce L2-normalized vectors of exactly [`EMBEDDING_DIM`] dimensions.
/// All methods are synchronous; callers in async contexts should use
/// `tokio::task::spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of text strings. Implementations may override for batched inference.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Return the number of dimensions this provider produces.
    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }

    /// Stable identifier of the underlying model. Changes only when the model does;
    /// vectors stamped with a different version are stale.
    fn version(&self) -> &str;
}

/// Create an embedding provider from config.
///
/// `"local"` loads ONNX Runtime + all-MiniLM-L6-v2 and fails if the model files
/// are missing (run `memento model download` first). `"none"` returns `None`:
/// semantic search is disabled and every query takes the structured path.
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> Result<Option<Box<dyn EmbeddingProvider>>> {
    match config.provider.as_str() {
        "local" => {
            let provider = local::LocalEmbeddingProvider::new(config)?;
            Ok(Some(Box::new(provider)))
        }
        "none" => Ok(None),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: local, none"),
    }
}
