//! Local sentence embedder on ONNX Runtime.
//!
//! Loads a MiniLM-style export (`model.onnx` + `tokenizer.json`) from the model
//! cache. The provider's version is the configured model name plus a content
//! hash of both files, so swapping the files on disk marks every stored vector
//! stale even when the configured name stays the same.

use std::fmt::Write as _;
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use ort::session::Session;
use ort::value::Tensor;
use sha2::Digest as _;
use tokenizers::Tokenizer;

use super::{EmbeddingProvider, EMBEDDING_DIM};
use crate::config::EmbeddingConfig;

/// Token budget per text; longer inputs are truncated.
const MAX_SEQ_LEN: usize = 256;

/// Hex characters of the content hash kept in the version string.
const FINGERPRINT_LEN: usize = 12;

/// The two files a local model needs, resolved inside the cache directory.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub model: PathBuf,
    pub tokenizer: PathBuf,
}

impl ModelFiles {
    pub fn locate(cache_dir: &Path) -> Result<Self> {
        let files = Self {
            model: cache_dir.join("model.onnx"),
            tokenizer: cache_dir.join("tokenizer.json"),
        };
        for path in [&files.model, &files.tokenizer] {
            anyhow::ensure!(
                path.exists(),
                "{} not found. Run `memento model download` first.",
                path.display()
            );
        }
        Ok(files)
    }

    /// Short SHA-256 over the model and tokenizer bytes.
    pub fn fingerprint(&self) -> Result<String> {
        let mut hasher = sha2::Sha256::new();
        for path in [&self.model, &self.tokenizer] {
            let file = std::fs::File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            let mut reader = std::io::BufReader::new(file);
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }

        let mut out = String::with_capacity(FINGERPRINT_LEN);
        for b in hasher.finalize().iter().take(FINGERPRINT_LEN / 2) {
            let _ = write!(&mut out, "{b:02x}");
        }
        Ok(out)
    }
}

/// Token ids and attention mask for one padded batch, row-major.
struct EncodedBatch {
    rows: usize,
    seq_len: usize,
    input_ids: Vec<i64>,
    attention_mask: Vec<i64>,
}

pub struct LocalEmbeddingProvider {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    version: String,
}

// The session is only touched through its Mutex.
unsafe impl Send for LocalEmbeddingProvider {}
unsafe impl Sync for LocalEmbeddingProvider {}

impl LocalEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let files = ModelFiles::locate(&crate::config::expand_tilde(&config.cache_dir))?;
        let version = format!("{}@{}", config.model, files.fingerprint()?);

        let session = Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&files.model)
            .context("failed to load ONNX model")?;

        let mut tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("failed to load tokenizer: {e}"))?;
        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: MAX_SEQ_LEN,
                ..Default::default()
            }))
            .map_err(|e| anyhow!("failed to set truncation: {e}"))?;
        tokenizer.with_padding(Some(tokenizers::PaddingParams {
            strategy: tokenizers::PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        tracing::info!(model = %files.model.display(), %version, "local embedder ready");

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            version,
        })
    }

    fn encode(&self, texts: &[&str]) -> Result<EncodedBatch> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow!("tokenization failed: {e}"))?;
        let seq_len = encodings.first().map_or(0, |e| e.get_ids().len());

        let mut batch = EncodedBatch {
            rows: encodings.len(),
            seq_len,
            input_ids: Vec::with_capacity(encodings.len() * seq_len),
            attention_mask: Vec::with_capacity(encodings.len() * seq_len),
        };
        for encoding in &encodings {
            batch.input_ids.extend(encoding.get_ids().iter().map(|&id| id as i64));
            batch
                .attention_mask
                .extend(encoding.get_attention_mask().iter().map(|&m| m as i64));
        }
        Ok(batch)
    }

    /// Run the model and return `(dims, hidden states)` for the batch.
    fn infer(&self, batch: &EncodedBatch) -> Result<(Vec<i64>, Vec<f32>)> {
        let shape = vec![batch.rows as i64, batch.seq_len as i64];
        let input_ids = Tensor::from_array((shape.clone(), batch.input_ids.clone().into_boxed_slice()))?;
        let attention_mask =
            Tensor::from_array((shape.clone(), batch.attention_mask.clone().into_boxed_slice()))?;
        let token_type_ids = Tensor::from_array((
            shape,
            vec![0i64; batch.rows * batch.seq_len].into_boxed_slice(),
        ))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow!("session lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs! {
            "input_ids" => input_ids,
            "attention_mask" => attention_mask,
            "token_type_ids" => token_type_ids,
        })?;

        // Exports disagree on the output name.
        let hidden = outputs
            .get("token_embeddings")
            .or_else(|| outputs.get("last_hidden_state"))
            .unwrap_or_else(|| &outputs[0]);
        let (dims, data) = hidden
            .try_extract_tensor::<f32>()
            .context("failed to read hidden states")?;
        Ok((dims.to_vec(), data.to_vec()))
    }
}

impl EmbeddingProvider for LocalEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("embedding batch returned no vectors"))
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let batch = self.encode(texts)?;
        let (dims, hidden) = self.infer(&batch)?;
        mean_pool(&dims, &hidden, &batch.attention_mask, batch.seq_len)
    }
}

/// Masked mean over the token axis of `[rows, seq, EMBEDDING_DIM]` hidden
/// states, L2-normalized per row. `mask` is laid out as `[rows, mask_seq_len]`.
fn mean_pool(dims: &[i64], hidden: &[f32], mask: &[i64], mask_seq_len: usize) -> Result<Vec<Vec<f32>>> {
    anyhow::ensure!(
        dims.len() == 3 && dims[2] == EMBEDDING_DIM as i64,
        "unexpected hidden state shape {dims:?}, expected [batch, seq, {EMBEDDING_DIM}]"
    );
    let (rows, seq_len, width) = (dims[0] as usize, dims[1] as usize, dims[2] as usize);
    anyhow::ensure!(
        hidden.len() == rows * seq_len * width,
        "hidden state buffer has {} values, shape says {}",
        hidden.len(),
        rows * seq_len * width
    );

    let mut pooled = Vec::with_capacity(rows);
    for row in 0..rows {
        let mut sum = vec![0.0f32; width];
        let mut weight = 0.0f32;
        for token in 0..seq_len.min(mask_seq_len) {
            if mask[row * mask_seq_len + token] == 0 {
                continue;
            }
            let offset = (row * seq_len + token) * width;
            for (acc, value) in sum.iter_mut().zip(&hidden[offset..offset + width]) {
                *acc += value;
            }
            weight += 1.0;
        }
        if weight > 0.0 {
            sum.iter_mut().for_each(|v| *v /= weight);
        }
        pooled.push(l2_normalize(sum));
    }
    Ok(pooled)
}

fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_model_files(dir: &Path, model: &[u8]) -> ModelFiles {
        std::fs::write(dir.join("model.onnx"), model).unwrap();
        std::fs::write(dir.join("tokenizer.json"), b"{}").unwrap();
        ModelFiles::locate(dir).unwrap()
    }

    #[test]
    fn locate_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelFiles::locate(dir.path()).unwrap_err();
        assert!(err.to_string().contains("model.onnx"));
        assert!(err.to_string().contains("memento model download"));
    }

    #[test]
    fn fingerprint_follows_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let files = write_model_files(dir.path(), b"weights-v1");
        let first = files.fingerprint().unwrap();
        assert_eq!(first.len(), FINGERPRINT_LEN);
        assert_eq!(first, files.fingerprint().unwrap());

        let files = write_model_files(dir.path(), b"weights-v2");
        assert_ne!(first, files.fingerprint().unwrap());
    }

    #[test]
    fn mean_pool_ignores_padding() {
        // Two rows, two tokens; the second row's second token is padding.
        let mut hidden = vec![0.0f32; 2 * 2 * EMBEDDING_DIM];
        hidden[0] = 1.0;
        hidden[EMBEDDING_DIM + 1] = 1.0;
        hidden[2 * EMBEDDING_DIM] = 3.0;
        hidden[3 * EMBEDDING_DIM + 5] = 100.0;
        let dims = [2, 2, EMBEDDING_DIM as i64];
        let mask = [1, 1, 1, 0];

        let pooled = mean_pool(&dims, &hidden, &mask, 2).unwrap();
        assert_eq!(pooled.len(), 2);
        let s = std::f32::consts::FRAC_1_SQRT_2;
        assert!((pooled[0][0] - s).abs() < 1e-6);
        assert!((pooled[0][1] - s).abs() < 1e-6);
        assert!((pooled[1][0] - 1.0).abs() < 1e-6);
        assert_eq!(pooled[1][5], 0.0);
    }

    #[test]
    fn mean_pool_rejects_wrong_width() {
        let err = mean_pool(&[1, 1, 8], &[0.0; 8], &[1], 1).unwrap_err();
        assert!(err.to_string().contains("unexpected hidden state shape"));
    }

    #[test]
    fn l2_normalize_keeps_zero_vector() {
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
        let unit = l2_normalize(vec![3.0, 4.0]);
        assert!((unit[0] - 0.6).abs() < 1e-6 && (unit[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    #[ignore] // needs downloaded model files
    fn embeds_normalized_vectors() {
        let config = EmbeddingConfig::default();
        let provider = LocalEmbeddingProvider::new(&config).unwrap();
        assert!(provider.version().starts_with("all-MiniLM-L6-v2@"));

        let vectors = provider.embed_batch(&["first sentence", "a second, longer sentence"]).unwrap();
        for v in &vectors {
            assert_eq!(v.len(), EMBEDDING_DIM);
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
        }
        assert_eq!(provider.embed("first sentence").unwrap(), vectors[0]);
    }
}
