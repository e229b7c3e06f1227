//! Text-to-vector embedding pipeline.
//!
//! Provides the [`EmbeddingProvider`] trait plus two implementations: a
//! deterministic feature-hashing provider that needs no model files, and a local
//! ONNX provider using all-MiniLM-L6-v2. Both produce 384-dimension,
//! L2-normalized vectors. The provider is created via [`create_provider`];
//! `provider = "none"` disables the vector index entirely.

pub mod hashed;
pub mod local;

use anyhow::Result;

/// Number of dimensions in the embedding vectors (matches `chunks_vec`).
pub const EMBEDDING_DIM: usize = 384;

/// Trait for embedding text into vectors.
///
/// Implementations produce L2-normalized vectors of exactly [`EMBEDDING_DIM`] dimensions.
/// All methods are synchronous, so callers in async contexts should use
/// `tokio::task::spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of text strings. Implementations may override for batched inference.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Identifier recorded in `schema_meta` so a provider switch can be detected.
    fn model_id(&self) -> String;
}

/// Create an embedding provider from config. `None` means vectors are disabled.
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> Result<Option<Box<dyn EmbeddingProvider>>> {
    match config.provider.as_str() {
        "hashed" => Ok(Some(Box::new(hashed::HashedEmbeddingProvider::new()))),
        "local" => {
            let provider = local::LocalEmbeddingProvider::new(config)?;
            Ok(Some(Box::new(provider)))
        }
        "none" => Ok(None),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: hashed, local, none"),
    }
}

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            std::mem::size_of_val(embedding),
        )
    }
}

/// Convert an L2 distance between unit vectors to cosine similarity.
///
/// For unit vectors, `L2² = 2 - 2·cos`, so `cos = 1 - L2²/2`.
pub fn l2_to_cosine(distance: f64) -> f64 {
    (1.0 - distance * distance / 2.0).clamp(-1.0, 1.0)
}

/// L2-normalize a vector. Returns a zero vector if the input norm is zero.
pub(crate) fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}
