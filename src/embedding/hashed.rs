//! Deterministic feature-hashing embeddings.
//!
//! Each lowercased alphanumeric token is hashed with SHA-256; the first bytes
//! pick a dimension and a sign. Unigrams and adjacent bigrams both contribute,
//! so texts sharing vocabulary land close together. No model files, identical
//! output on every machine.

use anyhow::Result;
use sha2::{Digest, Sha256};

use super::{l2_normalize, EmbeddingProvider, EMBEDDING_DIM};

const BIGRAM_WEIGHT: f32 = 0.5;

#[derive(Debug, Default, Clone, Copy)]
pub struct HashedEmbeddingProvider;

impl HashedEmbeddingProvider {
    pub fn new() -> Self {
        Self
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn accumulate(v: &mut [f32], feature: &str, weight: f32) {
    let digest = Sha256::digest(feature.as_bytes());
    let index = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
        % EMBEDDING_DIM;
    let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
    v[index] += sign * weight;
}

impl EmbeddingProvider for HashedEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        let toks = tokens(text);
        for tok in &toks {
            accumulate(&mut v, tok, 1.0);
        }
        for pair in toks.windows(2) {
            accumulate(&mut v, &format!("{} {}", pair[0], pair[1]), BIGRAM_WEIGHT);
        }
        Ok(l2_normalize(&v))
    }

    fn model_id(&self) -> String {
        format!("hashed-{EMBEDDING_DIM}")
    }
}
