//! Local deterministic feature-hashing embedder.

use crate::error::PipelineError;

use super::{l2_normalize, Embedder};

/// Default vector width.
const DEFAULT_DIM: usize = 256;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Dependency-free embedding backend hashing word uni- and bigrams into a
/// fixed-width signed feature vector.
///
/// Vectors are deterministic for a given dimension, which keeps alignment
/// reproducible without any model files or network access.
#[derive(Debug, Clone)]
pub struct HashedEmbedder {
    dim: usize,
    id: String,
}

impl HashedEmbedder {
    /// Builds an embedder with the given vector width.
    pub fn new(dim: usize) -> Self {
        let dim = dim.max(8);
        Self {
            id: format!("hashed-{dim}"),
            dim,
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        let tokens: Vec<String> = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        for token in &tokens {
            bump(&mut vector, fnv1a(token.as_bytes()));
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            bump(&mut vector, fnv1a(bigram.as_bytes()));
        }

        l2_normalize(&mut vector);
        vector
    }
}

impl Default for HashedEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIM)
    }
}

impl Embedder for HashedEmbedder {
    fn id(&self) -> &str {
        &self.id
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, PipelineError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

/// Adds a signed unit contribution at the hashed slot; the top hash bit
/// carries the sign so collisions partially cancel instead of piling up.
fn bump(vector: &mut [f32], hash: u64) {
    let slot = (hash % vector.len() as u64) as usize;
    let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
    vector[slot] += sign;
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::cosine;

    #[test]
    fn deterministic_across_calls() {
        let embedder = HashedEmbedder::default();
        let a = embedder.embed_batch(&["we will pay for theft"]).unwrap();
        let b = embedder.embed_batch(&["we will pay for theft"]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn identical_text_has_unit_similarity() {
        let embedder = HashedEmbedder::default();
        let vectors = embedder
            .embed_batch(&["flood damage is covered", "flood damage is covered"])
            .unwrap();
        assert!((cosine(&vectors[0], &vectors[1]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn related_text_scores_above_unrelated() {
        let embedder = HashedEmbedder::default();
        let vectors = embedder
            .embed_batch(&[
                "we will pay for theft of contents",
                "we will pay for theft of stock and contents",
                "premiums are payable annually in advance",
            ])
            .unwrap();
        let related = cosine(&vectors[0], &vectors[1]);
        let unrelated = cosine(&vectors[0], &vectors[2]);
        assert!(related > unrelated);
    }

    #[test]
    fn batch_preserves_input_order() {
        let embedder = HashedEmbedder::default();
        let batch = embedder.embed_batch(&["alpha", "beta"]).unwrap();
        let alpha = embedder.embed_batch(&["alpha"]).unwrap();
        assert_eq!(batch[0], alpha[0]);
    }
}
