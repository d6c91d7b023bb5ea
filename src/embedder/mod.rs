//! Embedding backends used by the aligner.

pub mod hashed;
pub mod remote;

use std::sync::Arc;
use std::time::Duration;

use crate::error::PipelineError;
use crate::options::EmbedderChoice;

pub use hashed::HashedEmbedder;
pub use remote::{RemoteEmbedder, RemoteEmbedderConfig};

/// Maps text to a fixed-dimension L2-normalized vector.
///
/// Implementations are blocking (drive them through `spawn_blocking` from
/// async contexts) and must be deterministic for a given `id()`.
pub trait Embedder: Send + Sync + std::fmt::Debug {
    /// Stable backend identifier; equal ids imply equal vectors.
    fn id(&self) -> &str;

    /// Embeds a batch, returning vectors in input order.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, PipelineError>;
}

/// Cosine similarity of two vectors; zero when either is empty or all-zero.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Scales a vector to unit L2 norm in place; all-zero vectors stay zero.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Resolves the caller's backend choice against configured credentials.
///
/// `auto` prefers the remote backend when credentials are present and falls
/// back to the local model otherwise; an explicit `remote` without
/// credentials is an input error.
pub fn select_backend(
    choice: EmbedderChoice,
    remote: Option<RemoteEmbedderConfig>,
) -> Result<Arc<dyn Embedder>, PipelineError> {
    match (choice, remote) {
        (EmbedderChoice::Local, _) | (EmbedderChoice::Auto, None) => {
            Ok(Arc::new(HashedEmbedder::default()))
        }
        (EmbedderChoice::Auto, Some(config)) | (EmbedderChoice::Remote, Some(config)) => {
            Ok(Arc::new(RemoteEmbedder::new(config)?))
        }
        (EmbedderChoice::Remote, None) => Err(PipelineError::InvalidInput(
            "remote embedder requested but no credentials configured".into(),
        )),
    }
}

/// Builds the remote configuration from `UCC_REMOTE_*` environment
/// variables; `None` when no API key is set.
pub fn remote_config_from_env() -> Option<RemoteEmbedderConfig> {
    let api_key = std::env::var("UCC_REMOTE_API_KEY").ok()?;
    if api_key.trim().is_empty() {
        return None;
    }
    Some(RemoteEmbedderConfig {
        api_key,
        base_url: std::env::var("UCC_REMOTE_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
        model: std::env::var("UCC_REMOTE_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
        dimensions: None,
        timeout: Duration::from_secs(30),
        max_retries: 3,
        batch_size: 64,
    })
}
