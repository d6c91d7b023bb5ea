//! Comparison tuning knobs shared by the sync endpoint, jobs and the CLI.

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Default cut-off above which two clauses are considered the same provision.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.72;
/// Default number of candidate partners kept per clause before matching.
pub const DEFAULT_MAX_CANDIDATES: usize = 2;
/// Pairs below this similarity are treated as unrelated clauses.
pub const LOW_CONFIDENCE_FLOOR: f64 = 0.55;
/// Similarity within this distance of 1.0 marks a pair as unchanged.
pub const UNCHANGED_EPSILON: f64 = 1e-4;

/// Embedding backend requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderChoice {
    /// Remote when credentials are configured, local otherwise.
    Auto,
    /// In-process deterministic feature-hashing model.
    Local,
    /// OpenAI-compatible embeddings API.
    Remote,
}

impl std::str::FromStr for EmbedderChoice {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(PipelineError::InvalidInput(format!(
                "unknown embedder {other:?} (expected auto, local or remote)"
            ))),
        }
    }
}

/// Per-comparison options accepted on submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompareOptions {
    /// Embedding backend selection.
    pub embedder: EmbedderChoice,
    /// Minimum composite similarity for a confident match.
    pub similarity_threshold: f64,
    /// Whether modified matches carry their token diff.
    pub return_token_diffs: bool,
    /// Candidate partners considered per clause, in `[1, 10]`.
    pub max_candidates_per_clause: usize,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            embedder: EmbedderChoice::Auto,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            return_token_diffs: true,
            max_candidates_per_clause: DEFAULT_MAX_CANDIDATES,
        }
    }
}

impl CompareOptions {
    /// Parses the optional `options` form field, rejecting unknown keys.
    pub fn from_json(raw: &str) -> Result<Self, PipelineError> {
        let options: Self = serde_json::from_str(raw)
            .map_err(|err| PipelineError::InvalidInput(format!("malformed options: {err}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Rejects out-of-range knob values.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(PipelineError::InvalidInput(format!(
                "similarity_threshold {} outside [0, 1]",
                self.similarity_threshold
            )));
        }
        if !(1..=10).contains(&self.max_candidates_per_clause) {
            return Err(PipelineError::InvalidInput(format!(
                "max_candidates_per_clause {} outside [1, 10]",
                self.max_candidates_per_clause
            )));
        }
        Ok(())
    }

    /// Applies `UCC_EMBEDDER` and `UCC_SIMILARITY_THRESHOLD` overrides.
    pub fn with_env_overrides(mut self) -> Result<Self, PipelineError> {
        if let Ok(value) = std::env::var("UCC_EMBEDDER") {
            self.embedder = value.parse()?;
        }
        if let Ok(value) = std::env::var("UCC_SIMILARITY_THRESHOLD") {
            self.similarity_threshold = value.parse().map_err(|_| {
                PipelineError::InvalidInput(format!(
                    "UCC_SIMILARITY_THRESHOLD {value:?} is not a number"
                ))
            })?;
        }
        self.validate()?;
        Ok(self)
    }
}
