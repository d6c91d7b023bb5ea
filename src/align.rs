//! Clause alignment: composite similarity plus constrained assignment.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::classifier::ClauseType;
use crate::dna::{Clause, ClauseDNA};
use crate::embedder::{cosine, Embedder};
use crate::error::PipelineError;
use crate::options::{CompareOptions, LOW_CONFIDENCE_FLOOR, UNCHANGED_EPSILON};

/// Warning emitted when alignment runs without embeddings.
pub const LEXICAL_FALLBACK_WARNING: &str = "embedder fallback: lexical similarity";

/// Outcome category for a clause pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    /// Present only in document B.
    Added,
    /// Present only in document A.
    Removed,
    /// Matched with differing content.
    Modified,
    /// Matched with equivalent content.
    Unchanged,
}

impl MatchStatus {
    /// Result ordering rank: modified first, unchanged last.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Modified => 0,
            Self::Added => 1,
            Self::Removed => 2,
            Self::Unchanged => 3,
        }
    }

    /// Wire-stable label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Removed => "removed",
            Self::Modified => "modified",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Token-level diff between a modified pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDiff {
    /// Tokens present only in document B's clause, sorted.
    pub added: Vec<String>,
    /// Tokens present only in document A's clause, sorted.
    pub removed: Vec<String>,
}

/// Per-field numeric change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericDelta {
    /// Value on the A side, when present.
    pub a_value: Option<f64>,
    /// Value on the B side, when present.
    pub b_value: Option<f64>,
    /// Percentage change; null when the A value is absent or zero.
    pub delta_pct: Option<f64>,
}

/// Page range locating a clause in its source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSpan {
    /// First page (1-based).
    pub page_start: u32,
    /// Last page (1-based, inclusive).
    pub page_end: u32,
}

/// Page evidence for both sides of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Evidence {
    /// Location in document A.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub a: Option<PageSpan>,
    /// Location in document B.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b: Option<PageSpan>,
}

/// Comparison outcome for one clause pair (or one unmatched clause).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClauseMatch {
    /// Block id in document A; null for added clauses.
    pub a_id: Option<String>,
    /// Block id in document B; null for removed clauses.
    pub b_id: Option<String>,
    /// Outcome category.
    pub status: MatchStatus,
    /// Composite similarity; null when only one side exists.
    pub similarity: Option<f64>,
    /// Token diff, for modified pairs when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_diff: Option<TokenDiff>,
    /// Per-field numeric changes, when any side carries numbers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numeric_delta: Option<BTreeMap<String, NumericDelta>>,
    /// How much the change matters, in `[0, 1]`.
    pub materiality_score: f64,
    /// Strictness rank change from A to B, in `[-2, 2]`.
    pub strictness_delta: i8,
    /// Whether a human should look at this match.
    pub review_required: bool,
    /// Page evidence.
    pub evidence: Evidence,
    /// Clause type of the surviving side.
    pub clause_type: ClauseType,
}

/// Alignment result prior to delta interpretation.
#[derive(Debug, Clone)]
pub struct AlignmentOutcome {
    /// Initial matches; delta fields still at their defaults.
    pub matches: Vec<ClauseMatch>,
    /// Warnings raised while aligning.
    pub warnings: Vec<String>,
}

/// Produces the initial one-to-one clause matching between two documents.
pub struct Aligner {
    options: CompareOptions,
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    a_idx: usize,
    b_idx: usize,
    sim: f64,
}

impl Aligner {
    /// Builds an aligner with the given options.
    pub fn new(options: CompareOptions) -> Self {
        Self { options }
    }

    /// Aligns the non-admin clauses of A against those of B.
    pub fn align(
        &self,
        embedder: &dyn Embedder,
        clauses_a: &[Clause],
        clauses_b: &[Clause],
    ) -> AlignmentOutcome {
        let mut warnings = Vec::new();
        let similarity = self.similarity_matrix(embedder, clauses_a, clauses_b, &mut warnings);

        let edges = self.candidate_edges(&similarity, clauses_a, clauses_b);
        let (pairs, matched_a, matched_b) = greedy_assign(edges, clauses_a.len(), clauses_b.len());

        let mut matches = Vec::new();
        for edge in pairs {
            let a = &clauses_a[edge.a_idx];
            let b = &clauses_b[edge.b_idx];
            let status = if edge.sim >= 1.0 - UNCHANGED_EPSILON {
                MatchStatus::Unchanged
            } else {
                MatchStatus::Modified
            };
            matches.push(ClauseMatch {
                a_id: Some(a.id().to_string()),
                b_id: Some(b.id().to_string()),
                status,
                similarity: Some(edge.sim),
                token_diff: None,
                numeric_delta: None,
                materiality_score: 0.0,
                strictness_delta: 0,
                review_required: false,
                evidence: Evidence {
                    a: Some(span_of(a)),
                    b: Some(span_of(b)),
                },
                clause_type: b.clause_type,
            });
        }

        for (a_idx, a) in clauses_a.iter().enumerate() {
            if matched_a.contains(&a_idx) {
                continue;
            }
            matches.push(ClauseMatch {
                a_id: Some(a.id().to_string()),
                b_id: None,
                status: MatchStatus::Removed,
                similarity: None,
                token_diff: None,
                numeric_delta: None,
                materiality_score: 0.0,
                strictness_delta: 0,
                review_required: false,
                evidence: Evidence {
                    a: Some(span_of(a)),
                    b: None,
                },
                clause_type: a.clause_type,
            });
        }

        for (b_idx, b) in clauses_b.iter().enumerate() {
            if matched_b.contains(&b_idx) {
                continue;
            }
            matches.push(ClauseMatch {
                a_id: None,
                b_id: Some(b.id().to_string()),
                status: MatchStatus::Added,
                similarity: None,
                token_diff: None,
                numeric_delta: None,
                materiality_score: 0.0,
                strictness_delta: 0,
                review_required: false,
                evidence: Evidence {
                    a: None,
                    b: Some(span_of(b)),
                },
                clause_type: b.clause_type,
            });
        }

        AlignmentOutcome { matches, warnings }
    }

    /// Pairwise composite similarity; falls back to a lexical ratio for the
    /// text term when the embedding backend is unavailable.
    fn similarity_matrix(
        &self,
        embedder: &dyn Embedder,
        clauses_a: &[Clause],
        clauses_b: &[Clause],
        warnings: &mut Vec<String>,
    ) -> Vec<Vec<f64>> {
        let text_sim = match self.embedding_text_similarity(embedder, clauses_a, clauses_b) {
            Ok(matrix) => matrix,
            Err(err) => {
                tracing::warn!(error = %err, "embedding backend failed, using lexical ratio");
                warnings.push(LEXICAL_FALLBACK_WARNING.to_string());
                lexical_text_similarity(clauses_a, clauses_b)
            }
        };

        let mut matrix = vec![vec![0.0f64; clauses_b.len()]; clauses_a.len()];
        for (i, a) in clauses_a.iter().enumerate() {
            for (j, b) in clauses_b.iter().enumerate() {
                let mut sim = 0.6 * text_sim[i][j]
                    + 0.2 * dna_similarity(&a.dna, &b.dna)
                    + 0.2 * section_similarity(&a.block.section_path, &b.block.section_path);
                if a.clause_type != b.clause_type
                    && a.clause_type != ClauseType::Admin
                    && b.clause_type != ClauseType::Admin
                {
                    sim *= 0.5;
                }
                matrix[i][j] = sim;
            }
        }
        matrix
    }

    fn embedding_text_similarity(
        &self,
        embedder: &dyn Embedder,
        clauses_a: &[Clause],
        clauses_b: &[Clause],
    ) -> Result<Vec<Vec<f64>>, PipelineError> {
        let texts: Vec<&str> = clauses_a
            .iter()
            .chain(clauses_b.iter())
            .map(|clause| clause.expanded_text.as_str())
            .collect();
        if texts.is_empty() {
            return Ok(vec![vec![]; clauses_a.len()]);
        }
        let vectors = embedder.embed_batch(&texts)?;
        let (vectors_a, vectors_b) = vectors.split_at(clauses_a.len());
        Ok(vectors_a
            .iter()
            .map(|va| vectors_b.iter().map(|vb| cosine(va, vb)).collect())
            .collect())
    }

    /// Top-K candidate edges per A-clause above the low-confidence floor.
    fn candidate_edges(
        &self,
        similarity: &[Vec<f64>],
        clauses_a: &[Clause],
        clauses_b: &[Clause],
    ) -> Vec<Edge> {
        let mut edges = Vec::new();
        for (a_idx, _) in clauses_a.iter().enumerate() {
            let mut row: Vec<Edge> = clauses_b
                .iter()
                .enumerate()
                .filter_map(|(b_idx, _)| {
                    let sim = similarity[a_idx][b_idx];
                    (sim >= LOW_CONFIDENCE_FLOOR).then_some(Edge { a_idx, b_idx, sim })
                })
                .collect();
            row.sort_by(|x, y| {
                y.sim
                    .total_cmp(&x.sim)
                    .then_with(|| x.b_idx.cmp(&y.b_idx))
            });
            row.truncate(self.options.max_candidates_per_clause);
            edges.extend(row);
        }
        edges
    }
}

/// Greedy maximum-weight assignment: accept edges in descending similarity
/// while both endpoints are free. Ties break on ascending A then B sequence.
fn greedy_assign(
    mut edges: Vec<Edge>,
    a_len: usize,
    b_len: usize,
) -> (Vec<Edge>, BTreeSet<usize>, BTreeSet<usize>) {
    edges.sort_by(|x, y| {
        y.sim
            .total_cmp(&x.sim)
            .then_with(|| x.a_idx.cmp(&y.a_idx))
            .then_with(|| x.b_idx.cmp(&y.b_idx))
    });

    let mut free_a = vec![true; a_len];
    let mut free_b = vec![true; b_len];
    let mut accepted = Vec::new();
    let mut matched_a = BTreeSet::new();
    let mut matched_b = BTreeSet::new();
    for edge in edges {
        if free_a[edge.a_idx] && free_b[edge.b_idx] {
            free_a[edge.a_idx] = false;
            free_b[edge.b_idx] = false;
            matched_a.insert(edge.a_idx);
            matched_b.insert(edge.b_idx);
            accepted.push(edge);
        }
    }
    accepted.sort_by_key(|edge| edge.a_idx);
    (accepted, matched_a, matched_b)
}

/// DNA similarity: polarity agreement, strictness distance and entity
/// overlap, weighted 0.4/0.3/0.3.
pub fn dna_similarity(a: &ClauseDNA, b: &ClauseDNA) -> f64 {
    let polarity = if a.polarity == b.polarity { 1.0 } else { 0.0 };
    let strictness_gap = (a.strictness.rank() - b.strictness.rank()).abs() as f64;
    let strictness = 1.0 - strictness_gap / 2.0;
    polarity * 0.4 + strictness * 0.3 + jaccard(&a.entities, &b.entities) * 0.3
}

/// Longest-common-prefix ratio over section paths.
pub fn section_similarity(path_a: &[String], path_b: &[String]) -> f64 {
    let max_len = path_a.len().max(path_b.len());
    if max_len == 0 {
        return 0.0;
    }
    let prefix = path_a
        .iter()
        .zip(path_b.iter())
        .take_while(|(a, b)| a.eq_ignore_ascii_case(b))
        .count();
    prefix as f64 / max_len as f64
}

/// Set overlap ratio; two empty sets count as identical.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

fn span_of(clause: &Clause) -> PageSpan {
    PageSpan {
        page_start: clause.block.page_start,
        page_end: clause.block.page_end,
    }
}

/// Pairwise word-level diff ratio used when no embeddings are available.
fn lexical_text_similarity(clauses_a: &[Clause], clauses_b: &[Clause]) -> Vec<Vec<f64>> {
    clauses_a
        .iter()
        .map(|a| {
            clauses_b
                .iter()
                .map(|b| {
                    f64::from(
                        similar::TextDiff::from_words(
                            a.expanded_text.as_str(),
                            b.expanded_text.as_str(),
                        )
                        .ratio(),
                    )
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClauseClassifier;
    use crate::dna::DnaExtractor;
    use crate::embedder::HashedEmbedder;
    use crate::layout::{LayoutExtractor, PageSource, PlainTextSource};

    fn clauses(doc_id: &str, text: &str) -> Vec<Clause> {
        let pages = PlainTextSource.pages(text.as_bytes()).expect("pages");
        let mut blocks = LayoutExtractor::default().extract(doc_id, &pages).expect("blocks");
        let types = ClauseClassifier.classify_all(&mut blocks);
        let expanded: Vec<String> = blocks.iter().map(|b| b.text.clone()).collect();
        DnaExtractor.enrich(&blocks, &types, &expanded)
    }

    fn align(a: &str, b: &str) -> AlignmentOutcome {
        let clauses_a = clauses("doca", a);
        let clauses_b = clauses("docb", b);
        Aligner::new(CompareOptions::default()).align(&HashedEmbedder::default(), &clauses_a, &clauses_b)
    }

    #[test]
    fn identical_documents_are_unchanged() {
        let text = "We will pay for theft of contents.\n\nWe will not pay for loss caused by flood.";
        let outcome = align(text, text);
        assert_eq!(outcome.matches.len(), 2);
        assert!(outcome
            .matches
            .iter()
            .all(|m| m.status == MatchStatus::Unchanged));
        assert!(outcome
            .matches
            .iter()
            .all(|m| m.similarity.unwrap() >= 1.0 - UNCHANGED_EPSILON));
    }

    #[test]
    fn extra_clause_in_b_is_added() {
        let a = "We will pay for theft of contents.";
        let b = "We will pay for theft of contents.\n\nWe will not pay for loss caused by flood.";
        let outcome = align(a, b);
        let added: Vec<_> = outcome
            .matches
            .iter()
            .filter(|m| m.status == MatchStatus::Added)
            .collect();
        assert_eq!(added.len(), 1);
        assert!(added[0].a_id.is_none());
        assert!(added[0].similarity.is_none());
    }

    #[test]
    fn missing_clause_in_b_is_removed() {
        let a = "We will pay for theft of contents.\n\nWe will not pay for loss caused by flood.";
        let b = "We will pay for theft of contents.";
        let outcome = align(a, b);
        assert_eq!(
            outcome
                .matches
                .iter()
                .filter(|m| m.status == MatchStatus::Removed)
                .count(),
            1
        );
    }

    #[test]
    fn reworded_clause_is_modified() {
        let a = "We will pay for theft of contents from the premises.";
        let b = "We will pay for theft of contents or stock from the premises.";
        let outcome = align(a, b);
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].status, MatchStatus::Modified);
        let sim = outcome.matches[0].similarity.unwrap();
        assert!(sim < 1.0 - UNCHANGED_EPSILON && sim >= LOW_CONFIDENCE_FLOOR);
    }

    #[test]
    fn matching_is_one_to_one() {
        let a = "We will pay for theft of contents.\n\nWe will pay for theft of stock.";
        let b = "We will pay for theft of contents.";
        let outcome = align(a, b);
        let matched: Vec<_> = outcome.matches.iter().filter(|m| m.b_id.is_some() && m.a_id.is_some()).collect();
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn deterministic_across_runs() {
        let a = "We will pay for theft.\n\nWe will not pay for flood damage.";
        let b = "We will pay for theft.\n\nWe will not pay for storm damage.";
        let first = align(a, b);
        let second = align(a, b);
        let ids = |outcome: &AlignmentOutcome| {
            outcome
                .matches
                .iter()
                .map(|m| (m.a_id.clone(), m.b_id.clone(), m.similarity))
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn jaccard_of_empty_sets_is_one() {
        assert!((jaccard(&BTreeSet::new(), &BTreeSet::new()) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn section_similarity_is_prefix_based() {
        let a = vec!["Coverage".to_string(), "Theft".to_string()];
        let b = vec!["Coverage".to_string(), "Money".to_string()];
        assert!((section_similarity(&a, &b) - 0.5).abs() < f64::EPSILON);
        assert!((section_similarity(&a, &a) - 1.0).abs() < f64::EPSILON);
    }

    #[derive(Debug)]
    struct FailingEmbedder;

    impl Embedder for FailingEmbedder {
        fn id(&self) -> &str {
            "failing"
        }

        fn embed_batch(&self, _texts: &[&str]) -> Result<Vec<Vec<f32>>, PipelineError> {
            Err(PipelineError::EmbeddingTransient("backend down".into()))
        }
    }

    #[test]
    fn lexical_fallback_still_aligns_identical_documents() {
        let text = "We will pay for theft of contents.";
        let clauses_a = clauses("doca", text);
        let clauses_b = clauses("docb", text);
        let outcome =
            Aligner::new(CompareOptions::default()).align(&FailingEmbedder, &clauses_a, &clauses_b);
        assert_eq!(outcome.warnings, vec![LEXICAL_FALLBACK_WARNING.to_string()]);
        assert_eq!(outcome.matches[0].status, MatchStatus::Unchanged);
    }
}
