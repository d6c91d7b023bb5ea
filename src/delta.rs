//! Delta interpretation: per-match materiality, strictness and diffs.

use std::collections::{BTreeMap, BTreeSet};

use crate::align::{ClauseMatch, MatchStatus, NumericDelta, TokenDiff};
use crate::dna::Clause;
use crate::options::{CompareOptions, LOW_CONFIDENCE_FLOOR};

/// Materiality at or above this mark forces human review.
const REVIEW_MATERIALITY: f64 = 0.7;
/// Numeric swing (percent) that forces human review.
const REVIEW_NUMERIC_PCT: f64 = 25.0;

/// Tokens dropped before diffing; inflected articles and connective glue.
const STOPWORDS: [&str; 41] = [
    "the", "and", "for", "are", "but", "not", "you", "your", "our", "their", "this", "that",
    "these", "those", "with", "from", "will", "shall", "was", "were", "been", "being", "have",
    "has", "had", "any", "all", "each", "its", "per", "may", "can", "must", "out", "into", "such",
    "other", "than", "when", "where", "which",
];

/// Fills the interpretive fields of each [`ClauseMatch`].
pub struct DeltaInterpreter {
    options: CompareOptions,
}

impl DeltaInterpreter {
    /// Builds an interpreter with the comparison options.
    pub fn new(options: CompareOptions) -> Self {
        Self { options }
    }

    /// Computes strictness delta, diffs, materiality and the review flag.
    pub fn interpret(&self, m: &mut ClauseMatch, a: Option<&Clause>, b: Option<&Clause>) {
        m.strictness_delta = strictness_delta(m.status, a, b);

        let tokens_a = a.map(|c| tokenize(&c.block.text)).unwrap_or_default();
        let tokens_b = b.map(|c| tokenize(&c.block.text)).unwrap_or_default();
        let added_tokens: Vec<String> = tokens_b.difference(&tokens_a).cloned().collect();
        let removed_tokens: Vec<String> = tokens_a.difference(&tokens_b).cloned().collect();

        let numeric_delta = numeric_delta(a, b);
        let numeric_change = numeric_delta
            .values()
            .filter_map(|delta| delta.delta_pct)
            .map(|pct| (pct.abs() / 100.0).min(1.0))
            .fold(0.0f64, f64::max);

        let polarity_change = match (m.status, a, b) {
            (MatchStatus::Added | MatchStatus::Removed, _, _) => 1.0,
            (_, Some(a), Some(b)) if a.dna.polarity != b.dna.polarity => 1.0,
            _ => 0.0,
        };
        let strictness_change = f64::from(m.strictness_delta.abs()) / 2.0;
        let carve_out_change = match (m.status, a, b) {
            (MatchStatus::Added | MatchStatus::Removed, _, _) => 1.0,
            (_, Some(a), Some(b)) => {
                1.0 - crate::align::jaccard(&a.dna.carve_outs, &b.dna.carve_outs)
            }
            _ => 1.0,
        };
        let token_change = match m.status {
            MatchStatus::Modified => {
                let changed = added_tokens.len() + removed_tokens.len();
                let total = tokens_a.len() + tokens_b.len();
                (changed as f64 / total.max(1) as f64).min(1.0)
            }
            MatchStatus::Added | MatchStatus::Removed => 1.0,
            MatchStatus::Unchanged => 0.0,
        };

        m.materiality_score = (0.35 * polarity_change
            + 0.25 * strictness_change
            + 0.20 * carve_out_change
            + 0.10 * numeric_change
            + 0.10 * token_change)
            .clamp(0.0, 1.0);

        let burden_flipped = matches!(
            (a, b),
            (Some(a), Some(b)) if !a.dna.burden_shift && b.dna.burden_shift
        );
        let low_confidence = m.similarity.is_some_and(|sim| {
            (LOW_CONFIDENCE_FLOOR..self.options.similarity_threshold).contains(&sim)
        });
        let numeric_review = numeric_delta
            .values()
            .filter_map(|delta| delta.delta_pct)
            .any(|pct| pct.abs() >= REVIEW_NUMERIC_PCT);

        m.review_required = m.materiality_score >= REVIEW_MATERIALITY
            || polarity_change > 0.0 && m.status == MatchStatus::Modified
            || low_confidence
            || numeric_review
            || burden_flipped;

        if m.status == MatchStatus::Modified && self.options.return_token_diffs {
            m.token_diff = Some(TokenDiff {
                added: added_tokens,
                removed: removed_tokens,
            });
        }
        if !numeric_delta.is_empty() {
            m.numeric_delta = Some(numeric_delta);
        }
    }

    /// Interprets every match using id-keyed clause lookups.
    pub fn interpret_all(
        &self,
        matches: &mut [ClauseMatch],
        clauses_a: &BTreeMap<String, Clause>,
        clauses_b: &BTreeMap<String, Clause>,
    ) {
        for m in matches.iter_mut() {
            let a = m.a_id.as_ref().and_then(|id| clauses_a.get(id));
            let b = m.b_id.as_ref().and_then(|id| clauses_b.get(id));
            self.interpret(m, a, b);
        }
    }
}

/// Rank change from A to B, clamped to `[-2, 2]`.
fn strictness_delta(status: MatchStatus, a: Option<&Clause>, b: Option<&Clause>) -> i8 {
    let delta = match (status, a, b) {
        (MatchStatus::Added, _, Some(b)) => b.dna.strictness.rank(),
        (MatchStatus::Removed, Some(a), _) => -a.dna.strictness.rank(),
        (_, Some(a), Some(b)) => b.dna.strictness.rank() - a.dna.strictness.rank(),
        _ => 0,
    };
    delta.clamp(-2, 2)
}

/// Union of canonical numeric fields across both sides.
fn numeric_delta(a: Option<&Clause>, b: Option<&Clause>) -> BTreeMap<String, NumericDelta> {
    let empty = BTreeMap::new();
    let numerics_a = a.map(|c| &c.dna.numerics).unwrap_or(&empty);
    let numerics_b = b.map(|c| &c.dna.numerics).unwrap_or(&empty);

    let mut fields: BTreeSet<&String> = numerics_a.keys().collect();
    fields.extend(numerics_b.keys());

    fields
        .into_iter()
        .map(|field| {
            let a_value = numerics_a.get(field).copied();
            let b_value = numerics_b.get(field).copied();
            let delta_pct = match (a_value, b_value) {
                (Some(av), Some(bv)) if av != 0.0 => Some((bv - av) / av * 100.0),
                _ => None,
            };
            (
                field.clone(),
                NumericDelta {
                    a_value,
                    b_value,
                    delta_pct,
                },
            )
        })
        .collect()
}

/// Lowercases, strips punctuation, and drops short tokens and stopwords.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() >= 3)
        .filter(|token| !STOPWORDS.contains(token))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClauseClassifier;
    use crate::dna::DnaExtractor;
    use crate::layout::{LayoutExtractor, PageSource, PlainTextSource};

    fn clause(doc_id: &str, text: &str) -> Clause {
        let pages = PlainTextSource.pages(text.as_bytes()).expect("pages");
        let mut blocks = LayoutExtractor::default().extract(doc_id, &pages).expect("blocks");
        let types = ClauseClassifier.classify_all(&mut blocks);
        let expanded: Vec<String> = blocks.iter().map(|b| b.text.clone()).collect();
        DnaExtractor
            .enrich(&blocks, &types, &expanded)
            .into_iter()
            .next()
            .expect("one clause")
    }

    fn pair_match(status: MatchStatus, similarity: Option<f64>) -> ClauseMatch {
        ClauseMatch {
            a_id: Some("doca:0000".into()),
            b_id: Some("docb:0000".into()),
            status,
            similarity,
            token_diff: None,
            numeric_delta: None,
            materiality_score: 0.0,
            strictness_delta: 0,
            review_required: false,
            evidence: Default::default(),
            clause_type: crate::classifier::ClauseType::Coverage,
        }
    }

    #[test]
    fn strictness_tighten_yields_negative_delta() {
        let a = clause("doca", "We will pay for theft.");
        let b = clause(
            "docb",
            "We will pay for theft, provided a police report is filed within 48 hours.",
        );
        let mut m = pair_match(MatchStatus::Modified, Some(0.9));
        DeltaInterpreter::new(CompareOptions::default()).interpret(&mut m, Some(&a), Some(&b));
        assert_eq!(m.strictness_delta, -1);
        assert!(m.materiality_score >= 0.125);
        // Burden shift flipped false -> true, so review is required.
        assert!(m.review_required);
    }

    #[test]
    fn polarity_flip_is_material_and_reviewed() {
        let a = clause("doca", "Flood damage is covered.");
        let b = clause("docb", "Flood damage is excluded.");
        let mut m = pair_match(MatchStatus::Modified, Some(0.8));
        DeltaInterpreter::new(CompareOptions::default()).interpret(&mut m, Some(&a), Some(&b));
        assert!(m.materiality_score >= 0.35);
        assert!(m.review_required);
    }

    #[test]
    fn numeric_halving_reports_minus_fifty_pct() {
        let a = clause("doca", "Limit of liability: $10,000,000.");
        let b = clause("docb", "Limit of liability: $5,000,000.");
        let mut m = pair_match(MatchStatus::Modified, Some(0.95));
        DeltaInterpreter::new(CompareOptions::default()).interpret(&mut m, Some(&a), Some(&b));
        let delta = m.numeric_delta.as_ref().unwrap().get("limit").unwrap();
        assert_eq!(delta.a_value, Some(10_000_000.0));
        assert_eq!(delta.b_value, Some(5_000_000.0));
        assert!((delta.delta_pct.unwrap() + 50.0).abs() < 1e-9);
        assert!(m.review_required);
    }

    #[test]
    fn unchanged_pair_scores_zero() {
        let a = clause("doca", "We will pay for theft of contents.");
        let b = clause("docb", "We will pay for theft of contents.");
        let mut m = pair_match(MatchStatus::Unchanged, Some(1.0));
        DeltaInterpreter::new(CompareOptions::default()).interpret(&mut m, Some(&a), Some(&b));
        assert_eq!(m.materiality_score, 0.0);
        assert!(!m.review_required);
        assert!(m.token_diff.is_none());
    }

    #[test]
    fn added_clause_gets_full_change_weights() {
        let b = clause("docb", "Terrorism is excluded.");
        let mut m = ClauseMatch {
            a_id: None,
            b_id: Some(b.id().to_string()),
            status: MatchStatus::Added,
            similarity: None,
            token_diff: None,
            numeric_delta: None,
            materiality_score: 0.0,
            strictness_delta: 0,
            review_required: false,
            evidence: Default::default(),
            clause_type: b.clause_type,
        };
        DeltaInterpreter::new(CompareOptions::default()).interpret(&mut m, None, Some(&b));
        // polarity 0.35 + strictness 0.25*(2/2) + carve 0.20 + token 0.10
        assert!(m.materiality_score >= 0.85);
        assert_eq!(m.strictness_delta, 2);
        assert!(m.review_required);
    }

    #[test]
    fn low_confidence_band_forces_review() {
        let a = clause("doca", "We will pay for theft of contents.");
        let b = clause("docb", "We will pay for theft of contents.");
        let mut m = pair_match(MatchStatus::Modified, Some(0.6));
        DeltaInterpreter::new(CompareOptions::default()).interpret(&mut m, Some(&a), Some(&b));
        assert!(m.review_required);
    }

    #[test]
    fn token_diff_only_when_requested() {
        let a = clause("doca", "We will pay for theft of contents.");
        let b = clause("docb", "We will pay for theft of contents and stock.");
        let mut with = pair_match(MatchStatus::Modified, Some(0.9));
        DeltaInterpreter::new(CompareOptions::default()).interpret(&mut with, Some(&a), Some(&b));
        let diff = with.token_diff.expect("diff requested by default");
        assert_eq!(diff.added, vec!["stock".to_string()]);
        assert!(diff.removed.is_empty());

        let mut without_options = CompareOptions::default();
        without_options.return_token_diffs = false;
        let mut without = pair_match(MatchStatus::Modified, Some(0.9));
        DeltaInterpreter::new(without_options).interpret(&mut without, Some(&a), Some(&b));
        assert!(without.token_diff.is_none());
    }

    #[test]
    fn tokenizer_drops_stopwords_and_short_tokens() {
        let tokens = tokenize("We will pay for the theft of it.");
        assert!(tokens.contains("theft"));
        assert!(tokens.contains("pay"));
        assert!(!tokens.contains("the"));
        assert!(!tokens.contains("it"));
        assert!(!tokens.contains("we"));
    }
}
