//! Aggregate counts and the narrative bullet summary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::align::{ClauseMatch, MatchStatus};
use crate::dna::{Clause, Polarity};

/// Maximum bullets emitted per comparison.
const MAX_BULLETS: usize = 12;
/// Characters of clause text carried into a bullet title.
const TITLE_CHARS: usize = 80;

/// Per-status match totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCounts {
    /// Clauses only in document B.
    pub added: usize,
    /// Clauses only in document A.
    pub removed: usize,
    /// Matched pairs with differing content.
    pub modified: usize,
    /// Matched pairs with equivalent content.
    pub unchanged: usize,
}

/// Comparison roll-up: totals plus human-readable bullets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Per-status totals over all matches.
    pub counts: MatchCounts,
    /// Up to twelve bullets covering the most material changes.
    pub bullets: Vec<String>,
}

/// Builds the [`Summary`] for a finished match list.
pub struct Summarizer;

impl Summarizer {
    /// Counts matches by status and emits materiality-ranked bullets.
    pub fn summarize(
        &self,
        matches: &[ClauseMatch],
        clauses_a: &BTreeMap<String, Clause>,
        clauses_b: &BTreeMap<String, Clause>,
    ) -> Summary {
        let mut counts = MatchCounts::default();
        for m in matches {
            match m.status {
                MatchStatus::Added => counts.added += 1,
                MatchStatus::Removed => counts.removed += 1,
                MatchStatus::Modified => counts.modified += 1,
                MatchStatus::Unchanged => counts.unchanged += 1,
            }
        }

        let mut changed: Vec<&ClauseMatch> = matches
            .iter()
            .filter(|m| m.status != MatchStatus::Unchanged)
            .collect();
        changed.sort_by(|x, y| {
            y.materiality_score
                .total_cmp(&x.materiality_score)
                .then_with(|| x.status.rank().cmp(&y.status.rank()))
                .then_with(|| surviving_page(x).cmp(&surviving_page(y)))
        });

        let bullets = changed
            .iter()
            .take(MAX_BULLETS)
            .map(|m| bullet_for(m, clauses_a, clauses_b))
            .collect();

        Summary { counts, bullets }
    }
}

fn surviving_page(m: &ClauseMatch) -> u32 {
    m.evidence
        .b
        .or(m.evidence.a)
        .map(|span| span.page_start)
        .unwrap_or(0)
}

fn bullet_for(
    m: &ClauseMatch,
    clauses_a: &BTreeMap<String, Clause>,
    clauses_b: &BTreeMap<String, Clause>,
) -> String {
    let a = m.a_id.as_ref().and_then(|id| clauses_a.get(id));
    let b = m.b_id.as_ref().and_then(|id| clauses_b.get(id));
    let type_name = m.clause_type.display();

    match m.status {
        MatchStatus::Added => {
            let title = b.map(|c| short_title(&c.block.text)).unwrap_or_default();
            let page = m.evidence.b.map(|span| span.page_start).unwrap_or(0);
            format!("Added {type_name}: {title} (p.{page})")
        }
        MatchStatus::Removed => {
            let title = a.map(|c| short_title(&c.block.text)).unwrap_or_default();
            let page = m.evidence.a.map(|span| span.page_start).unwrap_or(0);
            format!("Removed {type_name}: {title} (p.{page})")
        }
        MatchStatus::Modified | MatchStatus::Unchanged => {
            let reason = modified_reason(m, a, b);
            format!("Modified {type_name}: {reason}")
        }
    }
}

/// One-line reason, in priority: polarity flip, strictness change, dominant
/// numeric movement, then generic wording.
fn modified_reason(m: &ClauseMatch, a: Option<&Clause>, b: Option<&Clause>) -> String {
    if let (Some(a), Some(b)) = (a, b) {
        if a.dna.polarity != b.dna.polarity {
            match b.dna.polarity {
                Polarity::Remove => return "became exclusion".to_string(),
                Polarity::Grant => return "became coverage".to_string(),
                Polarity::Neutral => {}
            }
        }
    }
    if m.strictness_delta < 0 {
        return "now more restrictive".to_string();
    }
    if m.strictness_delta > 0 {
        return "now less restrictive".to_string();
    }
    if let Some(delta) = m.numeric_delta.as_ref() {
        let dominant = delta
            .iter()
            .filter_map(|(field, d)| {
                d.delta_pct
                    .map(|pct| (field, d.a_value, d.b_value, pct.abs()))
            })
            .max_by(|x, y| x.3.total_cmp(&y.3));
        if let Some((field, Some(a_value), Some(b_value), pct)) = dominant {
            if pct > 0.0 {
                return format!(
                    "{field} changed from {} to {}",
                    format_value(a_value),
                    format_value(b_value)
                );
            }
        }
    }
    "wording changed".to_string()
}

fn short_title(text: &str) -> String {
    let collapsed: String = text.chars().take(TITLE_CHARS).collect();
    collapsed.trim().to_string()
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value:.2}")
    }
}
