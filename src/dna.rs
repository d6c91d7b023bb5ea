//! Clause DNA extraction: the structured features used for similarity
//! beyond raw text.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use crate::classifier::ClauseType;
use crate::layout::Block;

/// Effect direction of a clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Polarity {
    /// Grants cover.
    Grant,
    /// Removes cover.
    Remove,
    /// Neither grants nor removes.
    Neutral,
}

/// How hard a clause is to satisfy; absolute wording is strictest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Strictness {
    /// No qualifying conjunctions.
    Absolute,
    /// Applies only when stated conditions hold.
    Conditional,
    /// At the insurer's option.
    Discretionary,
}

impl Strictness {
    /// Numeric rank used for strictness deltas (absolute is highest).
    pub fn rank(&self) -> i8 {
        match self {
            Self::Absolute => 2,
            Self::Conditional => 1,
            Self::Discretionary => 0,
        }
    }
}

/// Structured fingerprint of a clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClauseDNA {
    /// Effect direction.
    pub polarity: Polarity,
    /// Wording strictness.
    pub strictness: Strictness,
    /// Normalized entities named by the clause.
    pub entities: BTreeSet<String>,
    /// Exception spans introduced by carve-out triggers.
    pub carve_outs: BTreeSet<String>,
    /// Causal/scoping connectors from the fixed lexicon.
    pub scope_connectors: BTreeSet<String>,
    /// Whether the clause imposes a new obligation on the insured.
    pub burden_shift: bool,
    /// Temporal constraint cue, when one is present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporal: Option<String>,
    /// Canonical numeric fields in canonical units.
    pub numerics: BTreeMap<String, f64>,
}

/// A block enriched with its type and DNA; the unit the aligner consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    /// Underlying layout block.
    pub block: Block,
    /// Classified type.
    pub clause_type: ClauseType,
    /// Extracted fingerprint.
    pub dna: ClauseDNA,
    /// Definition-expanded text used for embedding.
    pub expanded_text: String,
}

impl Clause {
    /// Stable id of the underlying block.
    pub fn id(&self) -> &str {
        &self.block.block_id
    }
}

const GRANT_CUES: [&str; 6] = [
    "we will pay",
    "we will indemnify",
    "cover is provided",
    "is covered",
    "covered under",
    "we insure",
];

const REMOVE_CUES: [&str; 5] = [
    "we will not pay",
    "excluded",
    "does not cover",
    "not covered",
    "we do not cover",
];

const SCOPE_CONNECTORS: [&str; 8] = [
    "arising from",
    "caused by",
    "in respect of",
    "resulting from",
    "due to",
    "in connection with",
    "attributable to",
    "directly or indirectly",
];

const BURDEN_CUES: [&str; 9] = [
    "you must",
    "the insured must",
    "it is a condition",
    "notify us",
    "give notice",
    "proof of loss",
    "police report",
    "provide evidence",
    "cooperate with",
];

const TEMPORAL_CUES: [&str; 6] = [
    "during the period of insurance",
    "prior to inception",
    "at all times",
    "throughout the period",
    "as soon as practicable",
    "immediately",
];

/// Entity lexicon: canonical name and its surface keywords.
const ENTITY_KEYWORDS: [(&str, &[&str]); 18] = [
    ("fire", &["fire", "flame", "combustion"]),
    ("flood", &["flood", "inundation", "water damage"]),
    ("storm", &["storm", "tempest", "cyclone", "hurricane", "tornado"]),
    ("earthquake", &["earthquake", "seismic", "tremor"]),
    ("theft", &["theft", "burglary", "robbery", "stolen"]),
    ("cyber", &["cyber", "data breach", "ransomware", "malware"]),
    ("pollution", &["pollution", "contamination", "seepage"]),
    ("terrorism", &["terrorism", "terrorist"]),
    ("war", &["war", "warlike", "insurrection", "civil war"]),
    ("nuclear", &["nuclear", "radioactive", "radiation"]),
    ("liability", &["liability", "legal liability"]),
    ("contents", &["contents", "stock", "inventory"]),
    ("building", &["building", "premises", "structure"]),
    ("vehicles", &["vehicle", "motor", "fleet"]),
    ("money", &["money", "cash", "negotiable instruments"]),
    ("employee", &["employee", "staff", "worker"]),
    ("contractor", &["contractor", "subcontractor"]),
    ("third party", &["third party", "claimant"]),
];

fn conditional_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:unless|provided|if|except|subject to)\b")
            .expect("conditional regex")
    })
}

fn discretionary_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:may|at our discretion|we reserve)\b").expect("discretionary regex")
    })
}

fn currency_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:A\$|AUD\s*|\$)\s*(\d[\d,]*(?:\.\d+)?)\s*(million|thousand|[mk]\b)?")
            .expect("currency regex")
    })
}

fn percentage_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)\s*%").expect("percentage regex"))
}

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d+)\s*(days?|months?|years?)\b").expect("duration regex")
    })
}

fn within_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bwithin\s+\d+\s+(?:hours?|days?|months?|years?)\b")
            .expect("temporal window regex")
    })
}

const LIMIT_KEYWORDS: [&str; 3] = ["limit", "sum insured", "indemnity"];
const DEDUCTIBLE_KEYWORDS: [&str; 3] = ["excess", "deductible", "retention"];

/// Extracts [`ClauseDNA`] from classified blocks.
pub struct DnaExtractor;

impl DnaExtractor {
    /// Computes the DNA for one non-admin block.
    pub fn extract(&self, block: &Block) -> ClauseDNA {
        let text = block.text.to_lowercase();

        ClauseDNA {
            polarity: extract_polarity(&text),
            strictness: extract_strictness(&text),
            entities: extract_entities(&text),
            carve_outs: extract_carve_outs(&text),
            scope_connectors: extract_connectors(&text),
            burden_shift: BURDEN_CUES.iter().any(|cue| text.contains(cue)),
            temporal: extract_temporal(&text),
            numerics: extract_numerics(&text),
        }
    }

    /// Enriches non-admin blocks into [`Clause`]s.
    pub fn enrich(
        &self,
        blocks: &[Block],
        types: &[ClauseType],
        expanded_texts: &[String],
    ) -> Vec<Clause> {
        blocks
            .iter()
            .zip(types.iter())
            .zip(expanded_texts.iter())
            .filter(|((block, _), _)| !block.is_admin)
            .map(|((block, clause_type), expanded)| Clause {
                block: block.clone(),
                clause_type: *clause_type,
                dna: self.extract(block),
                expanded_text: expanded.clone(),
            })
            .collect()
    }
}

fn extract_polarity(text: &str) -> Polarity {
    let grants: usize = GRANT_CUES.iter().map(|cue| text.matches(cue).count()).sum();
    let removes: usize = REMOVE_CUES
        .iter()
        .map(|cue| text.matches(cue).count())
        .sum();
    if grants > 0 && removes == 0 {
        Polarity::Grant
    } else if removes > grants {
        Polarity::Remove
    } else {
        Polarity::Neutral
    }
}

fn extract_strictness(text: &str) -> Strictness {
    if discretionary_re().is_match(text) {
        Strictness::Discretionary
    } else if conditional_re().is_match(text) {
        Strictness::Conditional
    } else {
        Strictness::Absolute
    }
}

fn extract_entities(text: &str) -> BTreeSet<String> {
    ENTITY_KEYWORDS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|keyword| text.contains(keyword)))
        .map(|(name, _)| name.to_string())
        .collect()
}

fn carve_out_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:except|other than|save for|but not)\b([^.;]*)")
            .expect("carve-out regex")
    })
}

/// Captures the span after each carve-out trigger up to the sentence end.
fn extract_carve_outs(text: &str) -> BTreeSet<String> {
    carve_out_re()
        .captures_iter(text)
        .filter_map(|captures| {
            let span = captures[1].trim().to_string();
            (!span.is_empty()).then_some(span)
        })
        .collect()
}

fn extract_connectors(text: &str) -> BTreeSet<String> {
    SCOPE_CONNECTORS
        .iter()
        .filter(|connector| text.contains(*connector))
        .map(|connector| connector.to_string())
        .collect()
}

fn extract_temporal(text: &str) -> Option<String> {
    if let Some(found) = within_re().find(text) {
        return Some(found.as_str().to_string());
    }
    TEMPORAL_CUES
        .iter()
        .find(|cue| text.contains(*cue))
        .map(|cue| cue.to_string())
}

/// Parses currency, percentage and duration values into canonical fields.
fn extract_numerics(text: &str) -> BTreeMap<String, f64> {
    let mut numerics = BTreeMap::new();

    for captures in currency_re().captures_iter(text) {
        let Some(value) = parse_number(&captures[1]) else {
            continue;
        };
        let multiplier = match captures.get(2).map(|m| m.as_str().to_lowercase()) {
            Some(suffix) if suffix == "million" || suffix == "m" => 1_000_000.0,
            Some(suffix) if suffix == "thousand" || suffix == "k" => 1_000.0,
            _ => 1.0,
        };
        let position = captures.get(0).map(|m| m.start()).unwrap_or(0);
        let field = currency_field(text, position);
        numerics.entry(field.to_string()).or_insert(value * multiplier);
    }

    for captures in percentage_re().captures_iter(text) {
        if let Some(value) = parse_number(&captures[1]) {
            numerics
                .entry("percentage".to_string())
                .or_insert(value / 100.0);
        }
    }

    for captures in duration_re().captures_iter(text) {
        let Some(value) = parse_number(&captures[1]) else {
            continue;
        };
        let unit = captures[2].to_lowercase();
        let days = if unit.starts_with("day") {
            value
        } else if unit.starts_with("month") {
            value * 30.0
        } else {
            value * 365.0
        };
        numerics.entry("period".to_string()).or_insert(days);
    }

    numerics
}

/// Infers the canonical field from keywords surrounding a currency match.
fn currency_field(text: &str, position: usize) -> &'static str {
    let mut window_start = position.saturating_sub(60);
    while window_start > 0 && !text.is_char_boundary(window_start) {
        window_start -= 1;
    }
    let mut window_end = (position + 24).min(text.len());
    while window_end < text.len() && !text.is_char_boundary(window_end) {
        window_end += 1;
    }
    let window = &text[window_start..window_end];
    if LIMIT_KEYWORDS.iter().any(|keyword| window.contains(keyword)) {
        "limit"
    } else if DEDUCTIBLE_KEYWORDS
        .iter()
        .any(|keyword| window.contains(keyword))
    {
        "deductible"
    } else {
        "other"
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.replace(',', "").parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dna(text: &str) -> ClauseDNA {
        let block = Block {
            block_id: "docdna:0000".into(),
            sequence_number: 0,
            text: text.into(),
            page_start: 1,
            page_end: 1,
            bbox: None,
            section_path: vec!["(root)".into()],
            is_admin: false,
        };
        DnaExtractor.extract(&block)
    }

    #[test]
    fn grant_polarity_without_exclusion_cues() {
        let dna = dna("We will pay for theft.");
        assert_eq!(dna.polarity, Polarity::Grant);
        assert_eq!(dna.strictness, Strictness::Absolute);
    }

    #[test]
    fn remove_polarity_when_exclusion_dominates() {
        let dna = dna("Flood damage is excluded.");
        assert_eq!(dna.polarity, Polarity::Remove);
    }

    #[test]
    fn conditional_strictness_from_qualifier() {
        let dna = dna("We will pay for theft, provided a police report is filed within 48 hours.");
        assert_eq!(dna.strictness, Strictness::Conditional);
        assert!(dna.burden_shift);
        assert_eq!(dna.temporal.as_deref(), Some("within 48 hours"));
    }

    #[test]
    fn discretionary_strictness_wins_over_conditional() {
        let dna = dna("We may, at our discretion, extend cover if requested.");
        assert_eq!(dna.strictness, Strictness::Discretionary);
    }

    #[test]
    fn currency_near_limit_keyword() {
        let dna = dna("Limit of liability: $10,000,000 for any one occurrence.");
        assert_eq!(dna.numerics.get("limit"), Some(&10_000_000.0));
    }

    #[test]
    fn currency_near_excess_keyword() {
        let dna = dna("An excess of $2,500 applies to each claim.");
        assert_eq!(dna.numerics.get("deductible"), Some(&2_500.0));
    }

    #[test]
    fn magnitude_suffix_scales_value() {
        let dna = dna("Sum insured: A$5 million for buildings.");
        assert_eq!(dna.numerics.get("limit"), Some(&5_000_000.0));
    }

    #[test]
    fn percentage_normalized_to_unit_interval() {
        let dna = dna("A co-insurance of 80% applies.");
        assert_eq!(dna.numerics.get("percentage"), Some(&0.8));
    }

    #[test]
    fn durations_canonicalized_to_days() {
        let dna = dna("Cover continues for 3 months after expiry.");
        assert_eq!(dna.numerics.get("period"), Some(&90.0));
    }

    #[test]
    fn carve_out_span_captured() {
        let dna = dna("We will pay for storm damage except where the roof was unmaintained.");
        assert!(dna
            .carve_outs
            .iter()
            .any(|c| c.contains("roof was unmaintained")));
    }

    #[test]
    fn connectors_and_entities_from_lexicon() {
        let dna = dna("Loss arising from flood or storm is excluded.");
        assert!(dna.scope_connectors.contains("arising from"));
        assert!(dna.entities.contains("flood"));
        assert!(dna.entities.contains("storm"));
    }
}
