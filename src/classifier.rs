//! Two-stage clause classification: cue scoring then precedence tie-break.

use serde::{Deserialize, Serialize};

use crate::layout::Block;

/// The operative role a clause plays in a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClauseType {
    /// Insuring agreement granting cover.
    Coverage,
    /// Carve-out removing cover.
    Exclusion,
    /// Precondition on cover or claims handling.
    Condition,
    /// Defined-term entry.
    Definition,
    /// Warranted statement by the insured.
    Warranty,
    /// Optional or additional cover.
    Extension,
    /// Policy amendment.
    Endorsement,
    /// Outstanding requirement attached to the placement.
    Subjectivity,
    /// Excess/deductible provision.
    Deductible,
    /// Non-operational furniture.
    Admin,
}

impl ClauseType {
    /// Wire-stable label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coverage => "coverage",
            Self::Exclusion => "exclusion",
            Self::Condition => "condition",
            Self::Definition => "definition",
            Self::Warranty => "warranty",
            Self::Extension => "extension",
            Self::Endorsement => "endorsement",
            Self::Subjectivity => "subjectivity",
            Self::Deductible => "deductible",
            Self::Admin => "admin",
        }
    }

    /// Human-readable label used in summary bullets.
    pub fn display(&self) -> &'static str {
        match self {
            Self::Coverage => "Coverage",
            Self::Exclusion => "Exclusion",
            Self::Condition => "Condition",
            Self::Definition => "Definition",
            Self::Warranty => "Warranty",
            Self::Extension => "Extension",
            Self::Endorsement => "Endorsement",
            Self::Subjectivity => "Subjectivity",
            Self::Deductible => "Deductible",
            Self::Admin => "Admin",
        }
    }

    /// Tie-break order: lower wins when cue scores are equal.
    fn precedence(&self) -> u8 {
        match self {
            Self::Exclusion => 0,
            Self::Condition => 1,
            Self::Coverage => 2,
            Self::Extension => 3,
            Self::Endorsement => 4,
            Self::Warranty => 5,
            Self::Subjectivity => 6,
            Self::Deductible => 7,
            Self::Definition => 8,
            Self::Admin => 9,
        }
    }
}

const EXCLUSION_CUES: [&str; 5] = [
    "we will not pay",
    "excluded",
    "does not cover",
    "not covered",
    "exclusion",
];
const CONDITION_CUES: [&str; 3] = ["you must", "it is a condition", "provided that"];
const WARRANTY_CUES: [&str; 1] = ["warranted that"];
const DEFINITION_CUES: [&str; 2] = ["means", "shall mean"];
const COVERAGE_CUES: [&str; 6] = [
    "we will pay",
    "we will indemnify",
    "cover is provided",
    "covered",
    "limit of liability",
    "sum insured",
];
const DEDUCTIBLE_CUES: [&str; 2] = ["excess", "deductible"];
const SUBJECTIVITY_CUES: [&str; 2] = ["subject to", "subjectivity"];

/// Assigns a [`ClauseType`] to each block from fixed trigger phrases.
pub struct ClauseClassifier;

impl ClauseClassifier {
    /// Classifies one block; admin blocks stay admin without scoring.
    ///
    /// Returns the type and whether the block turned out to be furniture
    /// (zero cue score), which the caller writes back to the block.
    pub fn classify(&self, block: &Block) -> (ClauseType, bool) {
        if block.is_admin {
            return (ClauseType::Admin, true);
        }

        let text = block.text.to_lowercase();
        let mut scores: Vec<(ClauseType, usize)> = vec![
            (ClauseType::Exclusion, cue_score(&text, &EXCLUSION_CUES)),
            (ClauseType::Condition, cue_score(&text, &CONDITION_CUES)),
            (ClauseType::Coverage, cue_score(&text, &COVERAGE_CUES)),
            (ClauseType::Extension, section_cue(block, "extension")),
            (ClauseType::Endorsement, section_cue(block, "endorsement")),
            (ClauseType::Warranty, cue_score(&text, &WARRANTY_CUES)),
            (ClauseType::Subjectivity, cue_score(&text, &SUBJECTIVITY_CUES)),
            (ClauseType::Deductible, cue_score(&text, &DEDUCTIBLE_CUES)),
            (ClauseType::Definition, cue_score(&text, &DEFINITION_CUES)),
        ];

        scores.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| a.0.precedence().cmp(&b.0.precedence()))
        });

        let (best, score) = scores[0];
        if score == 0 {
            (ClauseType::Admin, true)
        } else {
            (best, false)
        }
    }

    /// Classifies all blocks, writing `is_admin` back in place.
    pub fn classify_all(&self, blocks: &mut [Block]) -> Vec<ClauseType> {
        blocks
            .iter_mut()
            .map(|block| {
                let (clause_type, is_admin) = self.classify(block);
                if is_admin {
                    block.is_admin = true;
                }
                clause_type
            })
            .collect()
    }
}

/// Counts non-overlapping occurrences of each cue phrase.
fn cue_score(text: &str, cues: &[&str]) -> usize {
    cues.iter()
        .map(|cue| text.matches(cue).count())
        .sum()
}

/// One point when any section component contains the keyword.
fn section_cue(block: &Block, keyword: &str) -> usize {
    usize::from(
        block
            .section_path
            .iter()
            .any(|component| component.to_lowercase().contains(keyword)),
    )
}
