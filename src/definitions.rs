//! Defined-term harvesting and whole-word expansion for alignment.

use regex::{escape, Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::layout::Block;

/// A defined term and its expansion, traced back to the defining block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    /// Lowercased term with punctuation stripped.
    pub term: String,
    /// Expansion text as it appears in the definitions section.
    pub expansion: String,
    /// Block the definition was harvested from.
    pub source_block_id: String,
}

fn quoted_definition_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"["\u{201c}]([^"\u{201d}]{2,60})["\u{201d}]\s+(?:means|shall mean)\s+([^.;]+)"#)
            .expect("quoted definition regex")
    })
}

fn capitalized_definition_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^([A-Z][A-Za-z'\- ]{1,50}?)\s+(?:means|shall mean)\s+([^.;]+)")
            .expect("capitalized definition regex")
    })
}

fn definitions_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| RegexBuilder::new("definition")
        .case_insensitive(true)
        .build()
        .expect("definitions heading regex"))
}

/// Harvests definitions and performs single-pass term expansion.
pub struct DefinitionResolver;

impl DefinitionResolver {
    /// Collects `(term, expansion)` pairs from the document's blocks.
    ///
    /// A block contributes when it sits under a definitions heading or when
    /// its text carries an explicit `"Term" means ...` pattern.
    pub fn resolve(&self, blocks: &[Block]) -> Vec<Definition> {
        let mut definitions: Vec<Definition> = Vec::new();
        for block in blocks {
            let in_definitions_section = block
                .section_path
                .last()
                .is_some_and(|heading| definitions_heading_re().is_match(heading));

            for captures in quoted_definition_re().captures_iter(&block.text) {
                push_definition(&mut definitions, &captures[1], &captures[2], block);
            }
            if in_definitions_section {
                for captures in capitalized_definition_re().captures_iter(&block.text) {
                    push_definition(&mut definitions, &captures[1], &captures[2], block);
                }
            }
        }
        definitions
    }

    /// Appends `(= expansion)` after each whole-word term occurrence.
    ///
    /// Expansion is single-pass over the original text: terms appearing
    /// inside another term's expansion are never re-expanded.
    pub fn expand(text: &str, definitions: &[Definition]) -> String {
        if definitions.is_empty() {
            return text.to_string();
        }
        let pattern = term_alternation(definitions);
        let Ok(re) = RegexBuilder::new(&pattern).case_insensitive(true).build() else {
            return text.to_string();
        };

        let mut expanded = String::with_capacity(text.len());
        let mut cursor = 0;
        for found in re.find_iter(text) {
            expanded.push_str(&text[cursor..found.end()]);
            let matched = normalize_term(found.as_str());
            if let Some(definition) = definitions.iter().find(|d| d.term == matched) {
                expanded.push_str(" (= ");
                expanded.push_str(&definition.expansion);
                expanded.push(')');
            }
            cursor = found.end();
        }
        expanded.push_str(&text[cursor..]);
        expanded
    }
}

/// Builds a whole-word alternation over all defined terms, longest first so
/// overlapping terms prefer the most specific match.
fn term_alternation(definitions: &[Definition]) -> String {
    let mut terms: Vec<&str> = definitions.iter().map(|d| d.term.as_str()).collect();
    terms.sort_by_key(|term| std::cmp::Reverse(term.len()));
    terms.dedup();
    let body = terms
        .iter()
        .map(|term| escape(term))
        .collect::<Vec<_>>()
        .join("|");
    format!(r"\b(?:{body})\b")
}

fn push_definition(definitions: &mut Vec<Definition>, term: &str, expansion: &str, block: &Block) {
    let term = normalize_term(term);
    let expansion = expansion.trim().to_string();
    if term.len() < 2 || expansion.is_empty() {
        return;
    }
    if definitions.iter().any(|d| d.term == term) {
        return;
    }
    definitions.push(Definition {
        term,
        expansion,
        source_block_id: block.block_id.clone(),
    });
}

/// Lowercases and strips punctuation from a term.
fn normalize_term(term: &str) -> String {
    term.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-' || *c == '\'')
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{LayoutExtractor, PageSource, PlainTextSource};

    fn blocks_from(text: &str) -> Vec<Block> {
        let pages = PlainTextSource.pages(text.as_bytes()).expect("pages");
        LayoutExtractor::default().extract("docdef", &pages).expect("blocks")
    }

    #[test]
    fn harvests_quoted_definitions_anywhere() {
        let blocks = blocks_from(r#"Cover applies. "Flood" means the covering of normally dry land by water."#);
        let definitions = DefinitionResolver.resolve(&blocks);
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].term, "flood");
        assert!(definitions[0].expansion.starts_with("the covering"));
    }

    #[test]
    fn harvests_capitalized_terms_in_definitions_section() {
        let blocks = blocks_from("DEFINITIONS\n\nBusiness Hours means 9am to 5pm on a Working Day.");
        let definitions = DefinitionResolver.resolve(&blocks);
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].term, "business hours");
    }

    #[test]
    fn expansion_is_whole_word_and_case_insensitive() {
        let definitions = vec![Definition {
            term: "flood".into(),
            expansion: "rising water".into(),
            source_block_id: "docdef:0000".into(),
        }];
        let expanded =
            DefinitionResolver::expand("Flood damage and floodlight damage.", &definitions);
        assert_eq!(
            expanded,
            "Flood (= rising water) damage and floodlight damage."
        );
    }

    #[test]
    fn expansion_is_single_pass() {
        let definitions = vec![
            Definition {
                term: "premises".into(),
                expansion: "the building at the situation".into(),
                source_block_id: "docdef:0000".into(),
            },
            Definition {
                term: "building".into(),
                expansion: "any structure you own".into(),
                source_block_id: "docdef:0001".into(),
            },
        ];
        let expanded = DefinitionResolver::expand("Damage at the premises.", &definitions);
        // "building" inside the premises expansion stays untouched.
        assert_eq!(
            expanded,
            "Damage at the premises (= the building at the situation)."
        );
    }

    #[test]
    fn duplicate_terms_keep_first_expansion() {
        let blocks = blocks_from(
            r#""Excess" means the first amount payable. "Excess" means something else entirely."#,
        );
        let definitions = DefinitionResolver.resolve(&blocks);
        assert_eq!(definitions.len(), 1);
        assert!(definitions[0].expansion.contains("first amount"));
    }
}
