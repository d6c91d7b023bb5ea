//! Stage composition: two documents in, one `ComparisonResult` out.
//!
//! The orchestrator drives these stages one segment at a time; the
//! synchronous endpoint and the CLI run them back to back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::align::{Aligner, AlignmentOutcome, ClauseMatch};
use crate::classifier::{ClauseClassifier, ClauseType};
use crate::definitions::{Definition, DefinitionResolver};
use crate::delta::DeltaInterpreter;
use crate::dna::{Clause, DnaExtractor};
use crate::embedder::Embedder;
use crate::error::PipelineError;
use crate::layout::{doc_id_for, Block, LayoutExtractor, PageSource};
use crate::options::CompareOptions;
use crate::summary::{Summarizer, Summary};

/// Warning attached when a document yields no operative clauses.
pub const EMPTY_DOCUMENT_WARNING: &str = "empty document";

/// Stage wall-clock timings in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    /// Document A preprocessing.
    pub parse_a: f64,
    /// Document B preprocessing.
    pub parse_b: f64,
    /// Alignment.
    pub align: f64,
    /// Delta interpretation plus summarisation.
    pub diff: f64,
    /// End-to-end comparison.
    pub total: f64,
}

/// Final assembled output of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    /// Counts and bullets.
    pub summary: Summary,
    /// Ordered clause matches.
    pub matches: Vec<ClauseMatch>,
    /// Document A block ids deliberately excluded from matching.
    pub unmapped_a: Vec<String>,
    /// Document B block ids deliberately excluded from matching.
    pub unmapped_b: Vec<String>,
    /// Non-fatal warnings raised along the way.
    pub warnings: Vec<String>,
    /// Stage timings.
    pub timings_ms: Timings,
}

/// Everything the pipeline derives from a single document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentArtifacts {
    /// Content-addressed document id.
    pub doc_id: String,
    /// All layout blocks, admin included.
    pub blocks: Vec<Block>,
    /// Harvested definitions.
    pub definitions: Vec<Definition>,
    /// Clause type per block, parallel to `blocks`.
    pub clause_types: Vec<ClauseType>,
    /// Enriched non-admin clauses.
    pub clauses: Vec<Clause>,
    /// Warnings raised while preprocessing.
    pub warnings: Vec<String>,
}

impl DocumentArtifacts {
    /// Artifacts for a document that could not be parsed.
    fn empty(doc_id: String) -> Self {
        Self {
            doc_id,
            blocks: Vec::new(),
            definitions: Vec::new(),
            clause_types: Vec::new(),
            clauses: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Ids of blocks excluded from matching as furniture.
    pub fn admin_block_ids(&self) -> Vec<String> {
        self.blocks
            .iter()
            .filter(|block| block.is_admin)
            .map(|block| block.block_id.clone())
            .collect()
    }

    /// Clause lookup keyed by block id.
    pub fn clause_map(&self) -> BTreeMap<String, Clause> {
        self.clauses
            .iter()
            .map(|clause| (clause.id().to_string(), clause.clone()))
            .collect()
    }
}

/// The Universal Clause Comparer stage chain.
pub struct Pipeline {
    options: CompareOptions,
    embedder: Arc<dyn Embedder>,
    source: Arc<dyn PageSource>,
}

impl Pipeline {
    /// Builds a pipeline over the given backend and page source.
    pub fn new(
        options: CompareOptions,
        embedder: Arc<dyn Embedder>,
        source: Arc<dyn PageSource>,
    ) -> Self {
        Self {
            options,
            embedder,
            source,
        }
    }

    /// Options the pipeline was built with.
    pub fn options(&self) -> &CompareOptions {
        &self.options
    }

    /// Segment 1/5: raw bytes into ordered blocks.
    pub fn layout_stage(&self, bytes: &[u8]) -> Result<(String, Vec<Block>), PipelineError> {
        let doc_id = doc_id_for(bytes);
        let pages = self.source.pages(bytes)?;
        let blocks = LayoutExtractor::default().extract(&doc_id, &pages)?;
        Ok((doc_id, blocks))
    }

    /// Segment 2/6: defined-term harvesting.
    pub fn definitions_stage(&self, blocks: &[Block]) -> Vec<Definition> {
        DefinitionResolver.resolve(blocks)
    }

    /// Segment 3/7: clause classification; flags furniture in place.
    pub fn classification_stage(&self, blocks: &mut [Block]) -> Vec<ClauseType> {
        ClauseClassifier.classify_all(blocks)
    }

    /// Segment 4/8: DNA extraction over expanded text.
    pub fn dna_stage(
        &self,
        blocks: &[Block],
        types: &[ClauseType],
        definitions: &[Definition],
    ) -> Vec<Clause> {
        let expanded: Vec<String> = blocks
            .iter()
            .map(|block| DefinitionResolver::expand(&block.text, definitions))
            .collect();
        DnaExtractor.enrich(blocks, types, &expanded)
    }

    /// Segments 1-4 (or 5-8) for one document.
    pub fn preprocess(&self, bytes: &[u8]) -> Result<DocumentArtifacts, PipelineError> {
        let (doc_id, mut blocks) = self.layout_stage(bytes)?;
        let definitions = self.definitions_stage(&blocks);
        let clause_types = self.classification_stage(&mut blocks);
        let clauses = self.dna_stage(&blocks, &clause_types, &definitions);
        let mut warnings = Vec::new();
        if clauses.is_empty() {
            warnings.push(EMPTY_DOCUMENT_WARNING.to_string());
        }
        Ok(DocumentArtifacts {
            doc_id,
            blocks,
            definitions,
            clause_types,
            clauses,
            warnings,
        })
    }

    /// Preprocessing that tolerates a missing text layer.
    ///
    /// A parse failure becomes empty artifacts plus a warning so the pair
    /// comparison can continue on the side that did parse. Other errors
    /// propagate.
    pub fn preprocess_lenient(
        &self,
        bytes: &[u8],
        label: &str,
    ) -> Result<(DocumentArtifacts, bool), PipelineError> {
        match self.preprocess(bytes) {
            Ok(artifacts) => Ok((artifacts, true)),
            Err(PipelineError::Parse(message)) => {
                let mut artifacts = DocumentArtifacts::empty(doc_id_for(bytes));
                artifacts
                    .warnings
                    .push(format!("document {label} failed to parse: {message}"));
                Ok((artifacts, false))
            }
            Err(err) => Err(err),
        }
    }

    /// Segment 9: alignment.
    pub fn alignment_stage(
        &self,
        clauses_a: &[Clause],
        clauses_b: &[Clause],
    ) -> AlignmentOutcome {
        Aligner::new(self.options.clone()).align(self.embedder.as_ref(), clauses_a, clauses_b)
    }

    /// Segment 10: delta interpretation in place.
    pub fn delta_stage(
        &self,
        matches: &mut [ClauseMatch],
        clauses_a: &BTreeMap<String, Clause>,
        clauses_b: &BTreeMap<String, Clause>,
    ) {
        DeltaInterpreter::new(self.options.clone()).interpret_all(matches, clauses_a, clauses_b);
    }

    /// Segment 11: summary.
    pub fn summary_stage(
        &self,
        matches: &[ClauseMatch],
        clauses_a: &BTreeMap<String, Clause>,
        clauses_b: &BTreeMap<String, Clause>,
    ) -> Summary {
        Summarizer.summarize(matches, clauses_a, clauses_b)
    }

    /// Runs the full chain synchronously over two raw documents.
    pub fn compare(
        &self,
        bytes_a: &[u8],
        bytes_b: &[u8],
    ) -> Result<ComparisonResult, PipelineError> {
        let total_start = Instant::now();

        let parse_start = Instant::now();
        let (artifacts_a, parsed_a) = self.preprocess_lenient(bytes_a, "A")?;
        let parse_a = elapsed_ms(parse_start);

        let parse_start = Instant::now();
        let (artifacts_b, parsed_b) = self.preprocess_lenient(bytes_b, "B")?;
        let parse_b = elapsed_ms(parse_start);

        if !parsed_a && !parsed_b {
            return Err(PipelineError::Parse(
                "neither document has an extractable text layer".into(),
            ));
        }

        let align_start = Instant::now();
        let outcome = self.alignment_stage(&artifacts_a.clauses, &artifacts_b.clauses);
        let align = elapsed_ms(align_start);

        let diff_start = Instant::now();
        let mut matches = outcome.matches;
        let clauses_a = artifacts_a.clause_map();
        let clauses_b = artifacts_b.clause_map();
        self.delta_stage(&mut matches, &clauses_a, &clauses_b);
        sort_matches(&mut matches);
        let summary = self.summary_stage(&matches, &clauses_a, &clauses_b);
        let diff = elapsed_ms(diff_start);

        let mut warnings = Vec::new();
        warnings.extend(artifacts_a.warnings.iter().cloned());
        warnings.extend(artifacts_b.warnings.iter().cloned());
        warnings.extend(outcome.warnings);

        Ok(ComparisonResult {
            summary,
            matches,
            unmapped_a: artifacts_a.admin_block_ids(),
            unmapped_b: artifacts_b.admin_block_ids(),
            warnings,
            timings_ms: Timings {
                parse_a,
                parse_b,
                align,
                diff,
                total: elapsed_ms(total_start),
            },
        })
    }

}

/// Result ordering: status rank, then materiality descending, then the
/// surviving side's first page.
pub fn sort_matches(matches: &mut [ClauseMatch]) {
    matches.sort_by(|x, y| {
        x.status
            .rank()
            .cmp(&y.status.rank())
            .then_with(|| y.materiality_score.total_cmp(&x.materiality_score))
            .then_with(|| surviving_page(x).cmp(&surviving_page(y)))
            .then_with(|| x.a_id.cmp(&y.a_id))
            .then_with(|| x.b_id.cmp(&y.b_id))
    });
}

fn surviving_page(m: &ClauseMatch) -> u32 {
    m.evidence
        .b
        .or(m.evidence.a)
        .map(|span| span.page_start)
        .unwrap_or(0)
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
