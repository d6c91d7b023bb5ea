//! Document layout extraction: page text into ordered, sectioned blocks.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::error::PipelineError;

/// Section-path components whose presence marks a block as furniture.
const ADMIN_SECTION_PREFIXES: [&str; 7] = [
    "schedule",
    "cover page",
    "policy schedule",
    "declaration",
    "index",
    "contact",
    "about us",
];

/// Placeholder section for text before the first detected heading.
pub const ROOT_SECTION: &str = "(root)";

/// Hex characters of the SHA-256 digest kept as the document id.
const DOC_ID_LEN: usize = 16;

/// Derives the content-addressed document id from raw bytes.
pub fn doc_id_for(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest
        .iter()
        .take(DOC_ID_LEN / 2)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Provider of per-page plain text for a document.
///
/// Rendering and raw text extraction stay behind this seam so the pipeline
/// can be exercised without PDF fixtures.
pub trait PageSource: Send + Sync {
    /// Returns one string per page, in page order.
    fn pages(&self, bytes: &[u8]) -> Result<Vec<String>, PipelineError>;
}

/// Extracts the text layer of a PDF.
pub struct PdfPageSource;

impl PageSource for PdfPageSource {
    fn pages(&self, bytes: &[u8]) -> Result<Vec<String>, PipelineError> {
        let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
            .map_err(|err| PipelineError::Parse(format!("pdf text extraction failed: {err}")))?;
        if pages.iter().all(|page| page.trim().is_empty()) {
            return Err(PipelineError::Parse(
                "document has no extractable text layer".into(),
            ));
        }
        Ok(pages)
    }
}

/// Treats input as pre-extracted text with form-feed page separators.
pub struct PlainTextSource;

impl PageSource for PlainTextSource {
    fn pages(&self, bytes: &[u8]) -> Result<Vec<String>, PipelineError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| PipelineError::Parse("input is not valid UTF-8 text".into()))?;
        if text.trim().is_empty() {
            return Err(PipelineError::Parse("document is empty".into()));
        }
        Ok(text.split('\u{0c}').map(str::to_string).collect())
    }
}

/// One text region of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Stable id derived from the document id and sequence number.
    pub block_id: String,
    /// Position within the document's reading order.
    pub sequence_number: usize,
    /// Collapsed block text.
    pub text: String,
    /// First page the block appears on (1-based).
    pub page_start: u32,
    /// Last page the block appears on (1-based, inclusive).
    pub page_end: u32,
    /// Optional page-space bounding box when the source provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
    /// Heading breadcrumb, outermost first; never empty.
    pub section_path: Vec<String>,
    /// True for cover-sheet/schedule furniture rather than operative text.
    pub is_admin: bool,
}

impl Block {
    /// Formats the stable block id for a document position.
    pub fn id_for(doc_id: &str, sequence_number: usize) -> String {
        format!("{doc_id}:{sequence_number:04}")
    }
}

/// Layout tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct LayoutConfig {
    /// Cap on recorded blocks to bound memory on degenerate documents.
    pub max_blocks: usize,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self { max_blocks: 4096 }
    }
}

/// Splits page text into blocks and maintains the section hierarchy.
#[derive(Clone)]
pub struct LayoutExtractor {
    config: LayoutConfig,
}

impl LayoutExtractor {
    /// Builds a new extractor.
    pub fn new(config: LayoutConfig) -> Self {
        Self { config }
    }

    /// Extracts ordered blocks from per-page text.
    pub fn extract(&self, doc_id: &str, pages: &[String]) -> Result<Vec<Block>, PipelineError> {
        let mut collector = BlockCollector::new(doc_id, &self.config);
        for (index, page) in pages.iter().enumerate() {
            let page_no = (index + 1) as u32;
            for line in page.lines() {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    collector.flush();
                    continue;
                }
                if let Some(heading) = detect_heading(trimmed) {
                    collector.flush();
                    collector.open_section(heading);
                }
                collector.push_line(trimmed, page_no);
                if collector.limit_hit() {
                    break;
                }
            }
            if collector.limit_hit() {
                break;
            }
        }
        collector.flush();
        Ok(collector.finish())
    }
}

impl Default for LayoutExtractor {
    fn default() -> Self {
        Self::new(LayoutConfig::default())
    }
}

/// A heading line with its inferred depth (1-based).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Heading {
    depth: usize,
    title: String,
}

fn numbered_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+(?:\.\d+)*)[.)]?\s+\S").expect("numbered heading regex"))
}

fn lettered_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z][.)]\s+\S").expect("lettered heading regex"))
}

/// Applies the heading heuristic: short lines that are numbered, mostly
/// uppercase, colon-terminated or title-cased open a new section.
fn detect_heading(line: &str) -> Option<Heading> {
    if line.len() < 4 || line.len() > 80 {
        return None;
    }

    if let Some(captures) = numbered_heading_re().captures(line) {
        let number = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        let depth = number.matches('.').count() + 1;
        let title = line[number.len()..]
            .trim_start_matches(['.', ')'])
            .trim()
            .trim_end_matches(':')
            .to_string();
        return Some(Heading {
            depth,
            title: if title.is_empty() {
                line.to_string()
            } else {
                title
            },
        });
    }

    if lettered_heading_re().is_match(line) {
        return Some(Heading {
            depth: 2,
            title: line[2..].trim().trim_end_matches(':').to_string(),
        });
    }

    let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
    if !letters.is_empty() {
        let upper = letters.iter().filter(|c| c.is_uppercase()).count();
        if upper as f64 / letters.len() as f64 > 0.65 {
            return Some(Heading {
                depth: 1,
                title: line.trim_end_matches(':').to_string(),
            });
        }
    }

    if line.ends_with(':') && line.split_whitespace().count() <= 8 {
        return Some(Heading {
            depth: 1,
            title: line.trim_end_matches(':').to_string(),
        });
    }

    let words: Vec<&str> = line.split_whitespace().collect();
    if words.len() <= 6
        && !line.ends_with('.')
        && !line.contains(':')
        && words
            .iter()
            .all(|word| word.chars().next().is_some_and(|c| c.is_uppercase()))
    {
        return Some(Heading {
            depth: 1,
            title: line.to_string(),
        });
    }

    None
}

/// Case-insensitive prefix match over the admin furniture list.
fn is_admin_path(section_path: &[String]) -> bool {
    section_path.iter().any(|component| {
        let lowered = component.to_lowercase();
        ADMIN_SECTION_PREFIXES
            .iter()
            .any(|prefix| lowered.starts_with(prefix))
    })
}

struct BlockCollector<'a> {
    doc_id: &'a str,
    config: &'a LayoutConfig,
    blocks: Vec<Block>,
    section_stack: Vec<String>,
    current_lines: Vec<String>,
    current_path: Vec<String>,
    current_page_start: u32,
    current_page_end: u32,
    limit_hit: bool,
}

impl<'a> BlockCollector<'a> {
    fn new(doc_id: &'a str, config: &'a LayoutConfig) -> Self {
        Self {
            doc_id,
            config,
            blocks: Vec::new(),
            section_stack: Vec::new(),
            current_lines: Vec::new(),
            current_path: vec![ROOT_SECTION.to_string()],
            current_page_start: 1,
            current_page_end: 1,
            limit_hit: false,
        }
    }

    fn limit_hit(&self) -> bool {
        self.limit_hit
    }

    /// Truncates the stack to the heading's parent depth, then pushes it.
    fn open_section(&mut self, heading: Heading) {
        self.section_stack.truncate(heading.depth - 1);
        self.section_stack.push(heading.title);
    }

    fn push_line(&mut self, line: &str, page_no: u32) {
        if self.limit_hit {
            return;
        }
        if self.current_lines.is_empty() {
            self.current_page_start = page_no;
            self.current_path = if self.section_stack.is_empty() {
                vec![ROOT_SECTION.to_string()]
            } else {
                self.section_stack.clone()
            };
        }
        self.current_page_end = page_no;
        self.current_lines.push(line.to_string());
    }

    fn flush(&mut self) {
        if self.current_lines.is_empty() {
            return;
        }
        let text = collapse_whitespace(&self.current_lines.join(" "));
        self.current_lines.clear();
        if text.is_empty() {
            return;
        }
        let sequence_number = self.blocks.len();
        let is_admin = is_admin_path(&self.current_path);
        self.blocks.push(Block {
            block_id: Block::id_for(self.doc_id, sequence_number),
            sequence_number,
            text,
            page_start: self.current_page_start,
            page_end: self.current_page_end,
            bbox: None,
            section_path: self.current_path.clone(),
            is_admin,
        });
        if self.blocks.len() >= self.config.max_blocks {
            self.limit_hit = true;
        }
    }

    fn finish(self) -> Vec<Block> {
        self.blocks
    }
}

fn collapse_whitespace(input: &str) -> String {
    let mut buf = String::with_capacity(input.len());
    let mut last_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !last_space && !buf.is_empty() {
                buf.push(' ');
            }
            last_space = true;
        } else {
            buf.push(ch);
            last_space = false;
        }
    }
    buf.trim().to_string()
}
