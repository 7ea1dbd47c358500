//! Core data types that flow through indexing and retrieval.

use serde::Serialize;

use crate::error::KbError;

/// One chunk produced by the chunker before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// 0-based position within the document.
    pub chunk_index: i64,
    /// Enclosing section titles joined with `" > "`; empty when the
    /// chunk sits above any heading.
    pub heading_path: String,
    /// First source line covered, 1-based inclusive.
    pub start_line: i64,
    /// Last source line covered, 1-based inclusive.
    pub end_line: i64,
    /// Retrieval text: heading-path prefix plus body (overlap context
    /// included); line numbers always refer to the source file, not to
    /// this enriched text.
    pub text: String,
    /// SHA-256 of `text`, for per-chunk change detection.
    pub text_hash: String,
}

/// Frontmatter fields the indexer consumes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frontmatter {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    pub keywords: Vec<String>,
}

/// A document row as written to the store.
#[derive(Debug, Clone)]
pub struct DocRecord {
    pub doc_id: String,
    pub rel_path: String,
    pub title: String,
    pub summary: String,
    pub tags: Vec<String>,
    pub keywords: Vec<String>,
    pub mtime_ns: i64,
    pub size: i64,
    pub content_hash: String,
}

/// Retrieval mode selected by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Lexical,
    Semantic,
    Hybrid,
}

impl std::str::FromStr for SearchMode {
    type Err = KbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lexical" => Ok(SearchMode::Lexical),
            "semantic" => Ok(SearchMode::Semantic),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(KbError::InvalidInput(format!(
                "unknown search mode: '{other}' (use lexical, semantic, or hybrid)"
            ))),
        }
    }
}

/// Which modality contributed a result's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreSource {
    Lexical,
    Semantic,
    /// Both modalities contributed in hybrid mode.
    Hybrid,
}

impl std::fmt::Display for ScoreSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScoreSource::Lexical => "lexical",
            ScoreSource::Semantic => "semantic",
            ScoreSource::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

/// A ranked, cited search result.
///
/// `line_range` is `[start_line, end_line]`, 1-based inclusive, in the
/// source file's own numbering — the contract citation rendering
/// depends on.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub path: String,
    pub title: String,
    pub heading_path: String,
    pub line_range: [i64; 2],
    pub score: f64,
    pub source: ScoreSource,
    pub text: String,
}

/// Search results plus diagnostic notes (degraded capability, model
/// mismatch, missing embeddings).
#[derive(Debug, Clone, Serialize, Default)]
pub struct SearchOutcome {
    pub results: Vec<RetrievedChunk>,
    pub notes: Vec<String>,
}

/// Options for an indexing pass.
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    /// Discard the entire index first and reprocess every document.
    pub rebuild: bool,
    /// Compute embeddings for new chunks (best-effort).
    pub with_embeddings: bool,
    /// Restrict the pass to these relative paths; empty = whole tree.
    pub only: Vec<String>,
}

/// A per-document failure collected during an indexing pass.
#[derive(Debug, Clone, Serialize)]
pub struct IndexIssue {
    pub rel_path: String,
    pub message: String,
}

/// Outcome of an indexing pass.
#[derive(Debug, Clone, Serialize, Default)]
pub struct IndexSummary {
    pub documents_changed: u64,
    pub documents_deleted: u64,
    pub documents_unchanged: u64,
    pub chunks_written: u64,
    pub chunks_embedded: u64,
    pub errors: Vec<IndexIssue>,
}

/// Options for a repair pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct RepairOptions {
    pub with_embeddings: bool,
}

/// Outcome of a repair pass.
#[derive(Debug, Clone, Serialize, Default)]
pub struct RepairReport {
    pub rebuilt: bool,
    pub issues_found: u64,
    pub issues_fixed: u64,
    pub issues: Vec<String>,
}
