//! Heading-aware Markdown chunker.
//!
//! Splits one document's text into ordered, line-addressable chunks tied
//! to its heading structure. A stack of open headings is maintained while
//! scanning top to bottom; the stack, rendered as `"H1 > H2"`, becomes the
//! `heading_path` of every chunk emitted under it. Within a section,
//! blank-line-delimited paragraphs accumulate until the configured
//! `max_chars` budget is exceeded, carrying `overlap_chars` of trailing
//! text into the next chunk for local context. A paragraph longer than
//! the budget is split at line boundaries so line ranges stay disjoint.
//!
//! Every chunk records the first and last source line it covers, 1-based
//! inclusive, in the original file's numbering. Citation rendering and
//! question answering depend on these being exact.
//!
//! Chunking is a pure function of `(text, config)`: no I/O, fully
//! deterministic.

use crate::config::ChunkingConfig;
use crate::models::{Chunk, Frontmatter};
use crate::util::sha256_text;

/// Split a document into frontmatter metadata and ordered chunks.
///
/// An empty document yields zero chunks. A document without headings
/// yields chunks with an empty `heading_path`.
pub fn chunk_markdown(text: &str, config: &ChunkingConfig) -> (Frontmatter, Vec<Chunk>) {
    let lines: Vec<&str> = text.lines().collect();
    let (frontmatter, body_start) = parse_frontmatter(&lines);

    let mut state = ChunkerState::new(config);
    let mut heading_stack: Vec<(usize, String)> = Vec::new();

    let mut para_lines: Vec<&str> = Vec::new();
    let mut para_start: i64 = 0;

    for (i, line) in lines.iter().copied().enumerate().skip(body_start) {
        if let Some((level, title)) = parse_heading(line) {
            state.close_paragraph(&mut para_lines, para_start);
            state.flush_section();
            while heading_stack
                .last()
                .is_some_and(|(open_level, _)| *open_level >= level)
            {
                heading_stack.pop();
            }
            heading_stack.push((level, title.to_string()));
            state.heading_path = heading_stack
                .iter()
                .map(|(_, t)| t.as_str())
                .collect::<Vec<_>>()
                .join(" > ");
            continue;
        }

        if line.trim().is_empty() {
            state.close_paragraph(&mut para_lines, para_start);
            continue;
        }

        if para_lines.is_empty() {
            para_start = (i + 1) as i64;
        }
        para_lines.push(line);
    }

    state.close_paragraph(&mut para_lines, para_start);
    state.flush_section();

    (frontmatter, state.chunks)
}

/// Return the first H1 title, or the fallback when none exists.
pub fn guess_title(text: &str, fallback: &str) -> String {
    for line in text.lines() {
        if let Some((1, title)) = parse_heading(line) {
            return title.to_string();
        }
    }
    fallback.to_string()
}

struct ChunkerState<'a> {
    config: &'a ChunkingConfig,
    heading_path: String,
    chunks: Vec<Chunk>,
    chunk_index: i64,
    /// Accumulated paragraphs of the open chunk.
    buf: String,
    buf_chars: usize,
    buf_start: i64,
    buf_end: i64,
    /// Overlap text carried from the previous chunk of this section.
    carry: String,
}

impl<'a> ChunkerState<'a> {
    fn new(config: &'a ChunkingConfig) -> Self {
        Self {
            config,
            heading_path: String::new(),
            chunks: Vec::new(),
            chunk_index: 0,
            buf: String::new(),
            buf_chars: 0,
            buf_start: 0,
            buf_end: 0,
            carry: String::new(),
        }
    }

    /// Fold the pending paragraph into the open chunk, emitting earlier
    /// chunks as the budget fills up.
    fn close_paragraph(&mut self, para_lines: &mut Vec<&str>, para_start: i64) {
        if para_lines.is_empty() {
            return;
        }
        let para_end = para_start + para_lines.len() as i64 - 1;
        let para_text = para_lines.join("\n");
        let para_chars = char_len(&para_text);

        if para_chars > self.config.max_chars {
            self.add_oversized_paragraph(para_lines, para_start);
        } else {
            let projected = if self.buf.is_empty() {
                para_chars
            } else {
                self.buf_chars + 2 + para_chars
            };
            if projected > self.config.max_chars
                && !self.buf.is_empty()
                && self.buf_chars >= self.config.min_chars
            {
                self.emit();
            }
            self.append(&para_text, para_start, para_end);
        }

        para_lines.clear();
    }

    /// A single paragraph over budget is split at line boundaries into
    /// consecutive pieces; the last piece stays open so following
    /// paragraphs may join it.
    fn add_oversized_paragraph(&mut self, para_lines: &[&str], para_start: i64) {
        if !self.buf.is_empty() && self.buf_chars >= self.config.min_chars {
            self.emit();
        }

        let mut piece_start = 0usize;
        let mut piece_chars = 0usize;
        let mut pieces: Vec<(usize, usize)> = Vec::new();
        for (j, line) in para_lines.iter().enumerate() {
            let line_chars = char_len(line);
            let projected = if piece_chars == 0 {
                line_chars
            } else {
                piece_chars + 1 + line_chars
            };
            // min_chars takes precedence over max_chars when they conflict
            if projected > self.config.max_chars
                && piece_chars >= self.config.min_chars
                && j > piece_start
            {
                pieces.push((piece_start, j - 1));
                piece_start = j;
                piece_chars = line_chars;
            } else {
                piece_chars = projected;
            }
        }
        pieces.push((piece_start, para_lines.len() - 1));

        let last = pieces.len() - 1;
        for (n, (from, to)) in pieces.into_iter().enumerate() {
            let text = para_lines[from..=to].join("\n");
            let start = para_start + from as i64;
            let end = para_start + to as i64;
            self.append(&text, start, end);
            if n < last {
                self.emit();
            }
        }
    }

    fn append(&mut self, text: &str, start: i64, end: i64) {
        if self.buf.is_empty() {
            self.buf_start = start;
            self.buf.push_str(text);
            self.buf_chars = char_len(text);
        } else {
            self.buf.push_str("\n\n");
            self.buf.push_str(text);
            self.buf_chars += 2 + char_len(text);
        }
        self.buf_end = end;
    }

    fn emit(&mut self) {
        let body = if self.carry.is_empty() {
            self.buf.clone()
        } else {
            format!("{}\n\n{}", self.carry, self.buf)
        };
        let text = if self.heading_path.is_empty() {
            body
        } else {
            format!("{}\n\n{}", self.heading_path, body)
        };
        self.chunks.push(Chunk {
            chunk_index: self.chunk_index,
            heading_path: self.heading_path.clone(),
            start_line: self.buf_start,
            end_line: self.buf_end,
            text_hash: sha256_text(&text),
            text,
        });
        self.chunk_index += 1;
        self.carry = char_tail(&self.buf, self.config.overlap_chars);
        self.buf.clear();
        self.buf_chars = 0;
    }

    /// Emit whatever remains of the section; short remainders are
    /// allowed as the last chunk of a section.
    fn flush_section(&mut self) {
        if !self.buf.is_empty() {
            self.emit();
        }
        self.carry.clear();
    }
}

/// Parse an ATX heading line into `(level, title)`.
fn parse_heading(line: &str) -> Option<(usize, &str)> {
    let level = line.bytes().take_while(|&b| b == b'#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &line[level..];
    if !rest.starts_with(|c: char| c.is_whitespace()) {
        return None;
    }
    let title = rest.trim();
    if title.is_empty() {
        return None;
    }
    Some((level, title))
}

/// Parse a leading `---` frontmatter fence using a simplified YAML
/// subset (scalars, inline lists, dash lists). Returns the parsed
/// metadata and the 0-based index of the first body line. An
/// unterminated fence is treated as body text.
pub fn parse_frontmatter(lines: &[&str]) -> (Frontmatter, usize) {
    let mut fm = Frontmatter::default();
    if lines.first().map(|l| l.trim()) != Some("---") {
        return (fm, 0);
    }
    let Some(end) = lines[1..].iter().position(|l| l.trim() == "---") else {
        return (fm, 0);
    };
    let end = end + 1;

    let mut pending_list: Option<String> = None;
    for raw in &lines[1..end] {
        let line = raw.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        if let Some(key) = &pending_list {
            let stripped = line.trim_start();
            if let Some(item) = stripped.strip_prefix("- ") {
                push_list_item(&mut fm, key, item.trim());
                continue;
            }
        }
        pending_list = None;
        let Some(colon) = line.find(':') else {
            continue;
        };
        let key = line[..colon].trim();
        let value = line[colon + 1..].trim();
        if key.is_empty() {
            continue;
        }
        if value.is_empty() {
            pending_list = Some(key.to_string());
            continue;
        }
        if value.starts_with('[') && value.ends_with(']') {
            let inner = &value[1..value.len() - 1];
            for item in inner.split(',') {
                let item = strip_quotes(item.trim());
                if !item.is_empty() {
                    push_list_item(&mut fm, key, item);
                }
            }
            continue;
        }
        match key {
            "title" => fm.title = Some(strip_quotes(value).to_string()),
            "summary" => fm.summary = Some(strip_quotes(value).to_string()),
            _ => {}
        }
    }

    (fm, end + 1)
}

fn push_list_item(fm: &mut Frontmatter, key: &str, item: &str) {
    let item = strip_quotes(item);
    if item.is_empty() {
        return;
    }
    let list = match key {
        "tags" => &mut fm.tags,
        "keywords" => &mut fm.keywords,
        _ => return,
    };
    if !list.iter().any(|x| x == item) {
        list.push(item.to_string());
    }
}

fn strip_quotes(s: &str) -> &str {
    s.trim_matches(|c| c == '\'' || c == '"')
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn char_tail(s: &str, n: usize) -> String {
    if n == 0 {
        return String::new();
    }
    let count = s.chars().count();
    if count <= n {
        return s.to_string();
    }
    s.chars().skip(count - n).collect()
}
