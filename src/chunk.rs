//! Strategy-based text chunker.
//!
//! Splits extracted text into ordered [`Chunk`]s no longer than
//! `max_chars` characters. Every chunk is an exact span of the input:
//! `start_offset`/`end_offset` are character offsets and the chunk text is
//! the input sliced at those offsets, trimmed of surrounding whitespace.
//!
//! Four strategies are available:
//!
//! - **Fixed**: sliding window with `overlap` characters shared between
//!   neighbours, preferring to break at whitespace.
//! - **Paragraph**: blank-line separated paragraphs, merged up to the limit.
//! - **Sentence**: abbreviation-aware sentence boundaries, merged up to the
//!   limit.
//! - **Code**: top-level definitions found by brace depth and indentation.
//!
//! Any segment that alone exceeds the limit is split with the fixed
//! window.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::extract::is_code_type;
use crate::models::{Chunk, ChunkType};

/// Words that end in a period without ending a sentence.
const ABBREVIATIONS: &[&str] = &[
    "e.g", "i.e", "etc", "vs", "cf", "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "no",
    "fig", "inc", "ltd", "co", "approx", "dept", "est", "a.m", "p.m",
];

/// Line prefixes that open a top-level definition in common languages.
const DEFINITION_PREFIXES: &[&str] = &[
    "fn ", "pub ", "async ", "impl", "struct ", "enum ", "trait ", "mod ", "def ", "class ",
    "function ", "export ", "interface ", "type ", "func ", "public ", "private ",
    "protected ", "static ",
];

/// Line prefixes for decorators and attributes that belong to the next
/// definition.
const ATTRIBUTE_PREFIXES: &[&str] = &["@", "#["];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStrategy {
    Fixed,
    Paragraph,
    Sentence,
    Code,
}

impl ChunkStrategy {
    /// Default strategy for a detected file type.
    pub fn for_file_type(file_type: &str) -> Self {
        if is_code_type(file_type) {
            return ChunkStrategy::Code;
        }
        match file_type {
            "markdown" => ChunkStrategy::Paragraph,
            "pdf" | "docx" => ChunkStrategy::Sentence,
            _ => ChunkStrategy::Fixed,
        }
    }

    /// Resolve a configured strategy name; `auto` defers to the file type.
    pub fn resolve(configured: &str, file_type: &str) -> Self {
        match configured.parse::<ChunkStrategy>() {
            Ok(strategy) => strategy,
            Err(_) => Self::for_file_type(file_type),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStrategy::Fixed => "fixed",
            ChunkStrategy::Paragraph => "paragraph",
            ChunkStrategy::Sentence => "sentence",
            ChunkStrategy::Code => "code",
        }
    }

    fn chunk_type(&self) -> ChunkType {
        match self {
            ChunkStrategy::Fixed => ChunkType::Text,
            ChunkStrategy::Paragraph => ChunkType::Paragraph,
            ChunkStrategy::Sentence => ChunkType::Sentence,
            ChunkStrategy::Code => ChunkType::Code,
        }
    }
}

impl FromStr for ChunkStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(ChunkStrategy::Fixed),
            "paragraph" => Ok(ChunkStrategy::Paragraph),
            "sentence" => Ok(ChunkStrategy::Sentence),
            "code" => Ok(ChunkStrategy::Code),
            other => Err(format!("unknown chunking strategy: {}", other)),
        }
    }
}

impl fmt::Display for ChunkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chunk before it is assigned to a file.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpan {
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub chunk_type: ChunkType,
}

#[derive(Debug, Clone, Copy)]
pub struct FileChunker {
    max_chars: usize,
    overlap: usize,
}

impl FileChunker {
    /// `max_chars` is raised to at least 1 and `overlap` clamped below it.
    pub fn new(max_chars: usize, overlap: usize) -> Self {
        let max_chars = max_chars.max(1);
        Self {
            max_chars,
            overlap: overlap.min(max_chars - 1),
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.max_chars, config.overlap_chars)
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Split `text` into chunks owned by `file_id`, indexed from 0.
    pub fn chunk(&self, file_id: &str, text: &str, strategy: ChunkStrategy) -> Vec<Chunk> {
        self.split(text, strategy)
            .into_iter()
            .enumerate()
            .map(|(i, span)| Chunk {
                chunk_id: Uuid::new_v4().to_string(),
                file_id: file_id.to_string(),
                chunk_index: i as i64,
                text: span.text,
                start_offset: span.start,
                end_offset: span.end,
                chunk_type: span.chunk_type,
            })
            .collect()
    }

    /// Split `text` into ordered spans.
    pub fn split(&self, text: &str, strategy: ChunkStrategy) -> Vec<ChunkSpan> {
        let doc = Doc::new(text);
        let Some(whole) = doc.trim(Range::new(0, doc.len())) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        if whole.len() <= self.max_chars {
            out.push(doc.span(whole, strategy.chunk_type()));
            return out;
        }

        match strategy {
            ChunkStrategy::Fixed => self.window(&doc, whole, ChunkType::Text, &mut out),
            ChunkStrategy::Paragraph => {
                let segments = paragraphs(&doc);
                self.merge(&doc, &segments, ChunkType::Paragraph, &mut out);
            }
            ChunkStrategy::Sentence => {
                let segments = sentences(&doc);
                self.merge(&doc, &segments, ChunkType::Sentence, &mut out);
            }
            ChunkStrategy::Code => match code_blocks(&doc) {
                Some(segments) => self.merge(&doc, &segments, ChunkType::Code, &mut out),
                None => self.window(&doc, whole, ChunkType::Text, &mut out),
            },
        }
        out
    }

    /// Greedily merge adjacent segments while the merged span fits.
    fn merge(&self, doc: &Doc, segments: &[Range], chunk_type: ChunkType, out: &mut Vec<ChunkSpan>) {
        let mut group: Option<Range> = None;
        for seg in segments.iter().filter_map(|s| doc.trim(*s)) {
            if seg.len() > self.max_chars {
                if let Some(g) = group.take() {
                    out.push(doc.span(g, chunk_type));
                }
                self.window(doc, seg, chunk_type, out);
                continue;
            }
            group = match group {
                Some(g) if seg.end - g.start <= self.max_chars => Some(Range::new(g.start, seg.end)),
                Some(g) => {
                    out.push(doc.span(g, chunk_type));
                    Some(seg)
                }
                None => Some(seg),
            };
        }
        if let Some(g) = group {
            out.push(doc.span(g, chunk_type));
        }
    }

    /// Fixed-size sliding window over `range`.
    fn window(&self, doc: &Doc, range: Range, chunk_type: ChunkType, out: &mut Vec<ChunkSpan>) {
        let mut start = range.start;
        while start < range.end {
            let mut end = (start + self.max_chars).min(range.end);
            if end < range.end {
                // Prefer a whitespace break in the back half of the window.
                let floor = start + self.max_chars / 2;
                if let Some(p) = (floor + 1..end).rev().find(|&p| doc.chars[p].is_whitespace()) {
                    end = p;
                }
            }
            if let Some(piece) = doc.trim(Range::new(start, end)) {
                out.push(doc.span(piece, chunk_type));
            }
            if end >= range.end {
                break;
            }
            start = end.saturating_sub(self.overlap).max(start + 1);
            while start < range.end && doc.chars[start].is_whitespace() {
                start += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Range {
    start: usize,
    end: usize,
}

impl Range {
    fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    fn len(&self) -> usize {
        self.end - self.start
    }
}

/// Text indexed by character, with byte positions for slicing.
struct Doc<'a> {
    text: &'a str,
    chars: Vec<char>,
    byte_at: Vec<usize>,
}

impl<'a> Doc<'a> {
    fn new(text: &'a str) -> Self {
        let mut chars = Vec::with_capacity(text.len());
        let mut byte_at = Vec::with_capacity(text.len() + 1);
        for (b, c) in text.char_indices() {
            chars.push(c);
            byte_at.push(b);
        }
        byte_at.push(text.len());
        Self {
            text,
            chars,
            byte_at,
        }
    }

    fn len(&self) -> usize {
        self.chars.len()
    }

    fn slice(&self, r: Range) -> &'a str {
        &self.text[self.byte_at[r.start]..self.byte_at[r.end]]
    }

    /// Shrink to the non-whitespace core; `None` when nothing is left.
    fn trim(&self, r: Range) -> Option<Range> {
        let mut start = r.start;
        let mut end = r.end;
        while start < end && self.chars[start].is_whitespace() {
            start += 1;
        }
        while end > start && self.chars[end - 1].is_whitespace() {
            end -= 1;
        }
        (start < end).then_some(Range::new(start, end))
    }

    fn span(&self, r: Range, chunk_type: ChunkType) -> ChunkSpan {
        ChunkSpan {
            text: self.slice(r).to_string(),
            start: r.start,
            end: r.end,
            chunk_type,
        }
    }

    /// Lines as character ranges, newline excluded.
    fn lines(&self) -> Vec<Range> {
        let mut lines = Vec::new();
        let mut start = 0;
        for (i, c) in self.chars.iter().enumerate() {
            if *c == '\n' {
                lines.push(Range::new(start, i));
                start = i + 1;
            }
        }
        lines.push(Range::new(start, self.len()));
        lines
    }

    fn is_blank(&self, r: Range) -> bool {
        self.chars[r.start..r.end].iter().all(|c| c.is_whitespace())
    }
}

/// Maximal runs of non-blank lines.
fn paragraphs(doc: &Doc) -> Vec<Range> {
    let mut out = Vec::new();
    let mut current: Option<Range> = None;
    for line in doc.lines() {
        if doc.is_blank(line) {
            if let Some(p) = current.take() {
                out.push(p);
            }
        } else {
            current = Some(match current {
                Some(p) => Range::new(p.start, line.end),
                None => line,
            });
        }
    }
    out.extend(current);
    out
}

/// Sentence ranges covering the whole document.
fn sentences(doc: &Doc) -> Vec<Range> {
    let chars = &doc.chars;
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < chars.len() {
        if matches!(chars[i], '.' | '!' | '?') {
            let mut end = i + 1;
            while end < chars.len() && matches!(chars[end], '"' | '\'' | ')' | ']' | '.' | '!' | '?') {
                end += 1;
            }
            let at_break = end == chars.len() || chars[end].is_whitespace();
            if at_break && !(chars[i] == '.' && is_abbreviation(chars, start, i)) {
                out.push(Range::new(start, end));
                start = end;
                i = end;
                continue;
            }
            i = end;
            continue;
        }
        i += 1;
    }
    if start < chars.len() {
        out.push(Range::new(start, chars.len()));
    }
    out
}

/// Whether the word ending at the period `dot` is an abbreviation or an
/// initial.
fn is_abbreviation(chars: &[char], floor: usize, dot: usize) -> bool {
    let mut begin = dot;
    while begin > floor && !chars[begin - 1].is_whitespace() && chars[begin - 1] != '(' {
        begin -= 1;
    }
    let word: String = chars[begin..dot].iter().collect();
    if word.is_empty() {
        return false;
    }
    let mut letters = word.chars();
    if let (Some(c), None) = (letters.next(), letters.next()) {
        if c.is_uppercase() {
            return true;
        }
    }
    let lower = word.to_lowercase();
    ABBREVIATIONS.contains(&lower.as_str())
}

/// Top-level definition blocks, or `None` when fewer than two are found.
fn code_blocks(doc: &Doc) -> Option<Vec<Range>> {
    let mut starts = Vec::new();
    let mut depth: i64 = 0;
    let mut after_attribute = false;

    for line in doc.lines() {
        let content = doc.slice(line);
        let top_level = depth <= 0 && !content.starts_with(char::is_whitespace);
        if top_level && !content.is_empty() {
            let is_attr = ATTRIBUTE_PREFIXES.iter().any(|p| content.starts_with(p));
            let is_def = DEFINITION_PREFIXES.iter().any(|p| content.starts_with(p));
            if (is_attr || is_def) && !after_attribute {
                starts.push(line.start);
            }
            after_attribute = is_attr;
        } else if !content.trim().is_empty() {
            after_attribute = false;
        }
        for c in content.chars() {
            match c {
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
        }
    }

    if starts.len() < 2 {
        return None;
    }
    let mut blocks = Vec::with_capacity(starts.len() + 1);
    if starts[0] > 0 {
        blocks.push(Range::new(0, starts[0]));
    }
    for (i, &s) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(doc.len());
        blocks.push(Range::new(s, end));
    }
    Some(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn spans(text: &str, max: usize, overlap: usize, strategy: ChunkStrategy) -> Vec<ChunkSpan> {
        FileChunker::new(max, overlap).split(text, strategy)
    }

    fn char_slice(text: &str, start: usize, end: usize) -> String {
        text.chars().skip(start).take(end - start).collect()
    }

    #[test]
    fn empty_and_blank_input_yield_nothing() {
        for strategy in [
            ChunkStrategy::Fixed,
            ChunkStrategy::Paragraph,
            ChunkStrategy::Sentence,
            ChunkStrategy::Code,
        ] {
            assert!(spans("", 100, 10, strategy).is_empty());
            assert!(spans("  \n\n\t ", 100, 10, strategy).is_empty());
        }
    }

    #[test]
    fn short_text_is_one_chunk() {
        let out = spans("  Hello, world!\n", 100, 10, ChunkStrategy::Sentence);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "Hello, world!");
        assert_eq!((out[0].start, out[0].end), (2, 15));
    }

    #[test]
    fn fixed_window_overlaps() {
        let text = "abcdefghijklmnopqrstuvwxyz";
        let out = spans(text, 10, 3, ChunkStrategy::Fixed);
        assert_eq!(out[0].text, "abcdefghij");
        assert_eq!(out[1].start, 7);
        assert!(out.iter().all(|s| s.text.chars().count() <= 10));
        assert_eq!(out.last().map(|s| s.end), Some(26));
    }

    #[test]
    fn fixed_window_prefers_whitespace() {
        let text = "alpha beta gamma delta epsilon";
        let out = spans(text, 12, 0, ChunkStrategy::Fixed);
        assert_eq!(out[0].text, "alpha beta");
    }

    #[test]
    fn paragraphs_merge_up_to_limit() {
        let text = "One.\n\nTwo.\n\nThree is longer than the others.";
        let out = spans(text, 15, 2, ChunkStrategy::Paragraph);
        assert_eq!(out[0].text, "One.\n\nTwo.");
        assert!(out.iter().all(|s| s.chunk_type == ChunkType::Paragraph));
    }

    #[test]
    fn oversize_middle_paragraph_is_split_in_order() {
        let p1 = "a".repeat(50);
        let p2 = (0..200).map(|_| "word").collect::<Vec<_>>().join(" ");
        let p2 = &p2[..800];
        let p3 = "c".repeat(50);
        let text = format!("{}\n\n{}\n\n{}", p1, p2, p3);

        let out = spans(&text, 500, 50, ChunkStrategy::Paragraph);
        assert!(out.len() >= 4);
        assert_eq!(out[0].text, p1);
        assert_eq!(out.last().map(|s| s.text.as_str()), Some(p3.as_str()));

        let p2_start = 52;
        let p2_end = p2_start + 800;
        let middle = &out[1..out.len() - 1];
        assert!(middle.len() >= 2);
        for pair in middle.windows(2) {
            assert!(pair[0].start < pair[1].start);
        }
        for s in middle {
            assert!(s.start >= p2_start && s.end <= p2_end);
            assert!(s.text.chars().count() <= 500);
        }
    }

    #[test]
    fn sentences_respect_abbreviations() {
        let text = "Dr. Smith arrived at 3.5 p.m. today. He left, e.g. early! Did J. Doe stay?";
        let doc = Doc::new(text);
        let found: Vec<&str> = sentences(&doc)
            .into_iter()
            .filter_map(|r| doc.trim(r))
            .map(|r| doc.slice(r))
            .collect();
        assert_eq!(found[0], "Dr. Smith arrived at 3.5 p.m. today.");
        assert_eq!(found[1], "He left, e.g. early!");
        assert_eq!(found[2], "Did J. Doe stay?");
    }

    #[test]
    fn code_splits_on_top_level_definitions() {
        let text = "use std::io;\n\nfn one() {\n    if true {\n        println!(\"x\");\n    }\n}\n\n#[test]\nfn two() {\n    let y = 2;\n}\n";
        let out = spans(text, 40, 5, ChunkStrategy::Code);
        assert_eq!(out[0].text, "use std::io;");
        assert!(out.iter().any(|s| s.text.starts_with("fn one()")));
        assert!(out.iter().any(|s| s.text.starts_with("#[test]\nfn two()")));
        assert!(out.iter().all(|s| s.chunk_type == ChunkType::Code));
    }

    #[test]
    fn python_blocks_use_indentation() {
        let body = "    x = 1\n".repeat(3);
        let text = format!("def a():\n{body}\n@decorator\ndef b():\n{body}\nclass C:\n    def m(self):\n        pass\n");
        let out = spans(&text, 60, 0, ChunkStrategy::Code);
        assert!(out.iter().any(|s| s.text.starts_with("@decorator\ndef b()")));
        assert!(out.iter().any(|s| s.text.starts_with("class C:") && s.text.contains("def m")));
    }

    #[test]
    fn unstructured_code_falls_back_to_fixed() {
        let text = "x".repeat(120);
        let out = spans(&text, 50, 0, ChunkStrategy::Code);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|s| s.chunk_type == ChunkType::Text));
    }

    #[test]
    fn chunk_assigns_contiguous_indices() {
        let text = "First.\n\nSecond.\n\nThird.";
        let chunks = FileChunker::new(8, 0).chunk("file-1", text, ChunkStrategy::Paragraph);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
            assert_eq!(c.file_id, "file-1");
        }
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn strategy_selection() {
        assert_eq!(ChunkStrategy::for_file_type("rust"), ChunkStrategy::Code);
        assert_eq!(ChunkStrategy::for_file_type("markdown"), ChunkStrategy::Paragraph);
        assert_eq!(ChunkStrategy::for_file_type("pdf"), ChunkStrategy::Sentence);
        assert_eq!(ChunkStrategy::for_file_type("text"), ChunkStrategy::Fixed);
        assert_eq!(ChunkStrategy::resolve("auto", "python"), ChunkStrategy::Code);
        assert_eq!(ChunkStrategy::resolve("sentence", "python"), ChunkStrategy::Sentence);
    }

    #[test]
    fn overlap_is_clamped() {
        let c = FileChunker::new(5, 10);
        assert_eq!(c.overlap(), 4);
        assert_eq!(FileChunker::new(0, 0).max_chars(), 1);
    }

    fn strategy() -> impl Strategy<Value = ChunkStrategy> {
        prop_oneof![
            Just(ChunkStrategy::Fixed),
            Just(ChunkStrategy::Paragraph),
            Just(ChunkStrategy::Sentence),
            Just(ChunkStrategy::Code),
        ]
    }

    proptest! {
        #[test]
        fn chunks_are_bounded_exact_and_cover_text(
            text in "[a-zé{}. \n]{0,400}",
            max in 1usize..80,
            overlap in 0usize..40,
            strategy in strategy(),
        ) {
            let out = spans(&text, max, overlap, strategy);
            let chars: Vec<char> = text.chars().collect();
            let mut covered = vec![false; chars.len()];

            for s in &out {
                prop_assert!(s.text.chars().count() <= max);
                prop_assert!(!s.text.trim().is_empty());
                prop_assert_eq!(&s.text, &char_slice(&text, s.start, s.end));
                for c in covered.iter_mut().take(s.end).skip(s.start) {
                    *c = true;
                }
            }
            for pair in out.windows(2) {
                prop_assert!(pair[0].start < pair[1].start);
            }
            for (i, c) in chars.iter().enumerate() {
                if !c.is_whitespace() {
                    prop_assert!(covered[i], "char {} at {} not covered", c, i);
                }
            }
            if !text.trim().is_empty() && text.trim().chars().count() <= max {
                prop_assert_eq!(out.len(), 1);
            }
        }
    }
}
