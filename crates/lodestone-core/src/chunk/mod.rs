//! Text chunkers.
//!
//! A [`Chunker`] splits extracted document text into ordered
//! [`TextChunk`]s. [`BaseChunker`] implements four generic strategies;
//! [`AdaptiveChunker`](adaptive::AdaptiveChunker) inspects the content
//! type and text to pick a structure-aware splitter, falling back to
//! sentence splitting with overlap.
//!
//! Sizes (`chunk_size`, `overlap`, `min_size`) are measured in bytes of
//! UTF-8 text. Splits always land on char boundaries.
//!
//! # Strategies
//!
//! | Strategy | Boundaries |
//! |----------|-----------|
//! | `fixed` | windows of `chunk_size` snapped back to whitespace, `overlap` bytes shared |
//! | `sentence` | whole sentences packed up to `chunk_size`, trailing sentences up to `overlap` repeated |
//! | `paragraph` | blank-line paragraphs packed up to `chunk_size` |
//! | `semantic` | sentences grouped until vocabulary drifts away from the running chunk |
//!
//! Every strategy guarantees contiguous positions `0..N` and drops
//! whitespace-only pieces. Empty text yields no chunks.

pub mod adaptive;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub use adaptive::{detect_kind, AdaptiveChunker, DocumentKind};

static SENTENCE_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[.!?]+["')\]]*(?:\s+|$)"#).expect("invalid sentence regex"));

/// Vocabulary overlap below which the semantic strategy starts a new chunk.
const SEMANTIC_DRIFT_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    Fixed,
    #[default]
    Sentence,
    Paragraph,
    Semantic,
}

impl ChunkStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStrategy::Fixed => "fixed",
            ChunkStrategy::Sentence => "sentence",
            ChunkStrategy::Paragraph => "paragraph",
            ChunkStrategy::Semantic => "semantic",
        }
    }
}

impl fmt::Display for ChunkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed" => Ok(ChunkStrategy::Fixed),
            "sentence" => Ok(ChunkStrategy::Sentence),
            "paragraph" => Ok(ChunkStrategy::Paragraph),
            "semantic" => Ok(ChunkStrategy::Semantic),
            other => bail!(
                "unknown chunk strategy '{}' (expected fixed, sentence, paragraph, or semantic)",
                other
            ),
        }
    }
}

/// Chunker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    pub strategy: ChunkStrategy,
    /// Target maximum chunk size.
    pub chunk_size: usize,
    /// Bytes shared between consecutive chunks (fixed and sentence only).
    pub overlap: usize,
    /// Pieces smaller than this are merged into a neighbour when they fit.
    pub min_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkStrategy::Sentence,
            chunk_size: 1000,
            overlap: 100,
            min_size: 50,
        }
    }
}

impl ChunkerConfig {
    /// `chunk_size` of at least 1 and `overlap` strictly below half of it.
    fn sanitized(mut self) -> Self {
        self.chunk_size = self.chunk_size.max(1);
        self.overlap = self.overlap.min(self.chunk_size / 2);
        self
    }
}

/// A piece of document text with its ordinal position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub content: String,
    /// Zero-based index in the emitted sequence.
    pub position: usize,
}

/// Splits text into ordered chunks.
pub trait Chunker: Send + Sync {
    fn name(&self) -> &str;

    /// Split `text`. `content_type` may steer structure-aware chunkers.
    fn chunk(&self, text: &str, content_type: &str) -> Vec<TextChunk>;
}

/// Strategy-driven chunker with no structural awareness.
#[derive(Debug, Clone, Default)]
pub struct BaseChunker {
    config: ChunkerConfig,
}

impl BaseChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self {
            config: config.sanitized(),
        }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Split with the configured strategy, before position assignment.
    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(self.config.strategy, text)
    }

    pub fn split_with(&self, strategy: ChunkStrategy, text: &str) -> Vec<String> {
        let c = &self.config;
        if text.trim().is_empty() {
            return Vec::new();
        }
        match strategy {
            ChunkStrategy::Fixed => split_fixed(text, c.chunk_size, c.overlap),
            ChunkStrategy::Sentence => merge_small(
                split_sentence_windows(text, c.chunk_size, c.overlap),
                c.min_size,
                c.chunk_size,
            ),
            ChunkStrategy::Paragraph => merge_small(
                split_paragraphs(text, c.chunk_size),
                c.min_size,
                c.chunk_size,
            ),
            ChunkStrategy::Semantic => merge_small(
                split_semantic(text, c.chunk_size, c.min_size),
                c.min_size,
                c.chunk_size,
            ),
        }
    }
}

impl Chunker for BaseChunker {
    fn name(&self) -> &str {
        self.config.strategy.as_str()
    }

    fn chunk(&self, text: &str, _content_type: &str) -> Vec<TextChunk> {
        finalize(self.split(text))
    }
}

/// Drop blank pieces and assign contiguous positions.
pub fn finalize(pieces: Vec<String>) -> Vec<TextChunk> {
    pieces
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .enumerate()
        .map(|(position, content)| TextChunk { content, position })
        .collect()
}

/// Split text into trimmed sentences.
pub fn split_sentences(text: &str) -> Vec<String> {
    let text = text.trim();
    let mut sentences = Vec::new();
    let mut last_end = 0;

    for mat in SENTENCE_END.find_iter(text) {
        let s = text[last_end..mat.end()].trim();
        if !s.is_empty() {
            sentences.push(s.to_string());
        }
        last_end = mat.end();
    }
    if last_end < text.len() {
        let s = text[last_end..].trim();
        if !s.is_empty() {
            sentences.push(s.to_string());
        }
    }
    sentences
}

/// Pack units into pieces no larger than `max` (joined by `sep`).
///
/// A unit that is larger than `max` on its own is hard-split.
pub fn pack(units: &[String], max: usize, sep: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();

    for unit in units {
        let unit = unit.trim_end();
        if unit.trim().is_empty() {
            continue;
        }
        let would_be = if buf.is_empty() {
            unit.len()
        } else {
            buf.len() + sep.len() + unit.len()
        };
        if would_be > max && !buf.is_empty() {
            out.push(std::mem::take(&mut buf));
        }
        if unit.len() > max {
            out.extend(hard_split(unit, max));
            continue;
        }
        if !buf.is_empty() {
            buf.push_str(sep);
        }
        buf.push_str(unit);
    }
    if !buf.is_empty() {
        out.push(buf);
    }
    out
}

/// Split `text` into pieces of at most `max` bytes, preferring newline
/// then space boundaries.
pub fn hard_split(text: &str, max: usize) -> Vec<String> {
    let max = max.max(1);
    let mut out = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max {
            if !remaining.trim().is_empty() {
                out.push(remaining.trim().to_string());
            }
            break;
        }
        let limit = snap_to_char_boundary(remaining, max);
        let split_at = remaining[..limit]
            .rfind('\n')
            .or_else(|| remaining[..limit].rfind(' '))
            .map(|pos| pos + 1)
            .unwrap_or(limit);
        let split_at = if split_at == 0 {
            next_char_boundary(remaining, 0)
        } else {
            split_at
        };
        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[split_at..];
    }
    out
}

/// Merge pieces smaller than `min_size` into their predecessor when the
/// result still fits in `max`.
pub fn merge_small(pieces: Vec<String>, min_size: usize, max: usize) -> Vec<String> {
    if min_size == 0 {
        return pieces;
    }
    let mut out: Vec<String> = Vec::with_capacity(pieces.len());
    for piece in pieces {
        if let Some(last) = out.last_mut() {
            let small = piece.len() < min_size || last.len() < min_size;
            if small && last.len() + 1 + piece.len() <= max {
                last.push('\n');
                last.push_str(&piece);
                continue;
            }
        }
        out.push(piece);
    }
    out
}

fn split_fixed(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0usize;

    while start < text.len() {
        let mut end = snap_to_char_boundary(text, (start + size).min(text.len()));
        if end < text.len() {
            if let Some(ws) = text[start..end].rfind(char::is_whitespace) {
                if ws > size / 2 {
                    end = start + ws;
                }
            }
        }
        if end <= start {
            end = next_char_boundary(text, start);
        }
        let piece = text[start..end].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        if end >= text.len() {
            break;
        }
        let next = snap_to_char_boundary(text, end.saturating_sub(overlap));
        start = if next > start { next } else { end };
    }
    out
}

fn split_sentence_windows(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let sentences = split_sentences(text);
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0usize;
    // Number of leading sentences in `current` carried over as overlap.
    let mut carried = 0usize;

    for s in &sentences {
        if s.len() > size {
            if current.len() > carried {
                out.push(current.join(" "));
            }
            current.clear();
            current_len = 0;
            carried = 0;
            out.extend(hard_split(s, size));
            continue;
        }
        let would_be = if current.is_empty() {
            s.len()
        } else {
            current_len + 1 + s.len()
        };
        if would_be > size && current.len() > carried {
            out.push(current.join(" "));
            let mut tail: Vec<&str> = Vec::new();
            let mut tail_len = 0usize;
            for prev in current.iter().rev() {
                let add = if tail.is_empty() { prev.len() } else { prev.len() + 1 };
                if tail_len + add > overlap || tail_len + add + 1 + s.len() > size {
                    break;
                }
                tail_len += add;
                tail.insert(0, prev);
            }
            carried = tail.len();
            current = tail;
            current_len = tail_len;
        } else if would_be > size {
            current.clear();
            current_len = 0;
            carried = 0;
        }
        current_len = if current.is_empty() {
            s.len()
        } else {
            current_len + 1 + s.len()
        };
        current.push(s);
    }
    if current.len() > carried {
        out.push(current.join(" "));
    }
    out
}

fn split_paragraphs(text: &str, size: usize) -> Vec<String> {
    let mut units = Vec::new();
    for para in paragraphs(text) {
        if para.len() > size {
            units.extend(pack(&split_sentences(para), size, " "));
        } else {
            units.push(para.to_string());
        }
    }
    pack(&units, size, "\n\n")
}

/// Non-empty blank-line separated paragraphs.
pub fn paragraphs(text: &str) -> Vec<&str> {
    static BLANK_LINE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\n[ \t]*\n").expect("invalid paragraph regex"));
    BLANK_LINE
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

fn split_semantic(text: &str, size: usize, min_size: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();
    let mut vocab: HashSet<String> = HashSet::new();

    for s in split_sentences(text) {
        let words = word_set(&s);
        let drifted = buf.len() >= min_size && overlap_ratio(&vocab, &words) < SEMANTIC_DRIFT_THRESHOLD;
        let too_big = !buf.is_empty() && buf.len() + 1 + s.len() > size;
        if (drifted || too_big) && !buf.is_empty() {
            out.push(std::mem::take(&mut buf));
            vocab.clear();
        }
        if s.len() > size {
            out.extend(hard_split(&s, size));
            continue;
        }
        if !buf.is_empty() {
            buf.push(' ');
        }
        buf.push_str(&s);
        vocab.extend(words);
    }
    if !buf.is_empty() {
        out.push(buf);
    }
    out
}

fn word_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .map(str::to_lowercase)
        .collect()
}

fn overlap_ratio(vocab: &HashSet<String>, words: &HashSet<String>) -> f64 {
    if words.is_empty() || vocab.is_empty() {
        return 1.0;
    }
    let shared = words.iter().filter(|w| vocab.contains(*w)).count();
    shared as f64 / words.len() as f64
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn next_char_boundary(s: &str, index: usize) -> usize {
    s[index..]
        .char_indices()
        .nth(1)
        .map(|(i, _)| index + i)
        .unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(strategy: ChunkStrategy, size: usize, overlap: usize, min: usize) -> BaseChunker {
        BaseChunker::new(ChunkerConfig {
            strategy,
            chunk_size: size,
            overlap,
            min_size: min,
        })
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = BaseChunker::default().chunk("Hello, world!", "text/plain");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].position, 0);
        assert_eq!(chunks[0].content, "Hello, world!");
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        for s in [
            ChunkStrategy::Fixed,
            ChunkStrategy::Sentence,
            ChunkStrategy::Paragraph,
            ChunkStrategy::Semantic,
        ] {
            assert!(chunker(s, 100, 10, 0).chunk("   \n\n ", "text/plain").is_empty());
        }
    }

    #[test]
    fn test_positions_contiguous() {
        let text = (0..40)
            .map(|i| format!("Sentence number {} is here.", i))
            .collect::<Vec<_>>()
            .join(" ");
        for s in [
            ChunkStrategy::Fixed,
            ChunkStrategy::Sentence,
            ChunkStrategy::Paragraph,
            ChunkStrategy::Semantic,
        ] {
            let chunks = chunker(s, 120, 30, 0).chunk(&text, "text/plain");
            assert!(chunks.len() > 1, "{} produced one chunk", s);
            for (i, c) in chunks.iter().enumerate() {
                assert_eq!(c.position, i);
            }
        }
    }

    #[test]
    fn test_sentence_chunks_respect_size() {
        let text = "Alpha beta gamma. Delta epsilon zeta. Eta theta iota. Kappa lambda mu.";
        let chunks = chunker(ChunkStrategy::Sentence, 40, 0, 0).chunk(text, "text/plain");
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.content.len() <= 40, "{:?}", c.content);
            assert!(c.content.ends_with('.'));
        }
    }

    #[test]
    fn test_sentence_overlap_repeats_tail() {
        let text = "One one one. Two two two. Three three three. Four four four.";
        let chunks = chunker(ChunkStrategy::Sentence, 40, 15, 0).chunk(text, "text/plain");
        assert!(chunks.len() >= 2);
        let first_last = chunks[0].content.rsplit(". ").next().unwrap().to_string();
        assert!(chunks[1].content.starts_with(first_last.trim_end_matches('.')));
    }

    #[test]
    fn test_paragraph_split() {
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let chunks = chunker(ChunkStrategy::Paragraph, 30, 0, 0).chunk(text, "text/plain");
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].content, "This is paragraph two.");
    }

    #[test]
    fn test_paragraphs_pack_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunker(ChunkStrategy::Paragraph, 700, 0, 0).chunk(text, "text/plain");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.contains("Third paragraph."));
    }

    #[test]
    fn test_fixed_windows_overlap() {
        let text = "abcdefghij".repeat(10);
        let chunks = chunker(ChunkStrategy::Fixed, 30, 10, 0).chunk(&text, "text/plain");
        assert!(chunks.len() >= 4);
        assert_eq!(&chunks[0].content[20..30], &chunks[1].content[..10]);
        for c in &chunks {
            assert!(c.content.len() <= 30);
        }
    }

    #[test]
    fn test_hard_split_no_whitespace() {
        let text = "a".repeat(100);
        let pieces = hard_split(&text, 30);
        assert_eq!(pieces.len(), 4);
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn test_unicode_safety() {
        let text = "🦀".repeat(200);
        let chunks = chunker(ChunkStrategy::Fixed, 50, 10, 0).chunk(&text, "text/plain");
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(c.content.chars().all(|ch| ch == '🦀'));
        }
    }

    #[test]
    fn test_min_size_merges_fragments() {
        let text = "Tiny.\n\nAlso tiny.\n\nA paragraph that is clearly long enough to stand alone here.";
        let chunks = chunker(ChunkStrategy::Paragraph, 200, 0, 20).chunk(text, "text/plain");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.starts_with("Tiny."));
    }

    #[test]
    fn test_semantic_breaks_on_topic_shift() {
        let text = "Rust ownership rules govern memory. Ownership moves values between bindings. \
                    Borrowing lets bindings reference values. Tomatoes need warm soil outdoors. \
                    Gardeners water tomatoes every morning.";
        let chunks = chunker(ChunkStrategy::Semantic, 1000, 0, 40).chunk(text, "text/plain");
        assert!(chunks.len() >= 2);
        assert!(chunks[0].content.contains("ownership"));
        assert!(chunks.last().unwrap().content.contains("tomatoes"));
    }

    #[test]
    fn test_split_sentences() {
        let s = split_sentences("Hello there! How are you? Fine. No punctuation at end");
        assert_eq!(
            s,
            vec!["Hello there!", "How are you?", "Fine.", "No punctuation at end"]
        );
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("semantic".parse::<ChunkStrategy>().unwrap(), ChunkStrategy::Semantic);
        assert!("token".parse::<ChunkStrategy>().is_err());
    }
}
