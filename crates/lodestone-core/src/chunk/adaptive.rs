//! Structure-aware chunking.
//!
//! [`AdaptiveChunker`] classifies a document with [`detect_kind`] (content
//! type first, then content heuristics) and routes it to a splitter that
//! respects the document's structure. Anything unrecognised is split into
//! sentences with overlap.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{
    finalize, hard_split, merge_small, pack, split_paragraphs, split_sentences, BaseChunker,
    ChunkStrategy, Chunker, ChunkerConfig, TextChunk,
};

static CODE_DECL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:pub(?:\([^)]*\))?\s+)?(?:export\s+)?(?:default\s+)?(?:async\s+)?(?:unsafe\s+)?(?:fn|struct|enum|impl|trait|mod|class|def|func|function|interface)\b",
    )
    .expect("invalid code declaration regex")
});

static CODE_COMMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?://|#|@|/\*|\*)").expect("invalid code comment regex")
});

static MD_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#{1,6}\s+\S").expect("invalid heading regex"));

static HTML_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<(?:html|head|body|div|p|h[1-6]|span|table|ul|ol|li|article|section)\b[^>]*>")
        .expect("invalid html regex")
});

static LOG_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[?\d{4}[-/]\d{2}[-/]\d{2}").expect("invalid log timestamp regex")
});

static LEGAL_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?:(?:ARTICLE|Article|SECTION|Section|CLAUSE|Clause)\s+[\dIVXLC]+|§\s*\d+|\d+(?:\.\d+)*\.?\s+[A-Z])",
    )
    .expect("invalid legal marker regex")
});

static MEDICAL_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?:CHIEF COMPLAINT|HISTORY OF PRESENT ILLNESS|PAST MEDICAL HISTORY|FAMILY HISTORY|SOCIAL HISTORY|MEDICATIONS|ALLERGIES|REVIEW OF SYSTEMS|PHYSICAL EXAM(?:INATION)?|VITAL SIGNS|LABORATORY|ASSESSMENT|DIAGNOSIS|PLAN)\b",
    )
    .expect("invalid medical marker regex")
});

static ACADEMIC_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?:\d+(?:\.\d+)*\.?\s+)?(?:ABSTRACT|INTRODUCTION|BACKGROUND|RELATED WORK|METHODS|METHODOLOGY|MATERIALS AND METHODS|EXPERIMENTS|RESULTS|DISCUSSION|CONCLUSIONS?|REFERENCES|ACKNOWLEDGE?MENTS|Abstract|Introduction|Background|Related Work|Methods|Methodology|Results|Discussion|Conclusions?|References)\s*:?\s*$",
    )
    .expect("invalid academic marker regex")
});

static SCRIPT_STYLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script\b.*?</script>|<style\b.*?</style>|<!--.*?-->")
        .expect("invalid script regex")
});

static BLOCK_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)</?(?:p|div|br|h[1-6]|li|tr|section|article|header|footer|ul|ol|table|blockquote|pre)\b[^>]*>",
    )
    .expect("invalid block tag regex")
});

static ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("invalid tag regex"));

const LEGAL_TERMS: &[&str] = &[
    "whereas",
    "hereinafter",
    "hereby",
    "pursuant to",
    "indemnif",
    "liability",
    "governing law",
    "termination",
    "the parties",
    "shall",
];

const MEDICAL_TERMS: &[&str] = &[
    "chief complaint",
    "history of present illness",
    "diagnosis",
    "patient",
    "medications",
    "allergies",
    "physical exam",
    "vital signs",
    "prescribed",
    "mg",
];

const ACADEMIC_TERMS: &[&str] = &[
    "abstract",
    "introduction",
    "methodology",
    "methods",
    "results",
    "conclusion",
    "references",
    "et al.",
    "hypothesis",
    "literature",
];

/// Distinct domain terms required before a keyword cluster counts.
const CLUSTER_THRESHOLD: usize = 3;

/// Structural classification of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Code,
    Markdown,
    Csv,
    Log,
    Legal,
    Medical,
    Academic,
    Json,
    Html,
    Text,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Code => "code",
            DocumentKind::Markdown => "markdown",
            DocumentKind::Csv => "csv",
            DocumentKind::Log => "log",
            DocumentKind::Legal => "legal",
            DocumentKind::Medical => "medical",
            DocumentKind::Academic => "academic",
            DocumentKind::Json => "json",
            DocumentKind::Html => "html",
            DocumentKind::Text => "text",
        }
    }
}

/// Classify a document from its content type, then from its text.
pub fn detect_kind(content_type: &str, text: &str) -> DocumentKind {
    match content_type {
        "text/markdown" => return DocumentKind::Markdown,
        "text/csv" => return DocumentKind::Csv,
        "text/html" => return DocumentKind::Html,
        "application/json" => return DocumentKind::Json,
        "text/x-log" => return DocumentKind::Log,
        "text/x-code" => return DocumentKind::Code,
        _ => {}
    }

    let trimmed = text.trim();
    if looks_like_json(trimmed) {
        return DocumentKind::Json;
    }
    if HTML_TAG.find_iter(trimmed).take(2).count() >= 2 {
        return DocumentKind::Html;
    }

    let lines: Vec<&str> = trimmed.lines().filter(|l| !l.trim().is_empty()).collect();
    let log_lines = lines.iter().filter(|l| LOG_LINE.is_match(l)).count();
    if log_lines >= 2 && log_lines * 10 >= lines.len() * 3 {
        return DocumentKind::Log;
    }
    if looks_like_csv(&lines) {
        return DocumentKind::Csv;
    }
    let decls = lines.iter().filter(|l| CODE_DECL.is_match(l)).count();
    let punctuated = ["{", "};", "):", "=>", "->"].iter().any(|p| trimmed.contains(p));
    if decls >= 2 && punctuated {
        return DocumentKind::Code;
    }
    if lines.iter().any(|l| MD_HEADING.is_match(l)) {
        return DocumentKind::Markdown;
    }

    let lower = trimmed.to_lowercase();
    let clusters = [
        (DocumentKind::Legal, cluster_hits(&lower, LEGAL_TERMS)),
        (DocumentKind::Medical, cluster_hits(&lower, MEDICAL_TERMS)),
        (DocumentKind::Academic, cluster_hits(&lower, ACADEMIC_TERMS)),
    ];
    let mut best: Option<(DocumentKind, usize)> = None;
    for (kind, hits) in clusters {
        if hits >= CLUSTER_THRESHOLD && best.map(|(_, b)| hits > b).unwrap_or(true) {
            best = Some((kind, hits));
        }
    }
    best.map(|(k, _)| k).unwrap_or(DocumentKind::Text)
}

fn looks_like_json(text: &str) -> bool {
    let framed = (text.starts_with('[') && text.ends_with(']'))
        || (text.starts_with('{') && text.ends_with('}'));
    framed && serde_json::from_str::<serde_json::Value>(text).is_ok()
}

fn looks_like_csv(lines: &[&str]) -> bool {
    if lines.len() < 2 {
        return false;
    }
    let sample: Vec<usize> = lines
        .iter()
        .take(10)
        .map(|l| l.matches(',').count())
        .collect();
    let header = sample[0];
    header >= 1 && sample.iter().filter(|&&c| c == header).count() * 10 >= sample.len() * 8
}

fn cluster_hits(lower: &str, terms: &[&str]) -> usize {
    terms.iter().filter(|t| lower.contains(**t)).count()
}

/// Chunker that picks a splitter per detected [`DocumentKind`].
#[derive(Debug, Clone, Default)]
pub struct AdaptiveChunker {
    base: BaseChunker,
}

impl AdaptiveChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self {
            base: BaseChunker::new(config),
        }
    }

    /// Split `text` as a document of `kind`.
    pub fn split_kind(&self, kind: DocumentKind, text: &str) -> Vec<String> {
        let c = self.base.config();
        let (size, min) = (c.chunk_size, c.min_size);
        if text.trim().is_empty() {
            return Vec::new();
        }
        match kind {
            DocumentKind::Code => merge_small(split_code(text, size), min, size),
            DocumentKind::Markdown => merge_small(split_markdown(text, size), min, size),
            DocumentKind::Csv => split_csv(text, size),
            DocumentKind::Log => split_log(text, size),
            DocumentKind::Legal => {
                merge_small(split_sections(text, &LEGAL_MARKER, size), min, size)
            }
            DocumentKind::Medical => {
                merge_small(split_sections(text, &MEDICAL_MARKER, size), min, size)
            }
            DocumentKind::Academic => {
                merge_small(split_sections(text, &ACADEMIC_MARKER, size), min, size)
            }
            DocumentKind::Json => match split_json_array(text, size) {
                Some(pieces) => pieces,
                None => self.base.split_with(ChunkStrategy::Sentence, text),
            },
            DocumentKind::Html => {
                merge_small(split_paragraphs(&strip_html(text), size), min, size)
            }
            DocumentKind::Text => self.base.split_with(ChunkStrategy::Sentence, text),
        }
    }
}

impl Chunker for AdaptiveChunker {
    fn name(&self) -> &str {
        "adaptive"
    }

    fn chunk(&self, text: &str, content_type: &str) -> Vec<TextChunk> {
        finalize(self.split_kind(detect_kind(content_type, text), text))
    }
}

/// Split on separators in order, packing the parts back up to `size`.
fn recursive_split(text: &str, size: usize, seps: &[&str]) -> Vec<String> {
    if text.len() <= size {
        return vec![text.to_string()];
    }
    match seps.split_first() {
        None => hard_split(text, size),
        Some((sep, rest)) => {
            let mut units = Vec::new();
            for part in text.split(sep) {
                if part.len() > size {
                    units.extend(recursive_split(part, size, rest));
                } else {
                    units.push(part.to_string());
                }
            }
            pack(&units, size, sep)
        }
    }
}

fn split_code(text: &str, size: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    let mut starts = vec![0usize];
    for (i, line) in lines.iter().enumerate().skip(1) {
        if CODE_DECL.is_match(line) {
            // Leading doc comments and attributes travel with their item.
            let mut start = i;
            while start > 0 && CODE_COMMENT.is_match(lines[start - 1]) {
                start -= 1;
            }
            if start > *starts.last().unwrap_or(&0) {
                starts.push(start);
            }
        }
    }
    starts.push(lines.len());

    let mut out = Vec::new();
    for w in starts.windows(2) {
        let segment = lines[w[0]..w[1]].join("\n");
        if segment.trim().is_empty() {
            continue;
        }
        out.extend(recursive_split(segment.trim_end(), size, &["\n\n", "\n"]));
    }
    out
}

fn split_markdown(text: &str, size: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();

    for line in text.lines() {
        if MD_HEADING.is_match(line) && !buf.trim().is_empty() {
            out.push(std::mem::take(&mut buf));
        }
        if line.len() > size {
            if !buf.trim().is_empty() {
                out.push(std::mem::take(&mut buf));
            }
            out.extend(hard_split(line, size));
            continue;
        }
        if !buf.is_empty() && buf.len() + 1 + line.len() > size {
            out.push(std::mem::take(&mut buf));
        }
        if !buf.is_empty() {
            buf.push('\n');
        }
        buf.push_str(line);
    }
    if !buf.trim().is_empty() {
        out.push(buf);
    }
    out
}

fn split_csv(text: &str, size: usize) -> Vec<String> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };

    let mut out = Vec::new();
    let mut buf = header.to_string();
    let mut rows = 0usize;
    for row in lines {
        if rows > 0 && buf.len() + 1 + row.len() > size {
            out.push(std::mem::replace(&mut buf, header.to_string()));
            rows = 0;
        }
        buf.push('\n');
        buf.push_str(row);
        rows += 1;
    }
    if rows > 0 || out.is_empty() {
        out.push(buf);
    }
    out
}

fn split_log(text: &str, size: usize) -> Vec<String> {
    let mut entries: Vec<String> = Vec::new();
    for line in text.lines() {
        match entries.last_mut() {
            Some(entry) if !LOG_LINE.is_match(line) => {
                entry.push('\n');
                entry.push_str(line);
            }
            _ => entries.push(line.to_string()),
        }
    }
    pack(&entries, size, "\n")
}

fn split_sections(text: &str, marker: &Regex, size: usize) -> Vec<String> {
    let mut sections: Vec<String> = Vec::new();
    let mut buf = String::new();
    for line in text.lines() {
        if marker.is_match(line) && !buf.trim().is_empty() {
            sections.push(std::mem::take(&mut buf));
        }
        if !buf.is_empty() {
            buf.push('\n');
        }
        buf.push_str(line);
    }
    if !buf.trim().is_empty() {
        sections.push(buf);
    }

    let mut out = Vec::new();
    for section in sections {
        let section = section.trim();
        if section.len() > size {
            out.extend(pack(&split_sentences(section), size, " "));
        } else {
            out.push(section.to_string());
        }
    }
    out
}

/// One unit per top-level object, or `None` when the document is not an
/// array of objects.
fn split_json_array(text: &str, size: usize) -> Option<Vec<String>> {
    let value: serde_json::Value = serde_json::from_str(text.trim()).ok()?;
    let items = value.as_array()?;
    if items.is_empty() || !items.iter().all(|v| v.is_object()) {
        return None;
    }
    let units: Vec<String> = items.iter().map(|v| v.to_string()).collect();
    Some(pack(&units, size, "\n"))
}

/// Remove scripts, styles, and tags, keeping block boundaries as blank lines.
pub fn strip_html(html: &str) -> String {
    let text = SCRIPT_STYLE.replace_all(html, " ");
    let text = BLOCK_TAG.replace_all(&text, "\n\n");
    let text = ANY_TAG.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    text.lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adaptive(size: usize) -> AdaptiveChunker {
        AdaptiveChunker::new(ChunkerConfig {
            strategy: ChunkStrategy::Sentence,
            chunk_size: size,
            overlap: 0,
            min_size: 0,
        })
    }

    const RUST_SRC: &str = "use std::fmt;\n\n/// Adds.\nfn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n\npub struct Point {\n    x: i32,\n}\n\nimpl Point {\n    fn x(&self) -> i32 { self.x }\n}\n";

    #[test]
    fn test_detect_by_content_type() {
        assert_eq!(detect_kind("text/markdown", "plain"), DocumentKind::Markdown);
        assert_eq!(detect_kind("text/csv", "a"), DocumentKind::Csv);
        assert_eq!(detect_kind("text/x-code", "a"), DocumentKind::Code);
    }

    #[test]
    fn test_detect_heuristics() {
        assert_eq!(detect_kind("text/plain", RUST_SRC), DocumentKind::Code);
        assert_eq!(
            detect_kind("text/plain", "# Title\n\nSome text.\n\n## More\n\nText."),
            DocumentKind::Markdown
        );
        assert_eq!(
            detect_kind("text/plain", r#"[{"a": 1}, {"a": 2}]"#),
            DocumentKind::Json
        );
        assert_eq!(
            detect_kind("text/plain", "<html><body><p>Hi</p></body></html>"),
            DocumentKind::Html
        );
        assert_eq!(
            detect_kind(
                "text/plain",
                "2024-01-01 10:00:00 INFO start\n2024-01-01 10:00:01 WARN slow\n"
            ),
            DocumentKind::Log
        );
        assert_eq!(
            detect_kind("text/plain", "name,age\nalice,30\nbob,41\n"),
            DocumentKind::Csv
        );
        assert_eq!(
            detect_kind(
                "text/plain",
                "CHIEF COMPLAINT: chest pain.\nThe patient was prescribed 20 mg daily. Diagnosis pending."
            ),
            DocumentKind::Medical
        );
        assert_eq!(
            detect_kind(
                "text/plain",
                "WHEREAS the parties agree, the Supplier shall hereby indemnify the Buyer."
            ),
            DocumentKind::Legal
        );
        assert_eq!(
            detect_kind("text/plain", "Just a short note about lunch."),
            DocumentKind::Text
        );
    }

    #[test]
    fn test_code_splits_on_declarations() {
        let chunks = adaptive(60).chunk(RUST_SRC, "text/x-code");
        assert!(chunks.iter().any(|c| c.content.starts_with("/// Adds.\nfn add")));
        assert!(chunks.iter().any(|c| c.content.starts_with("pub struct Point")));
        assert!(chunks.iter().any(|c| c.content.starts_with("impl Point")));
    }

    #[test]
    fn test_code_oversized_segment_is_subsplit() {
        let body: String = (0..30).map(|i| format!("    let v{} = {};\n", i, i)).collect();
        let src = format!("fn big() {{\n{}}}\n", body);
        let chunks = adaptive(120).chunk(&src, "text/x-code");
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.content.len() <= 120);
        }
    }

    #[test]
    fn test_markdown_splits_at_headings() {
        let md = "# Intro\nHello there.\n## Usage\nRun it.\n## License\nMIT.";
        let chunks = adaptive(1000).chunk(md, "text/markdown");
        assert_eq!(chunks.len(), 3);
        assert!(chunks[1].content.starts_with("## Usage"));
    }

    #[test]
    fn test_csv_header_on_every_chunk() {
        let mut csv = String::from("id,name,score\n");
        for i in 0..20 {
            csv.push_str(&format!("{},user{},{}\n", i, i, i * 3));
        }
        let chunks = adaptive(60).chunk(&csv, "text/csv");
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.content.starts_with("id,name,score\n"));
        }
    }

    #[test]
    fn test_log_keeps_continuation_lines() {
        let log = "[2024-01-01 10:00:00] ERROR boom\n  at frame one\n  at frame two\n2024/01/01 10:00:05 INFO recovered";
        let chunks = adaptive(70).chunk(log, "text/x-log");
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].content.starts_with("[2024-01-01 10:00:00] ERROR boom"));
        assert!(chunks[0].content.ends_with("at frame two"));
        assert_eq!(chunks[1].content, "2024/01/01 10:00:05 INFO recovered");
    }

    #[test]
    fn test_medical_sections() {
        let note = "CHIEF COMPLAINT: cough.\nHISTORY OF PRESENT ILLNESS: three days.\nASSESSMENT: viral.\nPLAN: fluids.";
        let chunks = adaptive(1000).split_kind(DocumentKind::Medical, note);
        assert_eq!(chunks.len(), 4);
        assert!(chunks[3].starts_with("PLAN"));
    }

    #[test]
    fn test_academic_sections() {
        let paper = "Abstract\nWe study things.\n1. Introduction\nThings matter.\nReferences\n[1] A paper.";
        let chunks = adaptive(1000).split_kind(DocumentKind::Academic, paper);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[1].starts_with("1. Introduction"));
    }

    #[test]
    fn test_json_array_objects() {
        let json = r#"[{"id": 1, "name": "alpha"}, {"id": 2, "name": "beta"}, {"id": 3, "name": "gamma"}]"#;
        let chunks = adaptive(30).chunk(json, "application/json");
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].content.contains("alpha"));
    }

    #[test]
    fn test_irregular_json_falls_back() {
        let json = r#"[1, 2, "three"]"#;
        let chunks = adaptive(1000).chunk(json, "application/json");
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_html_stripped_then_paragraphs() {
        let html = "<html><head><style>p{}</style></head><body><h1>Title</h1><p>First &amp; best.</p><script>x()</script><p>Second.</p></body></html>";
        let chunks = adaptive(14).chunk(html, "text/html");
        let all: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(all, vec!["Title", "First & best.", "Second."]);
    }

    #[test]
    fn test_positions_contiguous() {
        let chunks = adaptive(60).chunk(RUST_SRC, "text/x-code");
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.position, i);
        }
    }
}
