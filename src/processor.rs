//! Format readers: turn raw bytes of a given content type into text plus
//! extracted metadata.
//!
//! | Content type | Processor |
//! |--------------|-----------|
//! | `text/plain`, `text/csv`, `text/x-log`, `text/x-code`, `application/json` | [`TextProcessor`] |
//! | `text/markdown` | [`MarkdownProcessor`] |
//! | `text/html` | [`HtmlProcessor`] |
//! | `application/pdf` | [`PdfProcessor`] |
//!
//! [`ProcessorRegistry::get`] falls back to the plain-text processor for
//! any type without an exact registration, so unsupported formats are
//! still ingested as (lossily decoded) text.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use lodestone_core::models::Metadata;
use scraper::{Html, Selector};
use serde_json::json;
use thiserror::Error;

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_HTML: &str = "text/html";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_CSV: &str = "text/csv";
pub const MIME_LOG: &str = "text/x-log";
pub const MIME_JSON: &str = "application/json";
pub const MIME_CODE: &str = "text/x-code";

const CODE_EXTENSIONS: &[&str] = &["rs", "py", "go", "js", "ts", "java", "c", "cpp"];

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("{content_type} content is not valid UTF-8: {reason}")]
    Decode {
        content_type: String,
        reason: String,
    },
}

/// Text and metadata extracted from one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Processed {
    pub text: String,
    pub metadata: Metadata,
}

pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    /// Content types this processor registers for.
    fn content_types(&self) -> &[&'static str];

    fn process(&self, bytes: &[u8]) -> Result<Processed, ProcessError>;
}

fn decode_strict(bytes: &[u8], content_type: &str) -> Result<String, ProcessError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| ProcessError::Decode {
        content_type: content_type.to_string(),
        reason: e.to_string(),
    })
}

/// Plain text, decoded lossily.
pub struct TextProcessor;

impl Processor for TextProcessor {
    fn name(&self) -> &str {
        "text"
    }

    fn content_types(&self) -> &[&'static str] {
        &[MIME_TEXT, MIME_CSV, MIME_LOG, MIME_CODE, MIME_JSON]
    }

    fn process(&self, bytes: &[u8]) -> Result<Processed, ProcessError> {
        Ok(Processed {
            text: String::from_utf8_lossy(bytes).into_owned(),
            metadata: Metadata::new(),
        })
    }
}

/// Markdown: text kept verbatim, title taken from the first `#` heading.
pub struct MarkdownProcessor;

impl Processor for MarkdownProcessor {
    fn name(&self) -> &str {
        "markdown"
    }

    fn content_types(&self) -> &[&'static str] {
        &[MIME_MARKDOWN]
    }

    fn process(&self, bytes: &[u8]) -> Result<Processed, ProcessError> {
        let text = decode_strict(bytes, MIME_MARKDOWN)?;
        let mut metadata = Metadata::new();

        let headings: Vec<&str> = text
            .lines()
            .map(str::trim_start)
            .filter(|l| {
                let hashes = l.chars().take_while(|&c| c == '#').count();
                (1..=6).contains(&hashes) && l[hashes..].starts_with(' ')
            })
            .collect();
        if let Some(title) = headings
            .iter()
            .find(|h| h.starts_with("# "))
            .map(|h| h[2..].trim())
            .filter(|t| !t.is_empty())
        {
            metadata.insert("title".into(), json!(title));
        }
        metadata.insert("heading_count".into(), json!(headings.len()));

        Ok(Processed { text, metadata })
    }
}

/// HTML: `<title>` plus the text of block-level elements.
pub struct HtmlProcessor;

const BLOCK_SELECTOR: &str = "h1, h2, h3, h4, h5, h6, p, li, pre, blockquote, td, th";

fn element_text<'a>(el: scraper::ElementRef<'a>) -> String {
    el.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

impl Processor for HtmlProcessor {
    fn name(&self) -> &str {
        "html"
    }

    fn content_types(&self) -> &[&'static str] {
        &[MIME_HTML]
    }

    fn process(&self, bytes: &[u8]) -> Result<Processed, ProcessError> {
        let raw = String::from_utf8_lossy(bytes);
        let document = Html::parse_document(&raw);
        let mut metadata = Metadata::new();

        if let Ok(selector) = Selector::parse("title") {
            if let Some(title) = document
                .select(&selector)
                .map(element_text)
                .find(|t| !t.is_empty())
            {
                metadata.insert("title".into(), json!(title));
            }
        }

        let mut blocks = Vec::new();
        if let Ok(selector) = Selector::parse(BLOCK_SELECTOR) {
            for el in document.select(&selector) {
                // Nested blocks (e.g. <p> inside <li>) are emitted by the inner element.
                let nested = el
                    .children()
                    .filter_map(scraper::ElementRef::wrap)
                    .any(|child| selector.matches(&child));
                if nested {
                    continue;
                }
                let text = element_text(el);
                if !text.is_empty() {
                    blocks.push(text);
                }
            }
        }
        if blocks.is_empty() {
            if let Ok(selector) = Selector::parse("body") {
                blocks.extend(
                    document
                        .select(&selector)
                        .map(element_text)
                        .filter(|t| !t.is_empty()),
                );
            }
        }

        Ok(Processed {
            text: blocks.join("\n\n"),
            metadata,
        })
    }
}

/// PDF text via `pdf-extract`.
pub struct PdfProcessor;

impl Processor for PdfProcessor {
    fn name(&self) -> &str {
        "pdf"
    }

    fn content_types(&self) -> &[&'static str] {
        &[MIME_PDF]
    }

    fn process(&self, bytes: &[u8]) -> Result<Processed, ProcessError> {
        let text = pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| ProcessError::Pdf(e.to_string()))?;
        Ok(Processed {
            text,
            metadata: Metadata::new(),
        })
    }
}

/// Content-type → processor map with a plain-text fallback.
pub struct ProcessorRegistry {
    by_type: HashMap<String, Arc<dyn Processor>>,
    fallback: Arc<dyn Processor>,
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(TextProcessor));
        registry.register(Arc::new(MarkdownProcessor));
        registry.register(Arc::new(HtmlProcessor));
        registry.register(Arc::new(PdfProcessor));
        registry
    }
}

impl ProcessorRegistry {
    /// A registry with only the plain-text fallback.
    pub fn empty() -> Self {
        Self {
            by_type: HashMap::new(),
            fallback: Arc::new(TextProcessor),
        }
    }

    /// Register `processor` for each of its content types, replacing any
    /// earlier registration.
    pub fn register(&mut self, processor: Arc<dyn Processor>) {
        for ct in processor.content_types() {
            self.by_type.insert(ct.to_string(), Arc::clone(&processor));
        }
    }

    pub fn get(&self, content_type: &str) -> Arc<dyn Processor> {
        let base = content_type
            .split(';')
            .next()
            .unwrap_or(content_type)
            .trim()
            .to_ascii_lowercase();
        self.by_type
            .get(&base)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    pub fn content_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.by_type.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Content type for a file extension (without the dot).
pub fn content_type_for_extension(ext: &str) -> &'static str {
    let ext = ext.to_ascii_lowercase();
    match ext.as_str() {
        "txt" => MIME_TEXT,
        "md" | "markdown" => MIME_MARKDOWN,
        "pdf" => MIME_PDF,
        "html" | "htm" => MIME_HTML,
        "csv" => MIME_CSV,
        "log" => MIME_LOG,
        "json" => MIME_JSON,
        e if CODE_EXTENSIONS.contains(&e) => MIME_CODE,
        _ => MIME_TEXT,
    }
}

/// Infer a content type: file extension first, `text/html` for URLs,
/// `text/plain` otherwise.
pub fn detect_content_type(file_path: Option<&Path>, url: Option<&str>) -> &'static str {
    if let Some(path) = file_path {
        return path
            .extension()
            .and_then(|e| e.to_str())
            .map(content_type_for_extension)
            .unwrap_or(MIME_TEXT);
    }
    if url.is_some() {
        return MIME_HTML;
    }
    MIME_TEXT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_content_type() {
        let cases = [
            ("notes.txt", MIME_TEXT),
            ("README.md", MIME_MARKDOWN),
            ("guide.markdown", MIME_MARKDOWN),
            ("paper.PDF", MIME_PDF),
            ("data.csv", MIME_CSV),
            ("server.log", MIME_LOG),
            ("main.rs", MIME_CODE),
            ("page.htm", MIME_HTML),
            ("archive.xyz", MIME_TEXT),
            ("Makefile", MIME_TEXT),
        ];
        for (file, expected) in cases {
            assert_eq!(detect_content_type(Some(Path::new(file)), None), expected, "{}", file);
        }
        assert_eq!(detect_content_type(None, Some("https://example.com")), MIME_HTML);
        assert_eq!(detect_content_type(None, None), MIME_TEXT);
    }

    #[test]
    fn test_registry_dispatch_and_fallback() {
        let registry = ProcessorRegistry::default();
        assert_eq!(registry.get("text/markdown").name(), "markdown");
        assert_eq!(registry.get("text/html; charset=utf-8").name(), "html");
        assert_eq!(registry.get("text/x-rst").name(), "text");
        assert_eq!(registry.get("application/x-unknown").name(), "text");
        assert!(registry.content_types().contains(&MIME_PDF.to_string()));
    }

    #[test]
    fn test_markdown_title_and_headings() {
        let md = "Intro line\n\n# Getting Started\n\nBody.\n\n## Install\n\n#hashtag not heading\n";
        let out = MarkdownProcessor.process(md.as_bytes()).unwrap();
        assert_eq!(out.text, md);
        assert_eq!(out.metadata["title"], json!("Getting Started"));
        assert_eq!(out.metadata["heading_count"], json!(2));

        let err = MarkdownProcessor.process(&[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, ProcessError::Decode { .. }));
    }

    #[test]
    fn test_html_extracts_title_and_blocks() {
        let html = r#"<html><head><title>My Page</title><style>p { color: red }</style></head>
            <body><h1>Heading</h1><p>First   paragraph.</p><ul><li><p>Item one</p></li></ul>
            <script>var x = 1;</script></body></html>"#;
        let out = HtmlProcessor.process(html.as_bytes()).unwrap();
        assert_eq!(out.metadata["title"], json!("My Page"));
        assert_eq!(out.text, "Heading\n\nFirst paragraph.\n\nItem one");
    }

    #[test]
    fn test_pdf_garbage_is_error() {
        let err = PdfProcessor.process(b"not a pdf").unwrap_err();
        assert!(matches!(err, ProcessError::Pdf(_)));
    }

    #[test]
    fn test_text_is_lossy() {
        let out = TextProcessor.process(&[b'o', b'k', 0xff]).unwrap();
        assert!(out.text.starts_with("ok"));
    }
}
