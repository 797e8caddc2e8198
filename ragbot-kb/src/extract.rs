//! Plain-text extraction from uploaded files.
//!
//! Each supported [`DocumentFormat`] has an [`Extractor`]. The
//! [`ExtractorRegistry`] is a lookup table from format tag to extractor; it
//! runs the extractor and then [`normalize_text`] so that chunk boundaries
//! downstream are not dominated by layout whitespace.
//!
//! - [`PlainTextExtractor`] - UTF-8 text, BOM stripped
//! - [`PdfExtractor`] - text layer via `pdf-extract`
//! - [`WordExtractor`] - `.docx` paragraphs via `docx-rs`
//! - [`CsvExtractor`] - one line per row
//! - [`JsonExtractor`] - flattened `path: value` lines
//! - [`MarkdownExtractor`] - markup stripped, text kept

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, LazyLock};

use chrono::Utc;
use docx_rs::{DocumentChild, Paragraph, ParagraphChild, RunChild};
use regex::Regex;
use serde_json::Value;

use crate::document::{Document, DocumentFormat};
use crate::error::{KbError, Result};

/// Converts raw bytes of one format into plain text.
pub trait Extractor: Send + Sync {
    /// The format this extractor handles.
    fn format(&self) -> DocumentFormat;

    /// Extract text. The registry normalises whitespace afterwards.
    fn extract(&self, raw: &[u8]) -> Result<String>;
}

fn corrupt(format: DocumentFormat, message: impl Into<String>) -> KbError {
    KbError::CorruptDocument { format: format.to_string(), message: message.into() }
}

/// UTF-8 plain text.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextExtractor;

impl Extractor for PlainTextExtractor {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::PlainText
    }

    fn extract(&self, raw: &[u8]) -> Result<String> {
        decode_utf8(raw, self.format())
    }
}

fn decode_utf8(raw: &[u8], format: DocumentFormat) -> Result<String> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| corrupt(format, format!("invalid UTF-8: {e}")))?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text).to_string())
}

/// PDF text layer.
///
/// `pdf-extract` can panic on malformed cross-reference tables; the panic is
/// contained and reported as [`KbError::CorruptDocument`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfExtractor;

static HYPHEN_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w)-\n(\w)").expect("valid regex"));

impl Extractor for PdfExtractor {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Pdf
    }

    fn extract(&self, raw: &[u8]) -> Result<String> {
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text_from_mem(raw)));
        let text = match outcome {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => return Err(corrupt(self.format(), e.to_string())),
            Err(_) => return Err(corrupt(self.format(), "PDF parser aborted")),
        };
        // Re-join words hyphenated across layout line breaks.
        Ok(HYPHEN_BREAK.replace_all(&text, "$1$2").into_owned())
    }
}

/// Office Open XML word-processing documents.
///
/// Legacy binary `.doc` files map to the same format but fail to parse and
/// surface as [`KbError::CorruptDocument`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WordExtractor;

fn paragraph_text(paragraph: &Paragraph) -> String {
    let mut text = String::new();
    for child in &paragraph.children {
        if let ParagraphChild::Run(run) = child {
            for run_child in &run.children {
                match run_child {
                    RunChild::Text(t) => text.push_str(&t.text),
                    RunChild::Tab(_) => text.push(' '),
                    _ => {}
                }
            }
        }
    }
    text
}

impl Extractor for WordExtractor {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Word
    }

    fn extract(&self, raw: &[u8]) -> Result<String> {
        let docx = docx_rs::read_docx(raw).map_err(|e| corrupt(self.format(), format!("{e:?}")))?;
        let paragraphs: Vec<String> = docx
            .document
            .children
            .iter()
            .filter_map(|child| match child {
                DocumentChild::Paragraph(paragraph) => Some(paragraph_text(paragraph)),
                _ => None,
            })
            .collect();
        Ok(paragraphs.join("\n"))
    }
}

/// CSV rows, one output line per record with fields separated by a space.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvExtractor;

impl Extractor for CsvExtractor {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Csv
    }

    fn extract(&self, raw: &[u8]) -> Result<String> {
        let mut reader =
            csv::ReaderBuilder::new().has_headers(false).flexible(true).from_reader(raw);
        let mut lines = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| corrupt(self.format(), e.to_string()))?;
            let line = record
                .iter()
                .map(str::trim)
                .filter(|field| !field.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }
}

/// JSON flattened into `path: value` lines.
///
/// Object keys are joined with `.`, array elements get `[i]`. Keys are
/// emitted in sorted order so the output is independent of source ordering.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonExtractor;

fn flatten_json(path: &str, value: &Value, out: &mut Vec<String>) {
    let emit = |out: &mut Vec<String>, rendered: String| {
        if path.is_empty() {
            out.push(rendered);
        } else {
            out.push(format!("{path}: {rendered}"));
        }
    };

    match value {
        Value::Object(map) if map.is_empty() => emit(out, "{}".to_string()),
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                let child = if path.is_empty() { key.clone() } else { format!("{path}.{key}") };
                flatten_json(&child, &map[key.as_str()], out);
            }
        }
        Value::Array(items) if items.is_empty() => emit(out, "[]".to_string()),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                flatten_json(&format!("{path}[{i}]"), item, out);
            }
        }
        Value::String(s) => emit(out, s.clone()),
        other => emit(out, other.to_string()),
    }
}

impl Extractor for JsonExtractor {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Json
    }

    fn extract(&self, raw: &[u8]) -> Result<String> {
        let value: Value =
            serde_json::from_slice(raw).map_err(|e| corrupt(self.format(), e.to_string()))?;
        let mut lines = Vec::new();
        flatten_json("", &value, &mut lines);
        Ok(lines.join("\n"))
    }
}

/// Markdown with markup stripped and text preserved.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownExtractor;

struct MarkdownRules {
    fence: Regex,
    rule: Regex,
    heading: Regex,
    quote: Regex,
    list: Regex,
    image: Regex,
    link: Regex,
    strong: Regex,
    strong_underscore: Regex,
    emphasis: Regex,
    code: Regex,
    html: Regex,
}

static MARKDOWN: LazyLock<MarkdownRules> = LazyLock::new(|| MarkdownRules {
    fence: Regex::new(r"^\s*(```|~~~)").expect("valid regex"),
    rule: Regex::new(r"^\s*([-*_]\s*){3,}$").expect("valid regex"),
    heading: Regex::new(r"^\s{0,3}#{1,6}\s+(.*?)\s*#*\s*$").expect("valid regex"),
    quote: Regex::new(r"^\s*(>\s?)+").expect("valid regex"),
    list: Regex::new(r"^\s*([-*+]|\d+[.)])\s+").expect("valid regex"),
    image: Regex::new(r"!\[([^\]]*)\]\([^)]*\)").expect("valid regex"),
    link: Regex::new(r"\[([^\]]+)\]\([^)]*\)").expect("valid regex"),
    strong: Regex::new(r"\*\*([^*]+)\*\*").expect("valid regex"),
    strong_underscore: Regex::new(r"__([^_]+)__").expect("valid regex"),
    emphasis: Regex::new(r"\*([^*\s][^*]*)\*").expect("valid regex"),
    code: Regex::new(r"`([^`]+)`").expect("valid regex"),
    html: Regex::new(r"<[^>]+>").expect("valid regex"),
});

fn strip_markdown_line(line: &str) -> Option<String> {
    let rules = &*MARKDOWN;
    if rules.fence.is_match(line) || rules.rule.is_match(line) {
        return None;
    }
    let line = rules.heading.replace(line, "$1");
    let line = rules.quote.replace(&line, "");
    let line = rules.list.replace(&line, "");
    let line = rules.image.replace_all(&line, "$1");
    let line = rules.link.replace_all(&line, "$1");
    let line = rules.strong.replace_all(&line, "$1");
    let line = rules.strong_underscore.replace_all(&line, "$1");
    let line = rules.emphasis.replace_all(&line, "$1");
    let line = rules.code.replace_all(&line, "$1");
    let line = rules.html.replace_all(&line, "");
    Some(line.into_owned())
}

impl Extractor for MarkdownExtractor {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Markdown
    }

    fn extract(&self, raw: &[u8]) -> Result<String> {
        let text = decode_utf8(raw, self.format())?;
        let lines: Vec<String> = text.lines().filter_map(strip_markdown_line).collect();
        Ok(lines.join("\n"))
    }
}

/// Normalise extracted text.
///
/// Line endings become `\n`, control characters are dropped, whitespace runs
/// inside a line collapse to one space, lines are trimmed, and at most one
/// blank line separates paragraphs.
pub fn normalize_text(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<String> = Vec::new();

    for line in text.lines() {
        let cleaned: String = line
            .chars()
            .map(|c| if c == '\t' { ' ' } else { c })
            .filter(|c| !c.is_control())
            .collect();
        let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

        if collapsed.is_empty() {
            if lines.last().is_some_and(|last| !last.is_empty()) {
                lines.push(String::new());
            }
        } else {
            lines.push(collapsed);
        }
    }

    while lines.last().is_some_and(|last| last.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// Lookup table from [`DocumentFormat`] to [`Extractor`].
///
/// The default registry knows all six built-in formats. Removing or never
/// registering a format makes it [`KbError::UnsupportedFormat`].
#[derive(Clone)]
pub struct ExtractorRegistry {
    extractors: HashMap<DocumentFormat, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    /// A registry with no extractors.
    pub fn empty() -> Self {
        Self { extractors: HashMap::new() }
    }

    /// Register (or replace) the extractor for its format.
    pub fn register(&mut self, extractor: Arc<dyn Extractor>) -> &mut Self {
        self.extractors.insert(extractor.format(), extractor);
        self
    }

    /// Whether a format has a registered extractor.
    pub fn supports(&self, format: DocumentFormat) -> bool {
        self.extractors.contains_key(&format)
    }

    /// Extract and normalise text.
    ///
    /// # Errors
    ///
    /// - [`KbError::UnsupportedFormat`] if no extractor is registered
    /// - [`KbError::CorruptDocument`] if the bytes cannot be parsed
    pub fn extract(&self, format: DocumentFormat, raw: &[u8]) -> Result<String> {
        let extractor = self
            .extractors
            .get(&format)
            .ok_or_else(|| KbError::UnsupportedFormat { format: format.to_string() })?;
        let text = extractor.extract(raw)?;
        Ok(normalize_text(&text))
    }

    /// Extract a [`Document`], stamping the extraction time.
    pub fn extract_document(
        &self,
        id: impl Into<String>,
        format: DocumentFormat,
        raw: Vec<u8>,
    ) -> Result<Document> {
        let text = self.extract(format, &raw)?;
        Ok(Document { id: id.into(), format, raw, text, extracted_at: Utc::now() })
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(Arc::new(PlainTextExtractor))
            .register(Arc::new(PdfExtractor))
            .register(Arc::new(WordExtractor))
            .register(Arc::new(CsvExtractor))
            .register(Arc::new(JsonExtractor))
            .register(Arc::new(MarkdownExtractor));
        registry
    }
}

impl fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut formats: Vec<&str> = self.extractors.keys().map(|f| f.as_str()).collect();
        formats.sort_unstable();
        f.debug_struct("ExtractorRegistry").field("formats", &formats).finish()
    }
}
