//! PDF text extraction and whitespace normalisation.
//!
//! Converts a PDF byte stream into ordered `(page_index, text)` pairs plus
//! a whitespace-regularised full-document text. Pure over the given bytes;
//! the driver decides where this runs (it is CPU-bound, so under
//! `spawn_blocking` with a small worker pool).

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{PipelineError, Result};

/// One page of extracted, normalised text. `index` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Page {
    pub index: u32,
    pub text: String,
}

/// The extracted document: per-page text plus the joined full text.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExtractedDoc {
    pub pages: Vec<Page>,
    pub full_text: String,
}

impl ExtractedDoc {
    /// Build a document from raw page texts, applying normalisation.
    ///
    /// Used by tests and by resumed runs that re-hydrate page text
    /// without touching the PDF again.
    pub fn from_pages(pages: impl IntoIterator<Item = (u32, String)>) -> Self {
        let pages: Vec<Page> = pages
            .into_iter()
            .map(|(index, text)| Page {
                index,
                text: normalise_whitespace(&text),
            })
            .collect();
        let full_text = pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Self { pages, full_text }
    }

    pub fn page(&self, index: u32) -> Option<&Page> {
        self.pages.iter().find(|p| p.index == index)
    }
}

/// Extract per-page text from PDF bytes.
pub fn extract(pdf_bytes: &[u8]) -> Result<ExtractedDoc> {
    let doc = lopdf::Document::load_mem(pdf_bytes).map_err(|e| PipelineError::Extraction {
        page: None,
        message: format!("malformed PDF: {e}"),
    })?;

    let mut pages = Vec::new();
    for (page_num, _) in doc.get_pages() {
        let text = doc
            .extract_text(&[page_num])
            .map_err(|e| PipelineError::Extraction {
                page: Some(page_num),
                message: format!("cannot extract page text: {e}"),
            })?;
        pages.push((page_num, text));
    }

    if pages.is_empty() {
        return Err(PipelineError::Extraction {
            page: None,
            message: "PDF has no pages".to_string(),
        });
    }

    Ok(ExtractedDoc::from_pages(pages))
}

fn hyphen_break_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\w)-\n\s*(\w)").unwrap())
}

fn numeric_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // a bare number optionally followed by a short unit, e.g. "32,400 tCO2e"
    RE.get_or_init(|| {
        Regex::new(r"^[-+]?\d[\d,.]*(?:\s+\S{1,24}(?:\s+\S{1,24}){0,2})?$").unwrap()
    })
}

fn indicator_stem_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // a line ending in a bare indicator stem, e.g. "Scope 1" / "Scope 2"
    RE.get_or_init(|| Regex::new(r"(?i)\bscope\s*\d$").unwrap())
}

/// Normalise whitespace in extracted page text.
///
/// Paragraphs (blank-line separated blocks) end up separated by exactly
/// one `\n`; line breaks inside a paragraph become single spaces, so
/// downstream paragraph splitting is a plain `split('\n')`.
pub fn normalise_whitespace(text: &str) -> String {
    // join hyphenated line breaks first: "foo-\nbar" -> "foobar"
    let text = hyphen_break_re().replace_all(text, "$1$2");

    let mut paragraphs: Vec<Vec<String>> = vec![Vec::new()];
    for raw_line in text.lines() {
        let line = collapse_spaces(raw_line);
        if line.is_empty() {
            if !paragraphs.last().map(Vec::is_empty).unwrap_or(true) {
                paragraphs.push(Vec::new());
            }
            continue;
        }

        let lines = paragraphs.last_mut().expect("never empty");
        if let Some(prev) = lines.last_mut() {
            // "Scope 1" + "Emissions ..." -> "Scope 1 Emissions ..."
            if indicator_stem_re().is_match(prev) && line.starts_with("Emissions") {
                prev.push(' ');
                prev.push_str(&line);
                continue;
            }
            // label line + "32,400 tCO2e" -> "label: 32,400 tCO2e"
            if numeric_line_re().is_match(&line) && is_label_line(prev) {
                prev.push_str(": ");
                prev.push_str(&line);
                continue;
            }
        }
        lines.push(line);
    }

    paragraphs
        .iter()
        .filter(|lines| !lines.is_empty())
        .map(|lines| lines.join(" "))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collapse runs of spaces and tabs into single spaces.
fn collapse_spaces(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A label line names a metric: it ends in a word (no trailing digits
/// or sentence punctuation) and is short enough to be a heading.
fn is_label_line(line: &str) -> bool {
    let last = match line.chars().last() {
        Some(c) => c,
        None => return false,
    };
    line.len() <= 80 && (last.is_alphabetic() || last == ')')
}
