//! Text extraction collaborator.
//!
//! Binary formats (PDF, DOCX) are handled by external extractors plugged in through
//! [`TextExtractor`]. The built-in [`PlainTextExtractor`] covers text-like formats.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::DocType;

/// Form feed separates pages in text dumps produced by most PDF tools.
const PAGE_BREAK: char = '\u{000C}';

static SCRIPT_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)>").expect("valid regex")
});
static BLOCK_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</?(p|div|br|li|tr|h[1-6]|section|article|blockquote)\b[^>]*>")
        .expect("valid regex")
});
static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));
static HTML_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex"));

/// Errors raised while turning raw bytes into text.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// No extractor is available for the format.
    #[error("unsupported document type: {0}")]
    Unsupported(DocType),
    /// The bytes could not be decoded as the declared format.
    #[error("failed to decode {doc_type} content: {reason}")]
    Malformed {
        /// Declared format.
        doc_type: DocType,
        /// Decoder message.
        reason: String,
    },
}

/// Text pulled out of a document.
#[derive(Debug, Clone, Default)]
pub struct ExtractedText {
    /// Page texts in order; single-page formats produce one entry.
    pub pages: Vec<String>,
    /// Extractor-supplied metadata such as a title.
    pub metadata: Map<String, Value>,
}

impl ExtractedText {
    /// Whether no page holds any non-whitespace character.
    pub fn is_blank(&self) -> bool {
        self.pages.iter().all(|page| page.trim().is_empty())
    }
}

/// Converts raw bytes into text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extract text from `bytes` declared as `doc_type`.
    async fn extract(&self, bytes: &[u8], doc_type: DocType)
    -> Result<ExtractedText, ExtractionError>;
}

/// Extractor for plain text, markdown, HTML and unknown text-like uploads.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(
        &self,
        bytes: &[u8],
        doc_type: DocType,
    ) -> Result<ExtractedText, ExtractionError> {
        match doc_type {
            DocType::Pdf | DocType::Docx => Err(ExtractionError::Unsupported(doc_type)),
            DocType::Txt | DocType::Md => {
                let text = decode_utf8(bytes, doc_type)?;
                Ok(paged(text, Map::new()))
            }
            DocType::Html => {
                let html = decode_utf8(bytes, doc_type)?;
                let mut metadata = Map::new();
                if let Some(title) = HTML_TITLE
                    .captures(&html)
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().trim().to_string())
                    .filter(|title| !title.is_empty())
                {
                    metadata.insert("title".into(), Value::String(title));
                }
                Ok(paged(strip_html(&html), metadata))
            }
            DocType::Unknown => {
                let text = String::from_utf8_lossy(bytes).into_owned();
                let mut metadata = Map::new();
                metadata.insert("lossy".into(), Value::Bool(std::str::from_utf8(bytes).is_err()));
                Ok(paged(text, metadata))
            }
        }
    }
}

fn decode_utf8(bytes: &[u8], doc_type: DocType) -> Result<String, ExtractionError> {
    String::from_utf8(bytes.to_vec()).map_err(|err| ExtractionError::Malformed {
        doc_type,
        reason: err.to_string(),
    })
}

fn paged(text: String, mut metadata: Map<String, Value>) -> ExtractedText {
    let pages: Vec<String> = text.split(PAGE_BREAK).map(str::to_string).collect();
    metadata.insert("page_count".into(), Value::from(pages.len()));
    ExtractedText { pages, metadata }
}

fn strip_html(html: &str) -> String {
    let without_code = SCRIPT_STYLE.replace_all(html, " ");
    let with_breaks = BLOCK_TAG.replace_all(&without_code, "\n\n");
    let text = ANY_TAG.replace_all(&with_breaks, "");
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
