//! Page and section attribution for chunks cut from a joined document text.

use std::sync::LazyLock;

use regex::Regex;

use super::chunking::TextChunk;

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{1,6}[ \t]+(.+?)[ \t#]*$").expect("valid regex"));

/// Words of a chunk body used to locate it in the source text.
const NEEDLE_WORDS: usize = 5;

/// Cleaned document text plus the offsets needed to attribute chunks.
#[derive(Debug, Clone)]
pub struct DocumentLayout {
    text: String,
    page_starts: Vec<usize>,
    headings: Vec<(usize, String)>,
}

/// Where a chunk sits within its document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPosition {
    /// 1-based page, only for multi-page sources.
    pub page_number: Option<u32>,
    /// Nearest markdown heading at or before the chunk.
    pub section: Option<String>,
}

impl DocumentLayout {
    /// Join already-cleaned pages with blank lines, skipping empty ones.
    pub fn from_pages<I, S>(pages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut text = String::new();
        let mut page_starts = Vec::new();
        for page in pages {
            let page = page.as_ref();
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            page_starts.push(text.len());
            text.push_str(page);
        }

        let headings = HEADING
            .captures_iter(&text)
            .filter_map(|caps| {
                let start = caps.get(0)?.start();
                Some((start, caps.get(1)?.as_str().trim().to_string()))
            })
            .collect();

        Self {
            text,
            page_starts,
            headings,
        }
    }

    /// Joined text handed to the chunker.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether any page holds text.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Locate every chunk in document order.
    pub fn positions(&self, chunks: &[TextChunk]) -> Vec<ChunkPosition> {
        let mut cursor = 0;
        chunks
            .iter()
            .map(|chunk| {
                let offset = self.locate(chunk.body(), cursor).unwrap_or(cursor);
                cursor = offset;
                self.position_at(offset)
            })
            .collect()
    }

    fn locate(&self, body: &str, from: usize) -> Option<usize> {
        let haystack = self.text.get(from..)?;
        let first_line = body.lines().find(|line| !line.trim().is_empty())?;
        let needle = first_line
            .split_whitespace()
            .take(NEEDLE_WORDS)
            .collect::<Vec<_>>()
            .join(" ");
        let first_word = body.split_whitespace().next()?;
        haystack
            .find(&needle)
            .or_else(|| haystack.find(first_word))
            .map(|idx| from + idx)
    }

    fn position_at(&self, offset: usize) -> ChunkPosition {
        let page_number = (self.page_starts.len() > 1).then(|| {
            self.page_starts
                .iter()
                .take_while(|start| **start <= offset)
                .count()
                .max(1) as u32
        });
        let section = self
            .headings
            .iter()
            .take_while(|(start, _)| *start <= offset)
            .last()
            .map(|(_, title)| title.clone());
        ChunkPosition {
            page_number,
            section,
        }
    }
}
