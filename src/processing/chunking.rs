//! Recursive, token-bounded text splitting.
//!
//! Text is divided along progressively finer separators (paragraph, line, sentence, word,
//! character). Units that fit the token budget are kept whole and greedily re-joined with the
//! separator that produced them; oversized units recurse into the next tier. A unit that is
//! still too large once every tier is exhausted becomes its own chunk so no text is lost.
//!
//! Token counting prefers `tiktoken-rs`; the `approx` counter (`ceil(chars / 4)`) is used when
//! requested or when no encoding can be loaded.

use std::sync::Arc;

use anyhow::Error as TokenizerError;
use thiserror::Error;
use tiktoken_rs::{
    CoreBPE, cl100k_base, get_bpe_from_model, o200k_base, p50k_base, p50k_edit, r50k_base,
};

/// Counts tokens in a string slice.
pub type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Chunks below this many tokens are dropped when a document yields more than one chunk.
pub const QUALITY_FLOOR_TOKENS: usize = 10;

/// Errors raised while configuring or running the chunker.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Token budget of zero.
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    /// Tokenizer could not be loaded.
    #[error("failed to load tokenizer for {model}: {source}")]
    Tokenizer {
        /// Requested model or encoding.
        model: String,
        /// Loader error.
        #[source]
        source: TokenizerError,
    },
}

/// One emitted chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// 1-based position in document order.
    pub sequence: u32,
    /// Chunk text, including any overlap prefix.
    pub text: String,
    /// Token count of `text`.
    pub token_count: usize,
    /// Byte length of the overlap prefix copied from the previous chunk.
    pub overlap_len: usize,
}

impl TextChunk {
    /// Text without the overlap prefix.
    pub fn body(&self) -> &str {
        &self.text[self.overlap_len..]
    }
}

#[derive(Debug, Clone, Copy)]
enum Tier {
    Paragraph,
    Line,
    Sentence,
    Word,
    Char,
}

const TIERS: [Tier; 5] = [
    Tier::Paragraph,
    Tier::Line,
    Tier::Sentence,
    Tier::Word,
    Tier::Char,
];

impl Tier {
    fn joiner(self) -> &'static str {
        match self {
            Tier::Paragraph => "\n\n",
            Tier::Line => "\n",
            Tier::Sentence | Tier::Word => " ",
            Tier::Char => "",
        }
    }

    fn split(self, text: &str) -> Vec<&str> {
        match self {
            Tier::Paragraph => trimmed_non_empty(text.split("\n\n")),
            Tier::Line => trimmed_non_empty(text.split('\n')),
            Tier::Sentence => trimmed_non_empty(split_sentences(text).into_iter()),
            Tier::Word => text.split_whitespace().collect(),
            Tier::Char => text
                .char_indices()
                .map(|(idx, c)| &text[idx..idx + c.len_utf8()])
                .collect(),
        }
    }
}

fn trimmed_non_empty<'a>(parts: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    parts
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect()
}

/// Split after `.`, `!` or `?` when followed by whitespace; punctuation stays with its sentence.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?')
            && let Some(&(next_idx, next)) = chars.peek()
            && next.is_whitespace()
        {
            sentences.push(&text[start..next_idx]);
            start = next_idx;
        }
    }
    sentences.push(&text[start..]);
    sentences
}

/// Token-bounded recursive splitter.
#[derive(Clone)]
pub struct Chunker {
    max_tokens: usize,
    overlap: usize,
    counter: TokenCounter,
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker")
            .field("max_tokens", &self.max_tokens)
            .field("overlap", &self.overlap)
            .finish_non_exhaustive()
    }
}

impl Chunker {
    /// Chunker bounded by `max_tokens` with up to `overlap` tokens carried between chunks.
    pub fn new(
        max_tokens: usize,
        overlap: usize,
        counter: TokenCounter,
    ) -> Result<Self, ChunkingError> {
        if max_tokens == 0 {
            return Err(ChunkingError::InvalidChunkSize);
        }
        Ok(Self {
            max_tokens,
            overlap,
            counter,
        })
    }

    /// Upper token bound per chunk.
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Token count of `text` under this chunker's counter.
    pub fn count(&self, text: &str) -> usize {
        (self.counter)(text)
    }

    /// Split `text` into chunks numbered from 1. Blank input yields no chunks.
    pub fn chunk(&self, text: &str) -> Vec<TextChunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut pieces = self.split_recursive(text.trim(), 0);
        if pieces.len() > 1 {
            pieces.retain(|piece| self.count(piece) >= QUALITY_FLOOR_TOKENS);
        }

        let mut chunks = Vec::with_capacity(pieces.len());
        let mut previous: Option<&str> = None;
        for (idx, piece) in pieces.iter().enumerate() {
            let (text, overlap_len) = match previous {
                Some(prev) => self.with_overlap(prev, piece),
                None => (piece.clone(), 0),
            };
            chunks.push(TextChunk {
                sequence: idx as u32 + 1,
                token_count: self.count(&text),
                text,
                overlap_len,
            });
            previous = Some(piece);
        }
        chunks
    }

    fn split_recursive(&self, text: &str, tier_idx: usize) -> Vec<String> {
        let Some(&tier) = TIERS.get(tier_idx) else {
            return vec![text.to_string()];
        };

        let mut out = Vec::new();
        let mut buffer = String::new();
        for unit in tier.split(text) {
            if self.count(unit) > self.max_tokens {
                if !buffer.is_empty() {
                    out.push(std::mem::take(&mut buffer));
                }
                if matches!(tier, Tier::Char) {
                    out.push(unit.to_string());
                } else {
                    out.extend(self.split_recursive(unit, tier_idx + 1));
                }
                continue;
            }

            if buffer.is_empty() {
                buffer.push_str(unit);
                continue;
            }
            let candidate = format!("{buffer}{}{unit}", tier.joiner());
            if self.count(&candidate) <= self.max_tokens {
                buffer = candidate;
            } else {
                out.push(std::mem::replace(&mut buffer, unit.to_string()));
            }
        }
        if !buffer.is_empty() {
            out.push(buffer);
        }
        out
    }

    /// Prefix `current` with the tail of `previous` when the result still fits the budget.
    fn with_overlap(&self, previous: &str, current: &str) -> (String, usize) {
        if self.overlap == 0 {
            return (current.to_string(), 0);
        }
        let tail = tail_with_token_limit(previous, self.overlap, &self.counter);
        if tail.is_empty() {
            return (current.to_string(), 0);
        }

        let combined = format!("{tail} {current}");
        if self.count(&combined) <= self.max_tokens {
            let prefix_len = tail.len() + 1;
            (combined, prefix_len)
        } else {
            (current.to_string(), 0)
        }
    }
}

/// Longest word-aligned suffix of `text` with at most `token_limit` tokens.
fn tail_with_token_limit<'a>(text: &'a str, token_limit: usize, counter: &TokenCounter) -> &'a str {
    if token_limit == 0 {
        return "";
    }

    let mut previous_whitespace = true;
    for (idx, c) in text.char_indices() {
        let word_start = previous_whitespace && !c.is_whitespace();
        previous_whitespace = c.is_whitespace();
        if word_start {
            let candidate = text[idx..].trim_end();
            if counter(candidate) <= token_limit {
                return candidate;
            }
        }
    }
    ""
}

/// Chunk `text` with a fresh [`Chunker`].
pub fn chunk_text(
    text: &str,
    max_tokens: usize,
    overlap: usize,
    counter: TokenCounter,
) -> Result<Vec<TextChunk>, ChunkingError> {
    Ok(Chunker::new(max_tokens, overlap, counter)?.chunk(text))
}

/// Build a token counter for a model or encoding name.
///
/// `approx` selects the character-length approximation. Anything else is resolved through
/// `tiktoken-rs`; if no encoding loads, the approximation is used and a warning is logged.
pub fn build_token_counter(name: &str) -> TokenCounter {
    if name.trim().eq_ignore_ascii_case("approx") {
        return approx_token_counter();
    }
    match build_tiktoken_counter(name) {
        Ok(counter) => counter,
        Err(error) => {
            tracing::warn!(
                tokenizer = name,
                error = %error,
                "Tokenizer unavailable; falling back to approximate token counts"
            );
            approx_token_counter()
        }
    }
}

/// `ceil(chars / 4)` token estimate.
pub fn approx_token_counter() -> TokenCounter {
    Arc::new(|segment: &str| segment.chars().count().div_ceil(4))
}

fn build_tiktoken_counter(model: &str) -> Result<TokenCounter, ChunkingError> {
    let normalized = model.trim();
    let target = if normalized.is_empty() {
        "cl100k_base"
    } else {
        normalized
    };
    let encoding = resolve_encoding(target).map_err(|source| ChunkingError::Tokenizer {
        model: target.to_string(),
        source,
    })?;
    let encoding = Arc::new(encoding);

    Ok(Arc::new(move |segment: &str| {
        encoding.encode_ordinary(segment).len()
    }))
}

fn resolve_encoding(model: &str) -> Result<CoreBPE, TokenizerError> {
    if let Some(candidate) = encoding_from_name(model) {
        return candidate;
    }
    match get_bpe_from_model(model) {
        Ok(encoding) => Ok(encoding),
        Err(model_err) => {
            tracing::debug!(
                model,
                error = %model_err,
                "Tokenizer model lookup failed; using 'cl100k_base'"
            );
            cl100k_base()
        }
    }
}

fn encoding_from_name(name: &str) -> Option<Result<CoreBPE, TokenizerError>> {
    match name {
        "cl100k_base" => Some(cl100k_base()),
        "o200k_base" => Some(o200k_base()),
        "p50k_base" => Some(p50k_base()),
        "p50k_edit" => Some(p50k_edit()),
        "r50k_base" | "gpt2" => Some(r50k_base()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word_counter() -> TokenCounter {
        Arc::new(|segment: &str| segment.split_whitespace().count())
    }

    fn words(prefix: &str, count: usize) -> String {
        (1..=count)
            .map(|i| format!("{prefix}{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn blank_input_yields_nothing() {
        let chunker = Chunker::new(8, 0, word_counter()).unwrap();
        assert!(chunker.chunk("").is_empty());
        assert!(chunker.chunk(" \n\n\t ").is_empty());
    }

    #[test]
    fn zero_budget_is_rejected() {
        assert!(matches!(
            Chunker::new(0, 0, word_counter()),
            Err(ChunkingError::InvalidChunkSize)
        ));
    }

    #[test]
    fn short_three_paragraph_document_is_one_chunk() {
        let text = "Refund policy overview for all customers.\n\n\
                    Items may be returned within thirty days of purchase.\n\n\
                    Contact support with your order number to begin.";
        let chunks = chunk_text(text, 512, 50, build_token_counter("cl100k_base")).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].sequence, 1);
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn paragraphs_that_do_not_fit_together_become_separate_chunks() {
        let text = [words("a", 12), words("b", 12), words("c", 12)].join("\n\n");
        let chunks = chunk_text(&text, 20, 0, word_counter()).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks.iter().map(|c| c.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(chunks[1].text, words("b", 12));
    }

    #[test]
    fn oversized_paragraphs_fall_back_to_sentences() {
        let paragraph = format!(
            "{}. {}! {}?",
            words("a", 10),
            words("b", 10),
            words("c", 10)
        );
        let chunks = chunk_text(&paragraph, 12, 0, word_counter()).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, format!("{}.", words("a", 10)));
        assert_eq!(chunks[1].text, format!("{}!", words("b", 10)));
        assert_eq!(chunks[2].text, format!("{}?", words("c", 10)));
    }

    #[test]
    fn small_fragments_are_dropped_when_other_chunks_exist() {
        let text = [words("a", 12), "tiny bit".to_string(), words("c", 12)].join("\n\n");
        let chunks = chunk_text(&text, 13, 0, word_counter()).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, words("a", 12));
        assert_eq!(chunks[1].text, words("c", 12));
        assert_eq!(chunks[1].sequence, 2);
    }

    #[test]
    fn a_single_small_chunk_is_kept() {
        let chunks = chunk_text("hello world", 100, 0, word_counter()).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello world");
    }

    #[test]
    fn indivisible_units_are_emitted_oversized() {
        let byte_counter: TokenCounter = Arc::new(|segment: &str| segment.len());
        let chunks = chunk_text("é", 1, 0, byte_counter).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "é");
        assert_eq!(chunks[0].token_count, 2);
    }

    #[test]
    fn overlap_prefixes_the_previous_tail_within_budget() {
        let text = [words("a", 12), words("b", 12)].join("\n\n");
        let chunks = chunk_text(&text, 20, 3, word_counter()).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].overlap_len, 0);
        assert!(chunks[1].text.starts_with("a10 a11 a12 b1"));
        assert_eq!(chunks[1].body(), words("b", 12));
        assert_eq!(chunks[1].token_count, 15);
    }

    #[test]
    fn overlap_never_pushes_a_chunk_over_budget() {
        let text = [words("a", 12), words("b", 12)].join("\n\n");
        let chunks = chunk_text(&text, 13, 5, word_counter()).unwrap();
        assert_eq!(chunks[1].text, words("b", 12));
        assert_eq!(chunks[1].overlap_len, 0);
    }

    #[test]
    fn chunks_respect_the_budget() {
        let counter = approx_token_counter();
        let corpus = format!(
            "{}\n\n{}\nshort line\n{}",
            "The quick brown fox jumps over the lazy dog. ".repeat(40),
            "Lorem ipsum dolor sit amet, consectetur adipiscing elit! ".repeat(25),
            "x".repeat(700)
        );
        for max_tokens in [1, 7, 16, 64, 200] {
            for overlap in [0, 4] {
                let chunks = chunk_text(&corpus, max_tokens, overlap, counter.clone()).unwrap();
                assert!(!chunks.is_empty());
                for chunk in &chunks {
                    assert!(
                        chunk.token_count <= max_tokens,
                        "max {max_tokens}: {} tokens",
                        chunk.token_count
                    );
                }
            }
        }
    }

    #[test]
    fn approx_counter_rounds_up() {
        let counter = approx_token_counter();
        assert_eq!(counter(""), 0);
        assert_eq!(counter("abc"), 1);
        assert_eq!(counter("abcde"), 2);
    }

    #[test]
    fn tiktoken_counter_respects_budget() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(30);
        let counter = build_token_counter("text-embedding-3-small");
        let chunks = chunk_text(&text, 12, 0, counter.clone()).unwrap();
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(counter(&chunk.text) <= 12);
        }
    }
}
