//! Text preparation ahead of embedding: cleanup, chunking and position attribution.

pub mod chunking;
pub mod clean;
pub mod layout;

pub use chunking::{
    Chunker, ChunkingError, TextChunk, TokenCounter, approx_token_counter, build_token_counter,
    chunk_text,
};
pub use clean::clean_text;
pub use layout::{ChunkPosition, DocumentLayout};
