//! Tokenizer & Chunker (C2, spec.md §4.2).
//!
//! Generalizes the teacher's `split_into_chunks` (a flat paragraph-packing
//! function with a hardcoded 1200-char budget) into two selectable
//! strategies driven by [`crate::config::ChunkingConfig`], both built on the
//! same token-window core.

use crate::config::{ChunkingConfig, ChunkingStrategy};
use crate::ids::chunk_id;

/// Encode/decode abstraction so the chunker can reason in tokens without
/// committing to one tokenizer implementation (spec.md §4.2: "accepts a
/// tokenizer abstraction"). Word-boundary splitting stands in for a real
/// BPE tokenizer; a real one would implement the same trait.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<String>;
    fn decode(&self, tokens: &[String]) -> String;
}

/// Whitespace tokenizer: every run of non-whitespace is one token, the
/// whitespace between tokens is swallowed on decode and rejoined with a
/// single space. Adequate for the engine's own token-budget accounting;
/// swap in a real BPE tokenizer for exact provider-side counts.
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn encode(&self, text: &str) -> Vec<String> {
        text.split_whitespace().map(|s| s.to_string()).collect()
    }

    fn decode(&self, tokens: &[String]) -> String {
        tokens.join(" ")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    pub content: String,
    pub tokens: u32,
    pub chunk_order_index: u32,
    pub full_doc_id: String,
}

/// Splits one document's text into `Chunk`s, id-free — callers derive
/// `chunk_id` themselves via [`crate::ids::chunk_id`] once they have the
/// owning `doc_id`, matching the way C5 and C9 both need the id before and
/// after this call.
pub fn get_chunks(doc_id: &str, text: &str, tokenizer: &dyn Tokenizer, cfg: &ChunkingConfig) -> Vec<Chunk> {
    match cfg.strategy {
        ChunkingStrategy::FixedWindow => fixed_window(text, tokenizer, cfg),
        ChunkingStrategy::SeparatorGuided => separator_guided(text, tokenizer, cfg),
    }
    .into_iter()
    .enumerate()
    .map(|(i, content)| {
        let tokens = tokenizer.encode(&content).len() as u32;
        Chunk { content, tokens, chunk_order_index: i as u32, full_doc_id: doc_id.to_string() }
    })
    .collect()
}

/// Convenience wrapper that also computes the content-addressed id, for
/// callers (C9) that want `(chunk_id, Chunk)` pairs directly.
pub fn get_chunks_with_ids(
    doc_id: &str,
    text: &str,
    tokenizer: &dyn Tokenizer,
    cfg: &ChunkingConfig,
) -> Vec<(String, Chunk)> {
    get_chunks(doc_id, text, tokenizer, cfg)
        .into_iter()
        .map(|chunk| {
            let id = chunk_id(doc_id, &chunk.content);
            (id, chunk)
        })
        .collect()
}

fn fixed_window(text: &str, tokenizer: &dyn Tokenizer, cfg: &ChunkingConfig) -> Vec<String> {
    let tokens = tokenizer.encode(text);
    if tokens.is_empty() {
        return Vec::new();
    }
    let size = cfg.size.max(1) as usize;
    let overlap = (cfg.overlap as usize).min(size.saturating_sub(1));
    let step = size - overlap;

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < tokens.len() {
        let end = (start + size).min(tokens.len());
        chunks.push(tokenizer.decode(&tokens[start..end]));
        if end == tokens.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// Recursively splits on a prioritized separator list, then falls back to
/// the fixed-window token splitter to enforce the size budget on any
/// surviving oversized piece (spec.md §4.2).
fn separator_guided(text: &str, tokenizer: &dyn Tokenizer, cfg: &ChunkingConfig) -> Vec<String> {
    let pieces = split_recursive(text, &cfg.separators);
    let mut out = Vec::new();
    let mut buffer = String::new();
    let size = cfg.size.max(1) as usize;

    for piece in pieces {
        let candidate = if buffer.is_empty() { piece.clone() } else { format!("{buffer}{piece}") };
        if tokenizer.encode(&candidate).len() > size && !buffer.is_empty() {
            out.push(buffer.clone());
            buffer = piece;
        } else {
            buffer = candidate;
        }
    }
    if !buffer.is_empty() {
        out.push(buffer);
    }

    // Any single piece that still exceeds the token budget (no separator
    // inside it small enough to help) gets force-split by the fixed window.
    out.into_iter()
        .flat_map(|piece| {
            if tokenizer.encode(&piece).len() > size {
                fixed_window(&piece, tokenizer, cfg)
            } else {
                vec![piece]
            }
        })
        .collect()
}

fn split_recursive(text: &str, separators: &[String]) -> Vec<String> {
    let Some((sep, rest)) = separators.split_first() else {
        return vec![text.to_string()];
    };
    if sep.is_empty() || !text.contains(sep.as_str()) {
        return split_recursive(text, rest);
    }
    text.split(sep.as_str())
        .enumerate()
        .map(|(i, part)| if i == 0 { part.to_string() } else { format!("{sep}{part}") })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(size: u32, overlap: u32) -> ChunkingConfig {
        ChunkingConfig { size, overlap, strategy: ChunkingStrategy::FixedWindow, ..ChunkingConfig::default() }
    }

    #[test]
    fn chunk_order_index_starts_at_zero_and_increments() {
        let text = "one two three four five six seven eight nine ten";
        let chunks = get_chunks("doc-1", text, &WhitespaceTokenizer, &cfg(4, 1));
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_order_index, i as u32);
        }
        assert!(chunks.len() > 1);
    }

    #[test]
    fn fixed_window_overlap_repeats_trailing_tokens() {
        let text = "a b c d e f g h";
        let chunks = get_chunks("doc-1", text, &WhitespaceTokenizer, &cfg(4, 2));
        assert!(chunks[0].content.ends_with("c d") || chunks[1].content.starts_with("c d"));
    }

    #[test]
    fn empty_document_yields_no_chunks() {
        let chunks = get_chunks("doc-1", "", &WhitespaceTokenizer, &cfg(100, 10));
        assert!(chunks.is_empty());
    }

    #[test]
    fn chunk_id_matches_formula_for_each_chunk() {
        let text = "alpha beta gamma delta epsilon";
        let pairs = get_chunks_with_ids("doc-42", text, &WhitespaceTokenizer, &cfg(2, 0));
        for (id, chunk) in &pairs {
            assert_eq!(*id, chunk_id("doc-42", &chunk.content));
        }
    }

    #[test]
    fn separator_guided_respects_paragraph_breaks_when_small() {
        let cfg = ChunkingConfig {
            size: 100,
            overlap: 0,
            strategy: ChunkingStrategy::SeparatorGuided,
            separators: vec!["\n\n".to_string()],
        };
        let text = "first paragraph here\n\nsecond paragraph here";
        let chunks = get_chunks("doc-1", text, &WhitespaceTokenizer, &cfg);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn separator_guided_splits_when_over_budget() {
        let cfg = ChunkingConfig {
            size: 2,
            overlap: 0,
            strategy: ChunkingStrategy::SeparatorGuided,
            separators: vec!["\n\n".to_string()],
        };
        let text = "one two three\n\nfour five six";
        let chunks = get_chunks("doc-1", text, &WhitespaceTokenizer, &cfg);
        assert!(chunks.len() >= 2);
    }
}
