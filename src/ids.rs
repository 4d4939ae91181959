//! Content-addressed id helpers (spec.md §3).
//!
//! Two distinct key spaces meet in this engine: graph-node ids (entity
//! names) and vector-record ids (hashed). Per the DESIGN NOTES' "dual-key
//! system" guidance, no code path should derive one from the other directly
//! — it must always go through these named helpers.

use md5::{Digest as Md5Digest, Md5};
use sha2::{Digest as Sha2Digest, Sha256};

/// `doc-<hex>`: stable hash of raw document content.
pub fn document_id(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("doc-{:x}", hasher.finalize())
}

/// `chunk-<hex>`: hash of `"<doc_id>::<content>"`, so identical chunk text in
/// two different documents never collides.
pub fn chunk_id(doc_id: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(doc_id.as_bytes());
    hasher.update(b"::");
    hasher.update(content.as_bytes());
    format!("chunk-{:x}", hasher.finalize())
}

/// `ent-<md5(entity_name)>`: the vector-store key for an entity.
///
/// `entity_name` must already be normalized (spec.md §3: case-insensitive
/// storage, names held uppercase) — callers should route names through
/// [`crate::text_util::normalize_entity_name`] first.
pub fn entity_vector_id(entity_name: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(entity_name.as_bytes());
    format!("ent-{:x}", hasher.finalize())
}

/// `chunk-<...>`: the vector-store key for a chunk (naive mode only). Shares
/// the chunk's graph id — chunks have no separate dual-key problem because
/// naive mode never merges placeholder/real chunk records.
pub fn chunk_vector_id(chunk_id: &str) -> String {
    chunk_id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_is_deterministic() {
        assert_eq!(document_id("hello"), document_id("hello"));
    }

    #[test]
    fn document_id_differs_by_content() {
        assert_ne!(document_id("hello"), document_id("world"));
    }

    #[test]
    fn document_id_has_prefix() {
        assert!(document_id("x").starts_with("doc-"));
    }

    #[test]
    fn chunk_id_is_doc_scoped() {
        let a = chunk_id("doc-1", "same text");
        let b = chunk_id("doc-2", "same text");
        assert_ne!(a, b, "identical chunk content across docs must not collide");
    }

    #[test]
    fn chunk_id_matches_spec_formula() {
        let doc = "doc-abc";
        let content = "some chunk text";
        let expected = {
            let mut hasher = Sha256::new();
            hasher.update(format!("{doc}::{content}").as_bytes());
            format!("chunk-{:x}", hasher.finalize())
        };
        assert_eq!(chunk_id(doc, content), expected);
    }

    #[test]
    fn entity_vector_id_uses_md5() {
        let mut hasher = Md5::new();
        hasher.update(b"EXECUTIVE ORDER 14196");
        let expected = format!("ent-{:x}", hasher.finalize());
        assert_eq!(entity_vector_id("EXECUTIVE ORDER 14196"), expected);
    }
}
