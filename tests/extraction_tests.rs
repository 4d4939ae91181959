//! Entity Extractor integration coverage: the gleaning/continuation
//! protocol driven by a scripted gateway that actually emits NDJSON, rather
//! than the in-crate unit tests which exercise `parse_ndjson` directly on
//! hand-written strings.

mod common;

use graphrag_engine::config::EntityExtractionConfig;
use graphrag_engine::extraction::extract_chunk;

use common::ScriptedLlmProvider;

fn extraction_cfg() -> EntityExtractionConfig {
    EntityExtractionConfig {
        entity_types: vec!["PERSON".to_string(), "ORGANIZATION".to_string(), "LAW".to_string()],
        max_gleaning: 1,
        max_continuation_attempts: 2,
        relation_patterns: vec![("supersedes".to_string(), "SUPERSEDES".to_string())],
        enable_type_prefix_embeddings: false,
    }
}

#[tokio::test]
async fn initial_pass_and_gleaning_both_contribute_entities() {
    let chunk_text = "Executive Order 14196 supersedes Executive Order 13800.";

    let gateway = ScriptedLlmProvider::new()
        .on(
            chunk_text,
            "{\"type\":\"entity\",\"name\":\"Executive Order 14196\",\"entity_type\":\"LAW\",\"description\":\"the new order\"}\n\
             {\"type\":\"entity\",\"name\":\"EO 13800\",\"entity_type\":\"LAW\",\"description\":\"the prior order\"}\n\
             {\"type\":\"relationship\",\"source\":\"Executive Order 14196\",\"target\":\"EO 13800\",\"description\":\"Executive Order 14196 supersedes EO 13800\",\"strength\":1.0}\n\
             <|COMPLETE|>",
        )
        .on(
            "MANY entities and relationships were missed",
            "{\"type\":\"entity\",\"name\":\"Signing Ceremony\",\"entity_type\":\"EVENT\",\"description\":\"where the order was signed\"}\n<|COMPLETE|>",
        );

    let result = extract_chunk(&gateway, "chunk-1", chunk_text, &extraction_cfg(), "gpt-4o-mini").await.unwrap();

    assert_eq!(result.nodes.len(), 3, "initial pass plus one gleaning round must both be folded in");
    assert!(result.nodes.contains_key("EXECUTIVE ORDER 14196"));
    assert!(result.nodes.contains_key("EO 13800"));
    assert!(result.nodes.contains_key("SIGNING CEREMONY"), "gleaning pass entity should be merged in uppercased");

    let (_, _, edge) = result
        .edges
        .iter()
        .find(|(src, tgt, _)| src == "EXECUTIVE ORDER 14196" && tgt == "EO 13800")
        .expect("supersedes edge must be present");
    assert_eq!(edge.relation_type, "SUPERSEDES", "relation_type pattern match must win over the RELATED default");
}

#[tokio::test]
async fn continuation_recovers_a_truncated_initial_response() {
    let chunk_text = "Acme Corp employs Jane Roe as an engineer.";

    // Neither the initial response nor the gleaning round carry the
    // completion delimiter, so `looks_truncated` must trigger the
    // continuation loop; only the continuation call's response does.
    let gateway = ScriptedLlmProvider::new()
        .on(
            chunk_text,
            "{\"type\":\"entity\",\"name\":\"Acme Corp\",\"entity_type\":\"ORGANIZATION\",\"description\":\"the employer\"}",
        )
        .on("MANY entities and relationships were missed", "")
        .on(
            "Your previous response appears cut off",
            "{\"type\":\"entity\",\"name\":\"Jane Roe\",\"entity_type\":\"PERSON\",\"description\":\"an engineer\"}\n<|COMPLETE|>",
        );

    let result = extract_chunk(&gateway, "chunk-2", chunk_text, &extraction_cfg(), "gpt-4o-mini").await.unwrap();

    assert!(result.nodes.contains_key("ACME CORP"));
    assert!(result.nodes.contains_key("JANE ROE"), "continuation round's entity must still be recovered");
}

#[tokio::test]
async fn unparseable_gleaning_round_does_not_fail_the_whole_chunk() {
    let chunk_text = "Plain text with a single mention of Acme Corp.";

    let gateway = ScriptedLlmProvider::new()
        .on(
            chunk_text,
            "{\"type\":\"entity\",\"name\":\"Acme Corp\",\"entity_type\":\"ORGANIZATION\",\"description\":\"mentioned once\"}\n<|COMPLETE|>",
        )
        .on("MANY entities and relationships were missed", "not valid ndjson at all<|COMPLETE|>");

    let result = extract_chunk(&gateway, "chunk-3", chunk_text, &extraction_cfg(), "gpt-4o-mini").await.unwrap();

    assert_eq!(result.nodes.len(), 1);
    assert!(result.nodes.contains_key("ACME CORP"));
}
