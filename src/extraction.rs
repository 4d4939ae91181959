//! Entity Extractor (C4, spec.md §4.4).
//!
//! Replaces the teacher's `extract_entities_and_relations` — a single
//! `complete` call whose JSON response is parsed with `serde_json::from_str`
//! and silently swallowed on parse failure — with the full NDJSON
//! gleaning/continuation protocol the spec calls for, sharing
//! `sanitize_str`/`safe_float` with C5's merge path.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::warn;

use crate::config::EntityExtractionConfig;
use crate::llm::{looks_truncated, ChatTurn, CompletionOptions, LlmGateway};
use crate::text_util::{normalize_entity_name, safe_float_json, sanitize_str};

#[derive(Clone, Debug, Default)]
pub struct NodeFragment {
    pub entity_type: String,
    pub description: String,
    pub source_id: String,
}

#[derive(Clone, Debug, Default)]
pub struct EdgeFragment {
    pub description: String,
    pub weight: f64,
    pub source_id: String,
    pub relation_type: String,
}

#[derive(Clone, Debug, Default)]
pub struct ExtractionResult {
    pub nodes: HashMap<String, NodeFragment>,
    pub edges: Vec<(String, String, EdgeFragment)>,
}

/// One NDJSON line's raw shape (spec.md §4.4 step 3, wire format in §6).
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum RawRecord {
    Entity {
        name: Option<String>,
        entity_type: Option<String>,
        description: Option<String>,
    },
    Relationship {
        source: Option<String>,
        target: Option<String>,
        description: Option<String>,
        #[serde(default)]
        strength: Option<serde_json::Value>,
    },
}

const MAX_NODES_PER_CHUNK: usize = 500;
const MAX_EDGES_PER_CHUNK: usize = 500;

fn render_extraction_prompt(chunk_text: &str, cfg: &EntityExtractionConfig) -> String {
    format!(
        "Extract entities and relationships from the text below as NDJSON, one JSON object per line.\n\
         Valid entity types: {}.\n\
         Each line is either {{\"type\":\"entity\",\"name\":...,\"entity_type\":...,\"description\":...}} \
         or {{\"type\":\"relationship\",\"source\":...,\"target\":...,\"description\":...,\"strength\":...}}.\n\
         End your response with {}.\n\n\
         TEXT:\n{chunk_text}",
        cfg.entity_types.join(", "),
        COMPLETION_DELIMITER,
    )
}

const COMPLETION_DELIMITER: &str = "<|COMPLETE|>";
const GLEANING_PROMPT: &str =
    "MANY entities and relationships were missed in the last extraction. Add them below, same NDJSON format.";
const CONTINUATION_PROMPT: &str =
    "Your previous response appears cut off. Continue the NDJSON output, focusing on any relationships not yet emitted.";

/// Parses one NDJSON line, returning `None` for unparsable or delimiter
/// lines (spec.md §4.4 step 3: "skipped without aborting").
fn parse_line(line: &str) -> Option<RawRecord> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.contains(COMPLETION_DELIMITER) {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn derive_relation_type(description: &str, patterns: &[(String, String)]) -> String {
    let lower = description.to_lowercase();
    for (pattern, relation_type) in patterns {
        if lower.contains(&pattern.to_lowercase()) {
            return relation_type.clone();
        }
    }
    "RELATED".to_string()
}

/// Folds accumulated NDJSON text into an `ExtractionResult`, applying
/// sanitization and relation-type derivation per spec.md §4.4 steps 6-7.
fn parse_ndjson(text: &str, chunk_id: &str, cfg: &EntityExtractionConfig) -> ExtractionResult {
    let entity_types: std::collections::HashSet<String> =
        cfg.entity_types.iter().map(|t| t.to_uppercase()).collect();
    let mut result = ExtractionResult::default();

    for line in text.lines() {
        let Some(record) = parse_line(line) else { continue };
        match record {
            RawRecord::Entity { name, entity_type, description } => {
                let name = sanitize_str(name.as_deref());
                if name.is_empty() {
                    continue;
                }
                let normalized_name = normalize_entity_name(&name);
                let mut entity_type = sanitize_str(entity_type.as_deref()).to_uppercase();
                if !entity_types.contains(&entity_type) {
                    entity_type = "UNKNOWN".to_string();
                }
                let description = sanitize_str(description.as_deref());

                if result.nodes.len() >= MAX_NODES_PER_CHUNK && !result.nodes.contains_key(&normalized_name) {
                    warn!(chunk_id, "entity extraction exceeded {MAX_NODES_PER_CHUNK} nodes, truncating");
                    continue;
                }
                result
                    .nodes
                    .entry(normalized_name)
                    .or_insert(NodeFragment { entity_type, description, source_id: chunk_id.to_string() });
            }
            RawRecord::Relationship { source, target, description, strength } => {
                let source = normalize_entity_name(&sanitize_str(source.as_deref()));
                let target = normalize_entity_name(&sanitize_str(target.as_deref()));
                if source.is_empty() || target.is_empty() {
                    continue;
                }
                let description = sanitize_str(description.as_deref());
                let weight = safe_float_json(strength.as_ref());
                let relation_type = derive_relation_type(&description, &cfg.relation_patterns);

                if result.edges.len() >= MAX_EDGES_PER_CHUNK {
                    warn!(chunk_id, "relationship extraction exceeded {MAX_EDGES_PER_CHUNK} edges, truncating");
                    continue;
                }
                result.edges.push((
                    source,
                    target,
                    EdgeFragment { description, weight, source_id: chunk_id.to_string(), relation_type },
                ));
            }
        }
    }
    result
}

/// Runs the full protocol (initial extraction → gleaning → continuation)
/// for one chunk and returns its `ExtractionResult`.
pub async fn extract_chunk(
    gateway: &dyn LlmGateway,
    chunk_id: &str,
    chunk_text: &str,
    cfg: &EntityExtractionConfig,
    model: &str,
) -> crate::error::Result<ExtractionResult> {
    let options = CompletionOptions {
        model: model.to_string(),
        temperature: 0.0,
        completion_delimiter: Some(COMPLETION_DELIMITER.to_string()),
    };

    let mut history = Vec::new();
    let prompt = render_extraction_prompt(chunk_text, cfg);
    let mut responses = vec![gateway.complete(&prompt, &history, &options).await?];
    history.push(ChatTurn { role: "user".to_string(), content: prompt });
    history.push(ChatTurn { role: "assistant".to_string(), content: responses[0].clone() });

    for _ in 0..cfg.max_gleaning {
        let response = gateway.complete(GLEANING_PROMPT, &history, &options).await?;
        history.push(ChatTurn { role: "user".to_string(), content: GLEANING_PROMPT.to_string() });
        history.push(ChatTurn { role: "assistant".to_string(), content: response.clone() });
        responses.push(response);
    }

    let mut attempts = 0;
    while attempts < cfg.max_continuation_attempts
        && looks_truncated(responses.last().unwrap(), Some(COMPLETION_DELIMITER))
    {
        let response = gateway.complete(CONTINUATION_PROMPT, &history, &options).await?;
        history.push(ChatTurn { role: "user".to_string(), content: CONTINUATION_PROMPT.to_string() });
        history.push(ChatTurn { role: "assistant".to_string(), content: response.clone() });
        responses.push(response);
        attempts += 1;
    }

    let combined = responses.join("\n");
    Ok(parse_ndjson(&combined, chunk_id, cfg))
}
