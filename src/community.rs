//! Community Engine (C6, spec.md §4.6).
//!
//! Regenerates the community report hierarchy after each ingest batch:
//! drop old reports, re-cluster, then summarize every community under a
//! bounded-concurrency semaphore. The semaphore is not optional decoration —
//! spec.md §4.6 step 3 and the pool-exhaustion regression in §8 scenario 4
//! are both about this exact knob: unbounded fan-out over `get_nodes_batch`/
//! `get_edges_batch` calls during summarization is what exhausted the
//! teacher's connection pool in production.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::chunking::{Tokenizer, WhitespaceTokenizer};
use crate::config::LlmConfig;
use crate::error::Result;
use crate::llm::{ChatTurn, CompletionOptions, LlmGateway};
use crate::storage::{ClusteringAlgorithm, CommunitySchemaEntry, FieldValue, GraphStorage};
use crate::storage::KVStorage;

/// One finished community report, kept around so a coarser level can pack
/// its sub-communities' summaries into its own prompt (spec.md §4.6 step 4c).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommunityReport {
    pub community_id: i64,
    pub level: u32,
    pub report_string: String,
    pub report_json: Option<serde_json::Value>,
    pub occurrence: f64,
}

/// Structured shape a well-behaved completion returns; parsing tolerates
/// anything else by falling back to the raw text (spec.md §4.6 step e: "with
/// a fallback if parsing returns empty").
#[derive(Debug, Deserialize, Serialize)]
struct ReportJson {
    title: String,
    summary: String,
    #[serde(default)]
    rating: f64,
    #[serde(default)]
    findings: Vec<Finding>,
}

#[derive(Debug, Deserialize, Serialize)]
struct Finding {
    summary: String,
    #[serde(default)]
    explanation: String,
}

struct EntityRow {
    id: String,
    entity_type: String,
    description: String,
    rank: usize,
}

struct RelationshipRow {
    source: String,
    target: String,
    description: String,
    relation_type: String,
    weight: f64,
    rank: usize,
}

fn estimate_tokens(text: &str) -> usize {
    WhitespaceTokenizer.encode(text).len()
}

fn render_entities_csv(rows: &[EntityRow]) -> String {
    let mut out = String::from("id,entity,type,description,rank\n");
    for (i, row) in rows.iter().enumerate() {
        out.push_str(&format!(
            "{i},{},{},{},{}\n",
            csv_escape(&row.id),
            csv_escape(&row.entity_type),
            csv_escape(&row.description),
            row.rank
        ));
    }
    out
}

fn render_relationships_csv(rows: &[RelationshipRow]) -> String {
    // direction preserved as extracted, never re-sorted (spec.md §4.6
    // "Directionality invariants"); bidirectional typed edges stay as two rows.
    let mut out = String::from("id,source,target,description,relation_type,weight,rank\n");
    for (i, row) in rows.iter().enumerate() {
        out.push_str(&format!(
            "{i},{},{},{},{},{},{}\n",
            csv_escape(&row.source),
            csv_escape(&row.target),
            csv_escape(&row.description),
            csv_escape(&row.relation_type),
            row.weight,
            row.rank
        ));
    }
    out
}

fn render_sub_community_section(summaries: &[(i64, String)]) -> String {
    if summaries.is_empty() {
        return String::new();
    }
    let mut out = String::from("\nSub-community summaries:\nid,summary\n");
    for (id, summary) in summaries {
        out.push_str(&format!("{id},{}\n", csv_escape(summary)));
    }
    out
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn render_pack(entities: &[EntityRow], relationships: &[RelationshipRow], subs: &[(i64, String)]) -> String {
    format!(
        "Entities:\n{}\nRelationships:\n{}\n{}",
        render_entities_csv(entities),
        render_relationships_csv(relationships),
        render_sub_community_section(subs)
    )
}

fn render_report_prompt(pack: &str) -> String {
    format!(
        "You are analyzing a community of related entities extracted from a knowledge graph. \
         Summarize this community as JSON with keys \"title\", \"summary\", \"rating\" (0-10), \
         and \"findings\" (a list of {{\"summary\",\"explanation\"}} objects).\n\n{pack}"
    )
}

/// Drops the lowest-ranked row from whichever list currently has the
/// smaller minimum rank, so both sections shrink roughly proportionally
/// rather than one section disappearing entirely first.
fn drop_lowest_ranked(entities: &mut Vec<EntityRow>, relationships: &mut Vec<RelationshipRow>) -> bool {
    let min_entity_rank = entities.iter().map(|r| r.rank).min();
    let min_rel_rank = relationships.iter().map(|r| r.rank).min();

    match (min_entity_rank, min_rel_rank) {
        (None, None) => false,
        (Some(_), None) => {
            entities.pop();
            true
        }
        (None, Some(_)) => {
            relationships.pop();
            true
        }
        (Some(e), Some(r)) => {
            if e <= r {
                if let Some(pos) = entities.iter().position(|row| row.rank == e) {
                    entities.remove(pos);
                }
            } else if let Some(pos) = relationships.iter().position(|row| row.rank == r) {
                relationships.remove(pos);
            }
            true
        }
    }
}

async fn fetch_rows(
    graph: &dyn GraphStorage,
    entry: &CommunitySchemaEntry,
) -> Result<(Vec<EntityRow>, Vec<RelationshipRow>)> {
    let nodes = graph.get_nodes_batch(&entry.nodes).await?;
    let degrees = graph.node_degrees_batch(&entry.nodes).await?;

    let entity_rows: Vec<EntityRow> = entry
        .nodes
        .iter()
        .zip(nodes)
        .zip(degrees)
        .filter_map(|((id, node), degree)| {
            node.map(|n| EntityRow {
                id: id.clone(),
                entity_type: n.entity_type,
                description: n.description,
                rank: degree,
            })
        })
        .collect();

    let edges = graph.get_edges_batch(&entry.edges).await?;
    let relationship_rows: Vec<RelationshipRow> = entry
        .edges
        .iter()
        .zip(edges)
        .filter_map(|((src, tgt), edge)| {
            edge.map(|e| RelationshipRow {
                source: src.clone(),
                target: tgt.clone(),
                description: e.description,
                relation_type: e.relation_type,
                weight: e.weight,
                rank: e.weight as usize,
            })
        })
        .collect();

    Ok((entity_rows, relationship_rows))
}

fn fallback_report(entry: &CommunitySchemaEntry, entities: &[EntityRow]) -> CommunityReport {
    let names: Vec<&str> = entities.iter().map(|e| e.id.as_str()).take(10).collect();
    CommunityReport {
        community_id: 0,
        level: entry.level,
        report_string: format!(
            "Community of {} entities (truncated fallback): {}",
            entities.len(),
            names.join(", ")
        ),
        report_json: None,
        occurrence: entry.occurrence,
    }
}

async fn summarize_community(
    id: i64,
    entry: CommunitySchemaEntry,
    graph: &dyn GraphStorage,
    gateway: &dyn LlmGateway,
    llm_cfg: &LlmConfig,
    child_reports: &DashMap<i64, CommunityReport>,
) -> Result<CommunityReport> {
    let (mut entity_rows, mut relationship_rows) = fetch_rows(graph, &entry).await?;

    let sub_summaries: Vec<(i64, String)> = entry
        .sub_communities
        .iter()
        .filter_map(|sub_id| child_reports.get(sub_id).map(|r| (*sub_id, r.report_string.clone())))
        .collect();

    let budget = ((llm_cfg.model_context_tokens as f64 * llm_cfg.community_report_token_budget_ratio) as i64
        - llm_cfg.community_report_chat_overhead as i64)
        .max(0) as usize;

    let mut pack = render_pack(&entity_rows, &relationship_rows, &sub_summaries);
    if estimate_tokens(&pack) > budget {
        entity_rows.sort_by_key(|r| r.rank);
        relationship_rows.sort_by_key(|r| r.rank);
        let mut repacked = false;
        while estimate_tokens(&pack) > budget {
            if !drop_lowest_ranked(&mut entity_rows, &mut relationship_rows) {
                break;
            }
            pack = render_pack(&entity_rows, &relationship_rows, &sub_summaries);
            repacked = true;
        }
        if repacked && estimate_tokens(&pack) > budget {
            warn!(community_id = id, "community pack still over budget after re-pack, emitting fallback report");
            let mut fallback = fallback_report(&entry, &entity_rows);
            fallback.community_id = id;
            return Ok(fallback);
        }
    }

    let prompt = render_report_prompt(&pack);
    let options = CompletionOptions {
        model: llm_cfg.chat_model.clone(),
        temperature: 0.0,
        completion_delimiter: None,
    };
    let response = gateway.complete(&prompt, &[] as &[ChatTurn], &options).await?;

    let parsed: Option<ReportJson> = serde_json::from_str(&response).ok();
    let (report_string, report_json) = match parsed {
        Some(parsed) if !parsed.summary.is_empty() => {
            let json = serde_json::to_value(&parsed).ok();
            (parsed.summary, json)
        }
        _ => (response, None),
    };

    Ok(CommunityReport { community_id: id, level: entry.level, report_string, report_json, occurrence: entry.occurrence })
}

/// Runs the full state machine of spec.md §4.6: drop, cluster, summarize
/// level-by-level from the finest level up to the root.
///
/// The spec's prose ("process levels top-down (root first)" in step 3
/// alongside "process bottom-up... child reports feed parent packing" in
/// step 5) is internally inconsistent — a root's pack needs its children's
/// reports already written, and `sub_communities` only ever point to
/// `level+1` (finer), never coarser. This resolves the ambiguity by
/// processing the highest level number (finest-grained) first and working
/// down to level 0 (root), which is the only order step 5's hard
/// requirement can be satisfied under. See DESIGN.md.
pub async fn run_community_pass(
    graph: &dyn GraphStorage,
    community_reports: &dyn KVStorage,
    gateway: &dyn LlmGateway,
    llm_cfg: &LlmConfig,
) -> Result<usize> {
    community_reports.drop().await?;

    graph.clustering(ClusteringAlgorithm::HierarchicalLeiden).await?;
    let schema = graph.community_schema().await?;

    let mut by_level: HashMap<u32, Vec<(i64, CommunitySchemaEntry)>> = HashMap::new();
    for (id, entry) in schema {
        by_level.entry(entry.level).or_default().push((id, entry));
    }
    let mut levels: Vec<u32> = by_level.keys().copied().collect();
    levels.sort_unstable_by(|a, b| b.cmp(a));

    let child_reports: Arc<DashMap<i64, CommunityReport>> = Arc::new(DashMap::new());
    let assigned: Arc<DashMap<String, ()>> = Arc::new(DashMap::new());
    let concurrency = llm_cfg.community_report_max_concurrency.max(1);
    let mut total = 0usize;

    for level in levels {
        let communities = by_level.remove(&level).unwrap_or_default();
        let child_reports = child_reports.clone();

        let reports: Vec<Result<CommunityReport>> = stream::iter(communities.into_iter().map(|(id, entry)| {
            let child_reports = child_reports.clone();
            async move { summarize_community(id, entry, graph, gateway, llm_cfg, &child_reports).await }
        }))
        .buffer_unordered(concurrency)
        .collect()
        .await;

        for report in reports {
            let report = match report {
                Ok(r) => r,
                Err(err) => {
                    warn!("community summarization failed: {}", err.message);
                    continue;
                }
            };

            let key = format!("community-{}", report.community_id);
            community_reports
                .upsert(std::collections::HashMap::from([(key, serde_json::to_value(&report)?)]))
                .await?;

            total += 1;
            child_reports.insert(report.community_id, report);
        }
    }

    // Second pass: stamp each node's community_description from the
    // finest-grained report it belongs to (spec.md §3 Entity,
    // `community_description` "updated during community pass").
    let schema_after = graph.community_schema().await?;
    let mut entries: Vec<(i64, CommunitySchemaEntry)> = schema_after.into_iter().collect();
    entries.sort_by(|a, b| b.1.level.cmp(&a.1.level));

    for (id, entry) in entries {
        let Some(report) = child_reports.get(&id) else { continue };
        let mut fresh = Vec::new();
        for node_id in &entry.nodes {
            if assigned.insert(node_id.clone(), ()).is_none() {
                fresh.push(node_id.clone());
            }
        }
        if fresh.is_empty() {
            continue;
        }
        graph
            .batch_update_node_field(&fresh, "community_description", FieldValue::Str(report.report_string.clone()))
            .await?;
    }

    Ok(total)
}
