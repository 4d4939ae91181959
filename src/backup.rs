//! Backup Orchestrator (C10, spec.md §4.10).
//!
//! Entirely new relative to the teacher, which never persists snapshots —
//! grounded in the pack's own tar/flate2 usage (`mvp01/src/output.rs`'s
//! `ZlibEncoder`-over-`File` pattern) generalized from one protobuf blob to
//! a multi-entry `.ngbak` archive.
//!
//! The checksum protocol is the one genuinely subtle piece: `manifest.json`
//! is itself part of the hashed payload, but its own `checksum` field can't
//! hash itself. The field is always absent from the manifest's JSON
//! representation while the checksum is computed or verified, and only
//! populated in the copy that's actually written to the archive — so
//! hashing and restoring both operate on the same "checksum-less" byte
//! sequence with no self-reference paradox.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::AppConfig;
use crate::error::{GraphRagError, Result};
use crate::storage::StorageTier;

const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StorageBackendsInfo {
    graph: String,
    vector: String,
    kv: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct BackupStatistics {
    entities: usize,
    relationships: usize,
    communities: usize,
    documents: usize,
    chunks: usize,
    vectors: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BackupManifest {
    backup_id: String,
    created_at: String,
    engine_version: String,
    storage_backends: StorageBackendsInfo,
    statistics: BackupStatistics,
    /// Absent (not null) while unpopulated — the checksum-less
    /// representation this module's protocol hashes over.
    #[serde(skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
}

/// One in-memory archive entry, keyed by its path inside the `.ngbak` tar.
struct Entry {
    path: String,
    bytes: Vec<u8>,
}

/// `sha256` over every entry's `(relative_path, bytes)` pair, walked in
/// sorted path order (spec.md §4.10 "the subtle part").
fn payload_checksum(entries: &[Entry]) -> String {
    let mut ordered: Vec<&Entry> = entries.iter().collect();
    ordered.sort_by(|a, b| a.path.cmp(&b.path));

    let mut hasher = Sha256::new();
    for entry in ordered {
        hasher.update(entry.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(&entry.bytes);
    }
    format!("sha256:{:x}", hasher.finalize())
}

async fn export_kv_namespace(store: &dyn crate::storage::KVStorage) -> Result<serde_json::Value> {
    let keys = store.all_keys().await?;
    let values = store.get_by_ids(&keys).await?;
    let map: serde_json::Map<String, serde_json::Value> = keys
        .into_iter()
        .zip(values)
        .map(|(k, v)| (k, v.unwrap_or(serde_json::Value::Null)))
        .collect();
    Ok(serde_json::Value::Object(map))
}

fn config_snapshot(cfg: &AppConfig) -> serde_json::Value {
    serde_json::json!({
        "storage": {
            "graph_backend": format!("{:?}", cfg.storage.graph_backend),
            "vector_backend": format!("{:?}", cfg.storage.vector_backend),
            "kv_backend": format!("{:?}", cfg.storage.kv_backend),
            "neo4j_batch_size": cfg.storage.neo4j_batch_size,
        },
        "entity_extraction": {
            "entity_types": cfg.entity_extraction.entity_types,
            "max_gleaning": cfg.entity_extraction.max_gleaning,
            "max_continuation_attempts": cfg.entity_extraction.max_continuation_attempts,
        },
        "llm": {
            "chat_model": cfg.llm.chat_model,
            "embedding_model": cfg.llm.embedding_model,
            "community_report_max_concurrency": cfg.llm.community_report_max_concurrency,
        },
        "chunking": {
            "size": cfg.chunking.size,
            "overlap": cfg.chunking.overlap,
        },
    })
}

fn write_tar_gz(entries: &[Entry], dest: &Path) -> Result<()> {
    let file = std::fs::File::create(dest)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(entry.bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, &entry.path, entry.bytes.as_slice())
            .map_err(GraphRagError::from)?;
    }

    let encoder = builder.into_inner().map_err(GraphRagError::from)?;
    encoder.finish().map_err(GraphRagError::from)?;
    Ok(())
}

fn read_tar_gz(path: &Path) -> Result<Vec<Entry>> {
    let file = std::fs::File::open(path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);

    let mut entries = Vec::new();
    for file in archive.entries().map_err(GraphRagError::from)? {
        let mut file = file.map_err(GraphRagError::from)?;
        let path = file.path().map_err(GraphRagError::from)?.to_string_lossy().to_string();
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        entries.push(Entry { path, bytes });
    }
    Ok(entries)
}

/// Creates `<output_dir>/<backup_id>.ngbak` plus a sidecar
/// `<backup_id>.checksum` file, returning the archive path.
pub async fn create_backup(
    storage: &StorageTier,
    cfg: &AppConfig,
    backup_id: &str,
    output_dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;

    let graph_snapshot = storage.graph.export_snapshot().await?;
    let entity_vector_snapshot = storage.entity_vectors.export_snapshot().await?;
    let chunk_vector_snapshot = storage.chunk_vectors.export_snapshot().await?;
    let full_docs_snapshot = export_kv_namespace(storage.full_docs.as_ref()).await?;
    let text_chunks_snapshot = export_kv_namespace(storage.text_chunks.as_ref()).await?;
    let community_reports_snapshot = export_kv_namespace(storage.community_reports.as_ref()).await?;

    let statistics = BackupStatistics {
        entities: graph_snapshot.get("nodes").and_then(|v| v.as_array()).map(|a| a.len()).unwrap_or(0),
        relationships: graph_snapshot.get("edges").and_then(|v| v.as_array()).map(|a| a.len()).unwrap_or(0),
        communities: graph_snapshot.get("communities").and_then(|v| v.as_array()).map(|a| a.len()).unwrap_or(0),
        documents: full_docs_snapshot.as_object().map(|o| o.len()).unwrap_or(0),
        chunks: text_chunks_snapshot.as_object().map(|o| o.len()).unwrap_or(0),
        vectors: entity_vector_snapshot.as_object().map(|o| o.len()).unwrap_or(0)
            + chunk_vector_snapshot.as_object().map(|o| o.len()).unwrap_or(0),
    };

    let manifest = BackupManifest {
        backup_id: backup_id.to_string(),
        created_at: chrono::Utc::now().to_rfc3339(),
        engine_version: ENGINE_VERSION.to_string(),
        storage_backends: StorageBackendsInfo {
            graph: format!("{:?}", cfg.storage.graph_backend),
            vector: format!("{:?}", cfg.storage.vector_backend),
            kv: format!("{:?}", cfg.storage.kv_backend),
        },
        statistics,
        checksum: None,
    };

    let mut entries = vec![
        Entry { path: "graph/graph.json".to_string(), bytes: serde_json::to_vec(&graph_snapshot)? },
        Entry { path: "vector/entities.json".to_string(), bytes: serde_json::to_vec(&entity_vector_snapshot)? },
        Entry { path: "vector/chunks.json".to_string(), bytes: serde_json::to_vec(&chunk_vector_snapshot)? },
        Entry { path: "kv/full_docs.json".to_string(), bytes: serde_json::to_vec(&full_docs_snapshot)? },
        Entry { path: "kv/text_chunks.json".to_string(), bytes: serde_json::to_vec(&text_chunks_snapshot)? },
        Entry {
            path: "kv/community_reports.json".to_string(),
            bytes: serde_json::to_vec(&community_reports_snapshot)?,
        },
        Entry { path: "config/graphrag_config.json".to_string(), bytes: serde_json::to_vec(&config_snapshot(cfg))? },
        Entry { path: "manifest.json".to_string(), bytes: serde_json::to_vec(&manifest)? },
    ];

    let checksum = payload_checksum(&entries);

    let final_manifest = BackupManifest { checksum: Some(checksum.clone()), ..manifest };
    let final_manifest_bytes = serde_json::to_vec(&final_manifest)?;
    if let Some(manifest_entry) = entries.iter_mut().find(|e| e.path == "manifest.json") {
        manifest_entry.bytes = final_manifest_bytes;
    }

    let archive_path = output_dir.join(format!("{backup_id}.ngbak"));
    write_tar_gz(&entries, &archive_path)?;

    let checksum_path = output_dir.join(format!("{backup_id}.checksum"));
    let mut checksum_file = std::fs::File::create(&checksum_path)?;
    checksum_file.write_all(checksum.as_bytes())?;

    Ok(archive_path)
}

/// Extracts an `.ngbak` archive and restores graph, then vector, then KV
/// (spec.md §4.10 restore order), verifying the manifest checksum along
/// the way. A checksum mismatch is logged at WARN, not fatal — restore
/// proceeds on already-extracted data (spec.md §7 Integrity errors).
pub async fn restore_backup(storage: &StorageTier, archive_path: &Path) -> Result<()> {
    let entries = read_tar_gz(archive_path)?;

    let manifest_entry = entries
        .iter()
        .find(|e| e.path == "manifest.json")
        .ok_or_else(|| GraphRagError::fatal("archive missing manifest.json"))?;
    let manifest: BackupManifest = serde_json::from_slice(&manifest_entry.bytes)?;
    let stored_checksum = manifest.checksum.clone();

    let checksum_less_manifest = BackupManifest { checksum: None, ..manifest.clone() };
    let checksum_less_bytes = serde_json::to_vec(&checksum_less_manifest)?;

    let mut verification_entries: Vec<Entry> = entries
        .iter()
        .filter(|e| e.path != "manifest.json")
        .map(|e| Entry { path: e.path.clone(), bytes: e.bytes.clone() })
        .collect();
    verification_entries.push(Entry { path: "manifest.json".to_string(), bytes: checksum_less_bytes });

    let recomputed = payload_checksum(&verification_entries);
    match stored_checksum {
        Some(expected) if expected != recomputed => {
            warn!(
                expected,
                recomputed, "UNEXPECTED: backup checksum mismatch, restore proceeding on extracted data anyway"
            );
        }
        None => warn!("backup archive carries no checksum to verify against"),
        _ => {}
    }

    let find = |path: &str| -> Result<serde_json::Value> {
        entries
            .iter()
            .find(|e| e.path == path)
            .map(|e| serde_json::from_slice::<serde_json::Value>(&e.bytes))
            .transpose()
            .map_err(GraphRagError::from)?
            .ok_or_else(|| GraphRagError::fatal(format!("archive missing {path}")))
    };

    storage.graph.import_snapshot(find("graph/graph.json")?).await?;
    storage.entity_vectors.import_snapshot(find("vector/entities.json")?).await?;
    storage.chunk_vectors.import_snapshot(find("vector/chunks.json")?).await?;

    restore_kv_namespace(storage.full_docs.as_ref(), find("kv/full_docs.json")?).await?;
    restore_kv_namespace(storage.text_chunks.as_ref(), find("kv/text_chunks.json")?).await?;
    restore_kv_namespace(storage.community_reports.as_ref(), find("kv/community_reports.json")?).await?;

    Ok(())
}

/// KV restore always goes through `upsert`, never a raw key-value write,
/// to avoid double-serializing an already-JSON value (spec.md §4.10).
async fn restore_kv_namespace(store: &dyn crate::storage::KVStorage, snapshot: serde_json::Value) -> Result<()> {
    let Some(map) = snapshot.as_object() else {
        return Ok(());
    };
    if map.is_empty() {
        return Ok(());
    }
    let items: std::collections::HashMap<String, serde_json::Value> =
        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    store.upsert(items).await
}
