//! Incremental indexer.
//!
//! Converges the persisted index to the on-disk document tree with
//! minimal work: unchanged fingerprints are skipped with zero writes,
//! changed documents get their whole chunk set replaced inside one
//! transaction, and documents whose file vanished are cascade-deleted.
//! Embeddings are best-effort — a capability failure is collected and
//! reported, never rolls back the lexical commit.
//!
//! A failing document never aborts the pass; its error lands in the
//! summary and the remaining documents continue.

use globset::{Glob, GlobSet, GlobSetBuilder};
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::capability::{Capability, HttpCapability};
use crate::chunker::{chunk_markdown, guess_title};
use crate::config::{self, Config, ScanConfig, META_FILENAME};
use crate::db;
use crate::dir_meta;
use crate::error::{KbError, Result};
use crate::models::{Chunk, DocRecord, IndexIssue, IndexOptions, IndexSummary};
use crate::schema;
use crate::store;
use crate::util::{normalize_rel_path, sha256_hex};

const EMBED_BATCH_SIZE: usize = 32;
const SUMMARY_CHARS: usize = 220;

/// Run an indexing pass, building the embed capability from config when
/// requested.
pub async fn index(root: &Path, options: &IndexOptions) -> Result<IndexSummary> {
    let config = config::load_config(root)?;
    let capability = if options.with_embeddings && config.capability.embed_enabled() {
        Some(HttpCapability::new(&config.capability)?)
    } else {
        if options.with_embeddings {
            warn!("embeddings requested but capability.base_url/model_embed not configured");
        }
        None
    };
    index_with(
        root,
        options,
        capability.as_ref().map(|c| c as &dyn Capability),
    )
    .await
}

/// Run an indexing pass with an explicit capability (or none).
pub async fn index_with(
    root: &Path,
    options: &IndexOptions,
    capability: Option<&dyn Capability>,
) -> Result<IndexSummary> {
    if !root.exists() {
        return Err(KbError::Fatal(format!(
            "knowledge base root does not exist: {}",
            root.display()
        )));
    }
    let config = config::load_config(root)?;
    let paths = config::resolve_paths(root, &config);
    if !paths.kb_dir.exists() {
        return Err(KbError::Fatal(format!(
            "document tree does not exist: {} (run: kb init)",
            paths.kb_dir.display()
        )));
    }

    info!(
        root = %root.display(),
        rebuild = options.rebuild,
        embed = capability.is_some(),
        "index start"
    );

    if options.rebuild {
        remove_index_files(&paths.db_path);
    }

    let pool = db::connect(&paths.db_path, true).await?;
    schema::init_schema(&pool).await?;

    let result = run_pass(&pool, &config, &paths.kb_dir, options, capability).await;
    pool.close().await;
    result
}

async fn run_pass(
    pool: &SqlitePool,
    config: &Config,
    kb_dir: &Path,
    options: &IndexOptions,
    capability: Option<&dyn Capability>,
) -> Result<IndexSummary> {
    refresh_dir_meta_cache(pool, kb_dir).await?;

    let existing = store::load_doc_index(pool).await?;

    let only: BTreeSet<String> = options
        .only
        .iter()
        .map(|p| normalize_rel_path(p))
        .collect::<Result<_>>()?;

    let mut files = scan_kb_files(kb_dir, &config.scan)?;
    if !only.is_empty() {
        files.retain(|(_, rel)| only.contains(rel));
    }
    debug!(files = files.len(), "scan complete");

    let current: BTreeSet<&str> = files.iter().map(|(_, rel)| rel.as_str()).collect();
    let mut summary = IndexSummary::default();

    // Cascade deletions first. With a restricted pass, only paths inside
    // the restriction are eligible — other documents must stay intact.
    let mut deleted: Vec<&String> = existing
        .keys()
        .filter(|rel| !current.contains(rel.as_str()))
        .filter(|rel| only.is_empty() || only.contains(rel.as_str()))
        .collect();
    deleted.sort();
    for rel_path in deleted {
        match store::delete_document(pool, rel_path).await {
            Ok(true) => {
                info!(rel_path = %rel_path, "deleted vanished document");
                summary.documents_deleted += 1;
            }
            Ok(false) => {}
            Err(e) => summary.errors.push(IndexIssue {
                rel_path: rel_path.clone(),
                message: e.to_string(),
            }),
        }
    }

    for (abs_path, rel_path) in &files {
        let stamp = match read_file_stamp(abs_path) {
            Ok(stamp) => stamp,
            Err(e) => {
                summary.errors.push(IndexIssue {
                    rel_path: rel_path.clone(),
                    message: e.to_string(),
                });
                continue;
            }
        };

        if let Some(prev) = existing.get(rel_path) {
            if prev.content_hash == stamp.content_hash
                && prev.size == stamp.size
                && prev.mtime_ns == stamp.mtime_ns
            {
                summary.documents_unchanged += 1;
                continue;
            }
        }

        let chunks =
            match index_document(pool, config, rel_path, &stamp, &mut summary).await {
                Some(chunks) => chunks,
                None => continue,
            };

        if let Some(capability) = capability {
            embed_document(pool, capability, rel_path, &chunks, &mut summary).await;
        }
    }

    let wrote_anything = options.rebuild
        || summary.documents_changed > 0
        || summary.documents_deleted > 0
        || !summary.errors.is_empty();
    if wrote_anything {
        store::log_action(
            pool,
            "index",
            &serde_json::json!({
                "rebuild": options.rebuild,
                "deleted_docs": summary.documents_deleted,
                "updated_docs": summary.documents_changed,
                "updated_chunks": summary.chunks_written,
                "embedded_chunks": summary.chunks_embedded,
                "unchanged_docs": summary.documents_unchanged,
                "errors": summary.errors.len(),
            }),
        )
        .await?;
    }

    info!(
        deleted = summary.documents_deleted,
        updated = summary.documents_changed,
        unchanged = summary.documents_unchanged,
        chunks = summary.chunks_written,
        embedded = summary.chunks_embedded,
        errors = summary.errors.len(),
        "index done"
    );
    Ok(summary)
}

struct FileStamp {
    bytes: Vec<u8>,
    content_hash: String,
    mtime_ns: i64,
    size: i64,
}

fn read_file_stamp(path: &Path) -> Result<FileStamp> {
    let metadata = std::fs::metadata(path)?;
    let mtime_ns = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    let bytes = std::fs::read(path)?;
    Ok(FileStamp {
        content_hash: sha256_hex(&bytes),
        mtime_ns,
        size: metadata.len() as i64,
        bytes,
    })
}

/// Re-chunk one changed document and replace its row set. Returns the
/// new chunks on success; a failure is collected and leaves the
/// document's prior state in place.
async fn index_document(
    pool: &SqlitePool,
    config: &Config,
    rel_path: &str,
    stamp: &FileStamp,
    summary: &mut IndexSummary,
) -> Option<Vec<Chunk>> {
    let text = String::from_utf8_lossy(&stamp.bytes);
    let (frontmatter, chunks) = chunk_markdown(&text, &config.chunking);

    let stem = Path::new(rel_path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| rel_path.to_string());
    let title = frontmatter
        .title
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| guess_title(&text, &stem));
    let summary_text = frontmatter
        .summary
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| derive_summary(&chunks));

    let doc = DocRecord {
        doc_id: store::doc_id_for(rel_path),
        rel_path: rel_path.to_string(),
        title,
        summary: summary_text,
        tags: frontmatter.tags,
        keywords: frontmatter.keywords,
        mtime_ns: stamp.mtime_ns,
        size: stamp.size,
        content_hash: stamp.content_hash.clone(),
    };

    match store::replace_document(pool, &doc, &chunks).await {
        Ok(()) => {
            debug!(rel_path = %rel_path, chunks = chunks.len(), "indexed");
            summary.documents_changed += 1;
            summary.chunks_written += chunks.len() as u64;
            Some(chunks)
        }
        Err(e) => {
            warn!(rel_path = %rel_path, error = %e, "replace failed, prior state kept");
            summary.errors.push(IndexIssue {
                rel_path: rel_path.to_string(),
                message: e.to_string(),
            });
            None
        }
    }
}

/// Embed a freshly indexed document's chunks. Best-effort: any failure
/// is collected and the document stays lexical-only.
async fn embed_document(
    pool: &SqlitePool,
    capability: &dyn Capability,
    rel_path: &str,
    chunks: &[Chunk],
    summary: &mut IndexSummary,
) {
    if chunks.is_empty() {
        return;
    }

    let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
    for batch in chunks.chunks(EMBED_BATCH_SIZE) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        match capability.embed(&texts).await {
            Ok(batch_vectors) => vectors.extend(batch_vectors),
            Err(e) => {
                warn!(rel_path = %rel_path, error = %e, "embedding failed, skipped");
                summary.errors.push(IndexIssue {
                    rel_path: rel_path.to_string(),
                    message: format!("embedding skipped: {e}"),
                });
                return;
            }
        }
    }

    let rows: Vec<(String, Vec<f32>)> = chunks
        .iter()
        .zip(vectors)
        .map(|(chunk, vector)| (store::chunk_id_for(rel_path, chunk.chunk_index), vector))
        .collect();

    match store::upsert_embeddings(pool, capability.model_embed(), &rows).await {
        Ok(()) => summary.chunks_embedded += rows.len() as u64,
        Err(e) => summary.errors.push(IndexIssue {
            rel_path: rel_path.to_string(),
            message: format!("embedding write failed: {e}"),
        }),
    }
}

fn derive_summary(chunks: &[Chunk]) -> String {
    chunks
        .first()
        .map(|c| {
            c.text
                .replace('\n', " ")
                .trim()
                .chars()
                .take(SUMMARY_CHARS)
                .collect()
        })
        .unwrap_or_default()
}

/// Walk the directory tree and refresh the `dir_meta` cache from each
/// directory's `meta.json`. Unchanged records are skipped so a no-op
/// pass performs no writes.
async fn refresh_dir_meta_cache(pool: &SqlitePool, kb_dir: &Path) -> Result<()> {
    for entry in WalkDir::new(kb_dir)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name().to_string_lossy().as_ref()))
    {
        let entry = entry.map_err(|e| KbError::Fatal(format!("scan failed: {e}")))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let meta = dir_meta::read_dir_meta(entry.path(), META_FILENAME)?;
        let rel = rel_dir(kb_dir, entry.path());
        let meta_json =
            serde_json::to_string(&meta).unwrap_or_else(|_| "{}".to_string());
        store::upsert_dir_meta(pool, &rel, &meta_json).await?;
    }
    Ok(())
}

/// Enumerate indexable files under the tree, sorted by relative path
/// for deterministic processing order.
pub(crate) fn scan_kb_files(kb_dir: &Path, scan: &ScanConfig) -> Result<Vec<(PathBuf, String)>> {
    let include = build_globset(&scan.include_globs)?;
    let exclude = build_globset(&scan.exclude_globs)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(kb_dir)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name().to_string_lossy().as_ref()))
    {
        let entry = entry.map_err(|e| KbError::Fatal(format!("scan failed: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name == META_FILENAME {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(kb_dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        if exclude.is_match(&rel) || !include.is_match(&rel) {
            continue;
        }
        files.push((entry.path().to_path_buf(), rel));
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.') && name != "." && name != ".."
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .map_err(|e| KbError::InvalidInput(format!("bad glob '{pattern}': {e}")))?,
        );
    }
    builder
        .build()
        .map_err(|e| KbError::InvalidInput(format!("bad glob set: {e}")))
}

fn rel_dir(kb_dir: &Path, dir: &Path) -> String {
    let rel = dir
        .strip_prefix(kb_dir)
        .unwrap_or(dir)
        .to_string_lossy()
        .replace('\\', "/");
    if rel.is_empty() {
        ".".to_string()
    } else {
        rel
    }
}

fn remove_index_files(db_path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut path = db_path.as_os_str().to_owned();
        path.push(suffix);
        let path = PathBuf::from(path);
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_hidden() {
        assert!(is_hidden(".git"));
        assert!(is_hidden(".hidden.md"));
        assert!(!is_hidden("notes"));
        assert!(!is_hidden("."));
    }

    #[test]
    fn test_scan_skips_hidden_meta_and_non_matching() {
        let tmp = tempfile::tempdir().unwrap();
        let kb = tmp.path();
        std::fs::create_dir_all(kb.join("notes")).unwrap();
        std::fs::create_dir_all(kb.join(".trash")).unwrap();
        std::fs::write(kb.join("notes/demo.md"), "# D\n").unwrap();
        std::fs::write(kb.join("notes/note.txt"), "no").unwrap();
        std::fs::write(kb.join("notes/.hidden.md"), "# H\n").unwrap();
        std::fs::write(kb.join("notes/meta.json"), "{}").unwrap();
        std::fs::write(kb.join(".trash/gone.md"), "# G\n").unwrap();

        let files = scan_kb_files(kb, &ScanConfig::default()).unwrap();
        let rels: Vec<&str> = files.iter().map(|(_, r)| r.as_str()).collect();
        assert_eq!(rels, vec!["notes/demo.md"]);
    }

    #[test]
    fn test_scan_order_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let kb = tmp.path();
        std::fs::create_dir_all(kb.join("b")).unwrap();
        std::fs::create_dir_all(kb.join("a")).unwrap();
        std::fs::write(kb.join("b/two.md"), "x").unwrap();
        std::fs::write(kb.join("a/one.md"), "x").unwrap();

        let files = scan_kb_files(kb, &ScanConfig::default()).unwrap();
        let rels: Vec<&str> = files.iter().map(|(_, r)| r.as_str()).collect();
        assert_eq!(rels, vec!["a/one.md", "b/two.md"]);
    }

    #[test]
    fn test_derive_summary_truncates() {
        let chunk = Chunk {
            chunk_index: 0,
            heading_path: String::new(),
            start_line: 1,
            end_line: 1,
            text: "line one\nline two".to_string(),
            text_hash: String::new(),
        };
        assert_eq!(derive_summary(&[chunk]), "line one line two");
        assert_eq!(derive_summary(&[]), "");
    }
}
