//! Consistency checker.
//!
//! Detects divergence between the live document tree and the persisted
//! index, then repairs it. The repair policy is coarse by design: a
//! full rebuild is always correct, so any issue triggers one. A clean
//! check performs zero writes, which makes repair idempotent — running
//! it twice in a row does nothing the second time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config;
use crate::db;
use crate::error::{KbError, Result};
use crate::indexer;
use crate::models::{IndexOptions, RepairOptions, RepairReport};
use crate::schema;
use crate::store;
use crate::util::sha256_hex;

pub async fn repair(root: &Path, options: RepairOptions) -> Result<RepairReport> {
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

    let issues = collect_issues(&config, &paths).await?;
    let issues_found = issues.len() as u64;

    if issues.is_empty() {
        info!("repair: index is consistent, nothing to do");
        return Ok(RepairReport {
            rebuilt: false,
            issues_found: 0,
            issues_fixed: 0,
            issues,
        });
    }

    info!(issues = issues_found, "repair: rebuilding index");
    indexer::index(
        root,
        &IndexOptions {
            rebuild: true,
            with_embeddings: options.with_embeddings,
            only: Vec::new(),
        },
    )
    .await?;

    let pool = db::connect(&paths.db_path, false).await?;
    store::log_action(
        &pool,
        "repair",
        &serde_json::json!({
            "issues_found": issues_found,
            "issues": issues,
            "rebuilt": true,
        }),
    )
    .await?;
    pool.close().await;

    Ok(RepairReport {
        rebuilt: true,
        issues_found,
        issues_fixed: issues_found,
        issues,
    })
}

/// Read-only probes over the store and the document tree.
async fn collect_issues(
    config: &config::Config,
    paths: &config::KbPaths,
) -> Result<Vec<String>> {
    let mut issues = Vec::new();

    if !paths.db_path.exists() {
        issues.push("index database missing".to_string());
        return Ok(issues);
    }

    let pool = db::connect(&paths.db_path, false).await?;
    let result = probe_store(&pool, config, &paths.kb_dir, &mut issues).await;
    pool.close().await;
    result?;
    Ok(issues)
}

async fn probe_store(
    pool: &sqlx::SqlitePool,
    config: &config::Config,
    kb_dir: &Path,
    issues: &mut Vec<String>,
) -> Result<()> {
    match schema::verify_schema(pool).await {
        Ok(()) => {}
        Err(KbError::StoreCorruption(msg)) => {
            issues.push(format!("schema damaged: {msg}"));
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    let indexed = store::load_doc_index(pool).await?;
    let on_disk: BTreeMap<String, PathBuf> =
        indexer::scan_kb_files(kb_dir, &config.scan)?
            .into_iter()
            .map(|(abs, rel)| (rel, abs))
            .collect();

    for rel in on_disk.keys() {
        if !indexed.contains_key(rel) {
            issues.push(format!("document not indexed: {rel}"));
        }
    }
    for (rel, stamp) in &indexed {
        match on_disk.get(rel) {
            None => issues.push(format!("indexed document missing on disk: {rel}")),
            Some(abs) => {
                let bytes = std::fs::read(abs)?;
                if sha256_hex(&bytes) != stamp.content_hash {
                    issues.push(format!("content fingerprint mismatch: {rel}"));
                }
            }
        }
    }

    let orphans = store::count_orphan_embeddings(pool).await?;
    if orphans > 0 {
        issues.push(format!("{orphans} embedding rows have no chunk"));
    }

    if config.capability.embed_enabled() {
        let foreign =
            store::count_foreign_embeddings(pool, &config.capability.model_embed).await?;
        if foreign > 0 {
            issues.push(format!(
                "{foreign} embedding rows tagged with a model other than '{}'",
                config.capability.model_embed
            ));
        }
    }

    let chunk_count = store::count_chunks(pool).await?;
    let fts_count = store::count_fts_rows(pool).await?;
    if chunk_count != fts_count {
        issues.push(format!(
            "lexical index out of step: {chunk_count} chunks vs {fts_count} lexical rows"
        ));
    }

    Ok(())
}
