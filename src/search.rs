//! Hybrid retriever: lexical recall, semantic recall, score fusion.
//!
//! Lexical recall ranks chunks with FTS5 bm25; semantic recall embeds
//! the query and exhaustively scans the stored vectors for the
//! configured model (correctness over scale — no approximate index).
//! In hybrid mode both score lists are min-max normalized to `[0, 1]`
//! independently, then combined with a fixed linear weight
//! (`hybrid_alpha` on the semantic side). A chunk found by only one
//! modality participates with the other side treated as zero.
//!
//! Directory metadata provides an optional structural bias on top of
//! the fused content scores. Ties are broken by path and start line so
//! identical queries always return identical orderings.

use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

use crate::capability::{blob_to_vec, Capability, HttpCapability};
use crate::config::{self, Config};
use crate::db;
use crate::dir_meta::DirMeta;
use crate::error::{KbError, Result};
use crate::models::{RetrievedChunk, ScoreSource, SearchMode, SearchOutcome};
use crate::schema;
use crate::store;

/// Run a search, building the embed capability from config when the
/// mode needs it.
pub async fn search(
    root: &Path,
    query: &str,
    mode: SearchMode,
    top_k: usize,
) -> Result<SearchOutcome> {
    let config = config::load_config(root)?;
    let capability = if mode != SearchMode::Lexical && config.capability.embed_enabled() {
        Some(HttpCapability::new(&config.capability)?)
    } else {
        None
    };
    search_with(
        root,
        query,
        mode,
        top_k,
        capability.as_ref().map(|c| c as &dyn Capability),
    )
    .await
}

/// Run a search with an explicit capability (or none).
pub async fn search_with(
    root: &Path,
    query: &str,
    mode: SearchMode,
    top_k: usize,
    capability: Option<&dyn Capability>,
) -> Result<SearchOutcome> {
    let query = query.trim();
    if query.is_empty() {
        return Err(KbError::InvalidInput("query must not be empty".to_string()));
    }
    if top_k == 0 {
        return Err(KbError::InvalidInput("top_k must be >= 1".to_string()));
    }

    let config = config::load_config(root)?;
    let paths = config::resolve_paths(root, &config);
    let pool = db::connect(&paths.db_path, false).await?;
    let result = run_query(&pool, &config, query, mode, top_k, capability).await;
    pool.close().await;
    result
}

async fn run_query(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    mode: SearchMode,
    top_k: usize,
    capability: Option<&dyn Capability>,
) -> Result<SearchOutcome> {
    schema::verify_schema(pool).await?;

    let candidate_k = config.retrieval.candidate_k.max(top_k as i64 * 5);
    let mut notes: Vec<String> = Vec::new();

    let lexical: Vec<(String, f64)> = if mode != SearchMode::Semantic {
        store::search_fts(pool, query, candidate_k)
            .await?
            .into_iter()
            .map(|hit| (hit.chunk_id, fts_sim(hit.bm25)))
            .collect()
    } else {
        Vec::new()
    };

    let semantic: Vec<(String, f64)> = if mode != SearchMode::Lexical {
        semantic_scores(pool, query, candidate_k, capability, &mut notes).await?
    } else {
        Vec::new()
    };

    debug!(
        lexical = lexical.len(),
        semantic = semantic.len(),
        "recall complete"
    );

    let scored: Vec<(String, f64, ScoreSource)> = match mode {
        SearchMode::Lexical => lexical
            .into_iter()
            .map(|(id, s)| (id, s, ScoreSource::Lexical))
            .collect(),
        SearchMode::Semantic => semantic
            .into_iter()
            .map(|(id, s)| (id, s, ScoreSource::Semantic))
            .collect(),
        SearchMode::Hybrid => fuse(&lexical, &semantic, config.retrieval.hybrid_alpha),
    };

    let ids: Vec<String> = scored.iter().map(|(id, _, _)| id.clone()).collect();
    let rows = store::fetch_chunks(pool, &ids).await?;
    let row_map: HashMap<String, store::ChunkRow> = rows
        .into_iter()
        .map(|row| (row.chunk_id.clone(), row))
        .collect();

    let dir_scores = if config.retrieval.structural_boost > 0.0 {
        structural_scores(pool, query).await?
    } else {
        HashMap::new()
    };

    let mut results: Vec<RetrievedChunk> = scored
        .into_iter()
        .filter_map(|(chunk_id, score, source)| {
            let row = row_map.get(&chunk_id)?;
            let boost =
                config.retrieval.structural_boost * ancestor_dir_score(&dir_scores, &row.rel_path);
            Some(RetrievedChunk {
                chunk_id,
                path: row.rel_path.clone(),
                title: row.title.clone(),
                heading_path: row.heading_path.clone(),
                line_range: [row.start_line, row.end_line],
                score: score + boost,
                source,
                text: row.text.clone(),
            })
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.line_range[0].cmp(&b.line_range[0]))
    });
    results.truncate(top_k);

    Ok(SearchOutcome { results, notes })
}

/// Map an FTS5 bm25 rank to a similarity in `[0, 1)`. FTS5 reports
/// matches as negated BM25 scores (more negative = better), so the
/// magnitude is the relevance and the mapping preserves its order.
fn fts_sim(bm25: f64) -> f64 {
    let relevance = (-bm25).max(0.0);
    relevance / (1.0 + relevance)
}

/// Embed the query and scan every stored vector for the capability's
/// model. Degrades to an empty list plus a diagnostic note instead of
/// failing: missing capability, missing embeddings, and capability
/// errors all leave lexical behavior intact.
async fn semantic_scores(
    pool: &SqlitePool,
    query: &str,
    candidate_k: i64,
    capability: Option<&dyn Capability>,
    notes: &mut Vec<String>,
) -> Result<Vec<(String, f64)>> {
    let Some(capability) = capability else {
        notes.push("semantic recall skipped: embedding capability not configured".to_string());
        return Ok(Vec::new());
    };
    let model = capability.model_embed();

    let foreign = store::count_foreign_embeddings(pool, model).await?;
    if foreign > 0 {
        notes.push(format!(
            "{foreign} stored embeddings ignored: produced by a model other than '{model}'"
        ));
    }

    let rows = store::embeddings_for_model(pool, model).await?;
    if rows.is_empty() {
        notes.push(format!(
            "no embeddings stored for model '{model}' (run: kb index --embed)"
        ));
        return Ok(Vec::new());
    }

    let query_vec = match capability.embed(&[query.to_string()]).await {
        Ok(mut vectors) if !vectors.is_empty() => vectors.remove(0),
        Ok(_) => {
            notes.push("semantic recall degraded: empty embedding response".to_string());
            return Ok(Vec::new());
        }
        Err(e) => {
            notes.push(format!("semantic recall degraded: {e}"));
            return Ok(Vec::new());
        }
    };
    let query_norm = query_vec
        .iter()
        .map(|x| (*x as f64) * (*x as f64))
        .sum::<f64>()
        .sqrt();
    if query_norm <= 0.0 {
        return Ok(Vec::new());
    }

    let mut hits: Vec<(String, f64)> = Vec::new();
    for row in rows {
        if row.norm <= 0.0 {
            continue;
        }
        let vector = blob_to_vec(&row.vector);
        if vector.len() != query_vec.len() {
            continue;
        }
        let dot: f64 = query_vec
            .iter()
            .zip(vector.iter())
            .map(|(a, b)| (*a as f64) * (*b as f64))
            .sum();
        let score = (dot / (query_norm * row.norm)).max(0.0);
        hits.push((row.chunk_id, score));
    }

    hits.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    hits.truncate(candidate_k as usize);
    Ok(hits)
}

/// Min-max normalize to `[0, 1]`; a single candidate (or all-equal
/// scores) normalizes to 1.0.
fn normalize_scores(candidates: &[(String, f64)]) -> HashMap<&str, f64> {
    if candidates.is_empty() {
        return HashMap::new();
    }
    let min = candidates.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
    let max = candidates
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|(id, score)| {
            let norm = if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                (score - min) / (max - min)
            };
            (id.as_str(), norm)
        })
        .collect()
}

/// Linear fusion of the two normalized score sets. A chunk present in
/// only one modality participates with the other side at zero; its
/// source tag records which side actually found it.
fn fuse(
    lexical: &[(String, f64)],
    semantic: &[(String, f64)],
    alpha: f64,
) -> Vec<(String, f64, ScoreSource)> {
    let lex_norm = normalize_scores(lexical);
    let sem_norm = normalize_scores(semantic);

    let mut seen: HashSet<&str> = HashSet::new();
    let mut out = Vec::with_capacity(lexical.len() + semantic.len());
    for (id, _) in lexical.iter().chain(semantic.iter()) {
        if !seen.insert(id.as_str()) {
            continue;
        }
        let l = lex_norm.get(id.as_str()).copied();
        let s = sem_norm.get(id.as_str()).copied();
        let fused = (1.0 - alpha) * l.unwrap_or(0.0) + alpha * s.unwrap_or(0.0);
        let source = match (l.is_some(), s.is_some()) {
            (true, true) => ScoreSource::Hybrid,
            (true, false) => ScoreSource::Lexical,
            _ => ScoreSource::Semantic,
        };
        out.push((id.clone(), fused, source));
    }
    out
}

// ============ Structural recall ============

/// Score each cached directory record by query-term overlap with its
/// title/summary/tags/keywords.
async fn structural_scores(pool: &SqlitePool, query: &str) -> Result<HashMap<String, f64>> {
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() {
        return Ok(HashMap::new());
    }

    let mut out = HashMap::new();
    for (dir_rel_path, meta_json) in store::dir_meta_rows(pool).await? {
        let Ok(meta) = serde_json::from_str::<DirMeta>(&meta_json) else {
            continue;
        };
        let mut dir_tokens = tokenize(&meta.title);
        dir_tokens.extend(tokenize(&meta.summary));
        for tag in meta.tags.iter().chain(meta.keywords.iter()) {
            dir_tokens.extend(tokenize(tag));
        }
        let overlap = query_tokens.intersection(&dir_tokens).count();
        if overlap > 0 {
            out.insert(dir_rel_path, overlap as f64 / query_tokens.len() as f64);
        }
    }
    Ok(out)
}

/// Best structural score among the directories containing the document.
fn ancestor_dir_score(dir_scores: &HashMap<String, f64>, rel_path: &str) -> f64 {
    if dir_scores.is_empty() {
        return 0.0;
    }
    let mut best = dir_scores.get(".").copied().unwrap_or(0.0);
    let mut dir = rel_path;
    while let Some(pos) = dir.rfind('/') {
        dir = &dir[..pos];
        if let Some(score) = dir_scores.get(dir) {
            best = best.max(*score);
        }
    }
    best
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(pairs: &[(&str, f64)]) -> Vec<(String, f64)> {
        pairs.iter().map(|(id, s)| (id.to_string(), *s)).collect()
    }

    #[test]
    fn test_fts_sim_preserves_bm25_order() {
        // FTS5 ranks matches with negated BM25 scores.
        assert!(fts_sim(-3.0) > fts_sim(-1.0));
        assert!(fts_sim(-1.0) > 0.0 && fts_sim(-1.0) < 1.0);
        assert_eq!(fts_sim(0.0), 0.0);
        // Positive ranks never happen for matches; clamp to zero.
        assert_eq!(fts_sim(5.0), 0.0);
    }

    #[test]
    fn test_normalize_empty_and_single() {
        assert!(normalize_scores(&[]).is_empty());
        let s = scores(&[("c1", 5.0)]);
        let n = normalize_scores(&s);
        assert!((n["c1"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_range() {
        let s = scores(&[("c1", 10.0), ("c2", 5.0), ("c3", 0.0)]);
        let n = normalize_scores(&s);
        assert!((n["c1"] - 1.0).abs() < 1e-9);
        assert!((n["c2"] - 0.5).abs() < 1e-9);
        assert!((n["c3"] - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal() {
        let s = scores(&[("c1", 3.0), ("c2", 3.0)]);
        let n = normalize_scores(&s);
        assert!((n["c1"] - 1.0).abs() < 1e-9);
        assert!((n["c2"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_fuse_alpha_zero_keeps_lexical_order() {
        let lexical = scores(&[("c1", 10.0), ("c2", 5.0), ("c3", 1.0)]);
        let semantic = scores(&[("c3", 0.9), ("c1", 0.1)]);
        let mut fused = fuse(&lexical, &semantic, 0.0);
        fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        let order: Vec<&str> = fused.iter().map(|(id, _, _)| id.as_str()).collect();
        assert_eq!(order, vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_fuse_alpha_one_keeps_semantic_order() {
        let lexical = scores(&[("c1", 10.0), ("c2", 5.0)]);
        let semantic = scores(&[("c2", 0.9), ("c3", 0.5), ("c1", 0.1)]);
        let mut fused = fuse(&lexical, &semantic, 1.0);
        fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        let order: Vec<&str> = fused.iter().map(|(id, _, _)| id.as_str()).collect();
        assert_eq!(order, vec!["c2", "c3", "c1"]);
    }

    #[test]
    fn test_fuse_single_modality_chunk_scores_nonzero() {
        let lexical = scores(&[("only-lex", 4.0), ("both", 2.0)]);
        let semantic = scores(&[("both", 0.8), ("only-sem", 0.6)]);
        let fused = fuse(&lexical, &semantic, 0.6);

        let by_id: HashMap<&str, (f64, ScoreSource)> = fused
            .iter()
            .map(|(id, score, source)| (id.as_str(), (*score, *source)))
            .collect();

        let (score, source) = by_id["only-lex"];
        assert!(score > 0.0);
        assert_eq!(source, ScoreSource::Lexical);

        let (score, source) = by_id["only-sem"];
        assert!(score > 0.0);
        assert_eq!(source, ScoreSource::Semantic);

        assert_eq!(by_id["both"].1, ScoreSource::Hybrid);
    }

    #[test]
    fn test_fuse_weights_combine() {
        let lexical = scores(&[("c1", 1.0), ("c2", 0.0)]);
        let semantic = scores(&[("c1", 1.0), ("c2", 0.0)]);
        let fused = fuse(&lexical, &semantic, 0.6);
        let by_id: HashMap<&str, f64> =
            fused.iter().map(|(id, s, _)| (id.as_str(), *s)).collect();
        assert!((by_id["c1"] - 1.0).abs() < 1e-9);
        assert!((by_id["c2"] - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_tokenize_lowercases_and_filters() {
        let tokens = tokenize("Deploy the API, fast! x");
        assert!(tokens.contains("deploy"));
        assert!(tokens.contains("api"));
        assert!(tokens.contains("fast"));
        // single-char fragments are dropped
        assert!(!tokens.contains("x"));
        assert!(!tokens.iter().any(|t| t.contains(',')));
    }

    #[test]
    fn test_ancestor_dir_score_walks_up() {
        let mut dir_scores = HashMap::new();
        dir_scores.insert("projects".to_string(), 0.5);
        dir_scores.insert("projects/rust".to_string(), 0.8);
        dir_scores.insert(".".to_string(), 0.1);

        assert!((ancestor_dir_score(&dir_scores, "projects/rust/notes.md") - 0.8).abs() < 1e-9);
        assert!((ancestor_dir_score(&dir_scores, "projects/go/notes.md") - 0.5).abs() < 1e-9);
        assert!((ancestor_dir_score(&dir_scores, "top.md") - 0.1).abs() < 1e-9);
        assert_eq!(ancestor_dir_score(&HashMap::new(), "top.md"), 0.0);
    }
}
