//! Row-level operations on the index store.
//!
//! All multi-table updates for one document happen inside a single
//! transaction: a reader concurrently searching the store observes
//! either the old or the new chunk set, never a mix. Chunk rows are
//! never mutated in place — the whole set is replaced.

use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::error::{KbError, Result};
use crate::models::{Chunk, DocRecord};
use crate::util::{now_iso, sha256_text};

/// Stored fingerprint data used by the incremental diff.
#[derive(Debug, Clone)]
pub struct DocStamp {
    pub doc_id: String,
    pub content_hash: String,
    pub mtime_ns: i64,
    pub size: i64,
}

/// One lexical hit: raw bm25 rank (lower is better).
#[derive(Debug, Clone)]
pub struct FtsHit {
    pub chunk_id: String,
    pub bm25: f64,
}

/// A chunk row joined with its document, as needed for citations.
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub chunk_id: String,
    pub rel_path: String,
    pub title: String,
    pub heading_path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub text: String,
}

/// A stored embedding vector with its precomputed L2 norm.
#[derive(Debug, Clone)]
pub struct EmbeddingRow {
    pub chunk_id: String,
    pub vector: Vec<u8>,
    pub norm: f64,
}

pub fn doc_id_for(rel_path: &str) -> String {
    sha256_text(rel_path)
}

pub fn chunk_id_for(rel_path: &str, chunk_index: i64) -> String {
    sha256_text(&format!("{rel_path}#{chunk_index}"))
}

/// Load `(rel_path -> fingerprint data)` for every indexed document.
pub async fn load_doc_index(pool: &SqlitePool) -> Result<HashMap<String, DocStamp>> {
    let rows = sqlx::query("SELECT doc_id, rel_path, content_hash, mtime_ns, size FROM docs")
        .fetch_all(pool)
        .await?;

    let mut out = HashMap::with_capacity(rows.len());
    for row in rows {
        out.insert(
            row.get::<String, _>("rel_path"),
            DocStamp {
                doc_id: row.get("doc_id"),
                content_hash: row.get("content_hash"),
                mtime_ns: row.get::<Option<i64>, _>("mtime_ns").unwrap_or(0),
                size: row.get::<Option<i64>, _>("size").unwrap_or(0),
            },
        );
    }
    Ok(out)
}

/// Atomically replace a document's row set: upsert the doc row, drop
/// the old chunk/lexical/embedding rows, insert the new chunk set.
pub async fn replace_document(
    pool: &SqlitePool,
    doc: &DocRecord,
    chunks: &[Chunk],
) -> Result<()> {
    let mut tx = pool.begin().await.map_err(KbError::TransactionFailure)?;

    sqlx::query(
        r#"
        INSERT INTO docs (doc_id, rel_path, title, summary, tags_json, keywords_json,
                          mtime_ns, size, content_hash, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(doc_id) DO UPDATE SET
            rel_path = excluded.rel_path,
            title = excluded.title,
            summary = excluded.summary,
            tags_json = excluded.tags_json,
            keywords_json = excluded.keywords_json,
            mtime_ns = excluded.mtime_ns,
            size = excluded.size,
            content_hash = excluded.content_hash,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&doc.doc_id)
    .bind(&doc.rel_path)
    .bind(&doc.title)
    .bind(&doc.summary)
    .bind(serde_json::to_string(&doc.tags).unwrap_or_else(|_| "[]".to_string()))
    .bind(serde_json::to_string(&doc.keywords).unwrap_or_else(|_| "[]".to_string()))
    .bind(doc.mtime_ns)
    .bind(doc.size)
    .bind(&doc.content_hash)
    .bind(now_iso())
    .execute(&mut *tx)
    .await
    .map_err(KbError::TransactionFailure)?;

    sqlx::query(
        "DELETE FROM embeddings WHERE chunk_id IN (SELECT chunk_id FROM chunks WHERE doc_id = ?)",
    )
    .bind(&doc.doc_id)
    .execute(&mut *tx)
    .await
    .map_err(KbError::TransactionFailure)?;

    sqlx::query("DELETE FROM chunk_fts WHERE rel_path = ?")
        .bind(&doc.rel_path)
        .execute(&mut *tx)
        .await
        .map_err(KbError::TransactionFailure)?;

    sqlx::query("DELETE FROM chunks WHERE doc_id = ?")
        .bind(&doc.doc_id)
        .execute(&mut *tx)
        .await
        .map_err(KbError::TransactionFailure)?;

    for chunk in chunks {
        let chunk_id = chunk_id_for(&doc.rel_path, chunk.chunk_index);
        sqlx::query(
            r#"
            INSERT INTO chunks (chunk_id, doc_id, chunk_index, heading_path,
                                start_line, end_line, text, text_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk_id)
        .bind(&doc.doc_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.heading_path)
        .bind(chunk.start_line)
        .bind(chunk.end_line)
        .bind(&chunk.text)
        .bind(&chunk.text_hash)
        .execute(&mut *tx)
        .await
        .map_err(KbError::TransactionFailure)?;

        sqlx::query(
            "INSERT INTO chunk_fts (chunk_id, text, title, rel_path, heading_path) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&chunk_id)
        .bind(fts_text(&chunk.text))
        .bind(fts_text(&doc.title))
        .bind(&doc.rel_path)
        .bind(fts_text(&chunk.heading_path))
        .execute(&mut *tx)
        .await
        .map_err(KbError::TransactionFailure)?;
    }

    tx.commit().await.map_err(KbError::TransactionFailure)
}

/// Cascade-delete a document and every dependent chunk, lexical, and
/// embedding row. Returns false when the path was not indexed.
pub async fn delete_document(pool: &SqlitePool, rel_path: &str) -> Result<bool> {
    let doc_id: Option<String> = sqlx::query_scalar("SELECT doc_id FROM docs WHERE rel_path = ?")
        .bind(rel_path)
        .fetch_optional(pool)
        .await?;
    let Some(doc_id) = doc_id else {
        return Ok(false);
    };

    let mut tx = pool.begin().await.map_err(KbError::TransactionFailure)?;

    sqlx::query(
        "DELETE FROM embeddings WHERE chunk_id IN (SELECT chunk_id FROM chunks WHERE doc_id = ?)",
    )
    .bind(&doc_id)
    .execute(&mut *tx)
    .await
    .map_err(KbError::TransactionFailure)?;

    sqlx::query("DELETE FROM chunk_fts WHERE rel_path = ?")
        .bind(rel_path)
        .execute(&mut *tx)
        .await
        .map_err(KbError::TransactionFailure)?;

    sqlx::query("DELETE FROM chunks WHERE doc_id = ?")
        .bind(&doc_id)
        .execute(&mut *tx)
        .await
        .map_err(KbError::TransactionFailure)?;

    sqlx::query("DELETE FROM docs WHERE doc_id = ?")
        .bind(&doc_id)
        .execute(&mut *tx)
        .await
        .map_err(KbError::TransactionFailure)?;

    tx.commit().await.map_err(KbError::TransactionFailure)?;
    Ok(true)
}

/// Write one vector per chunk for the given model, replacing any
/// previous vector for that chunk.
pub async fn upsert_embeddings(
    pool: &SqlitePool,
    model: &str,
    rows: &[(String, Vec<f32>)],
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await.map_err(KbError::TransactionFailure)?;
    for (chunk_id, vector) in rows {
        let norm = l2_norm(vector);
        sqlx::query(
            r#"
            INSERT INTO embeddings (chunk_id, model, dims, vector, norm, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                model = excluded.model,
                dims = excluded.dims,
                vector = excluded.vector,
                norm = excluded.norm,
                created_at = excluded.created_at
            "#,
        )
        .bind(chunk_id)
        .bind(model)
        .bind(vector.len() as i64)
        .bind(crate::capability::vec_to_blob(vector))
        .bind(norm)
        .bind(now_iso())
        .execute(&mut *tx)
        .await
        .map_err(KbError::TransactionFailure)?;
    }
    tx.commit().await.map_err(KbError::TransactionFailure)
}

/// Cache a directory's metadata. Skips the write when the stored hash
/// already matches, so a no-op indexing pass stays write-free.
pub async fn upsert_dir_meta(pool: &SqlitePool, dir_rel_path: &str, meta_json: &str) -> Result<()> {
    let meta_hash = sha256_text(meta_json);
    let stored: Option<String> =
        sqlx::query_scalar("SELECT meta_hash FROM dir_meta WHERE dir_rel_path = ?")
            .bind(dir_rel_path)
            .fetch_optional(pool)
            .await?;
    if stored.as_deref() == Some(meta_hash.as_str()) {
        return Ok(());
    }
    sqlx::query(
        r#"
        INSERT INTO dir_meta (dir_rel_path, meta_json, meta_hash, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(dir_rel_path) DO UPDATE SET
            meta_json = excluded.meta_json,
            meta_hash = excluded.meta_hash,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(dir_rel_path)
    .bind(meta_json)
    .bind(meta_hash)
    .bind(now_iso())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn dir_meta_rows(pool: &SqlitePool) -> Result<Vec<(String, String)>> {
    let rows = sqlx::query("SELECT dir_rel_path, meta_json FROM dir_meta")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| (row.get("dir_rel_path"), row.get("meta_json")))
        .collect())
}

/// Append one audit row. The log is write-only: nothing in the engine
/// ever updates or deletes entries.
pub async fn log_action(
    pool: &SqlitePool,
    action: &str,
    details: &serde_json::Value,
) -> Result<()> {
    sqlx::query("INSERT INTO audit_log (ts, action, details_json) VALUES (?, ?, ?)")
        .bind(now_iso())
        .bind(action)
        .bind(details.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn audit_log_count(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM audit_log")
        .fetch_one(pool)
        .await?)
}

/// Ranked keyword recall over the lexical projection.
pub async fn search_fts(pool: &SqlitePool, query: &str, limit: i64) -> Result<Vec<FtsHit>> {
    let rows = sqlx::query(
        r#"
        SELECT chunk_id, bm25(chunk_fts) AS score
        FROM chunk_fts
        WHERE chunk_fts MATCH ?
        ORDER BY score
        LIMIT ?
        "#,
    )
    .bind(fts_query(query))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| FtsHit {
            chunk_id: row.get("chunk_id"),
            bm25: row.get("score"),
        })
        .collect())
}

/// Fetch chunk rows (joined with their documents) for the given ids.
/// The result preserves the order of `chunk_ids`.
pub async fn fetch_chunks(pool: &SqlitePool, chunk_ids: &[String]) -> Result<Vec<ChunkRow>> {
    if chunk_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; chunk_ids.len()].join(",");
    let sql = format!(
        "SELECT c.chunk_id, c.heading_path, c.start_line, c.end_line, c.text, \
                d.rel_path, d.title \
         FROM chunks c JOIN docs d ON d.doc_id = c.doc_id \
         WHERE c.chunk_id IN ({placeholders})"
    );
    let mut query = sqlx::query(&sql);
    for chunk_id in chunk_ids {
        query = query.bind(chunk_id);
    }
    let rows = query.fetch_all(pool).await?;

    let mut by_id: HashMap<String, ChunkRow> = HashMap::with_capacity(rows.len());
    for row in rows {
        let chunk = ChunkRow {
            chunk_id: row.get("chunk_id"),
            rel_path: row.get("rel_path"),
            title: row.get::<Option<String>, _>("title").unwrap_or_default(),
            heading_path: row
                .get::<Option<String>, _>("heading_path")
                .unwrap_or_default(),
            start_line: row.get::<Option<i64>, _>("start_line").unwrap_or(0),
            end_line: row.get::<Option<i64>, _>("end_line").unwrap_or(0),
            text: row.get("text"),
        };
        by_id.insert(chunk.chunk_id.clone(), chunk);
    }
    Ok(chunk_ids
        .iter()
        .filter_map(|id| by_id.remove(id))
        .collect())
}

/// All stored vectors for the given model — the exhaustive scan the
/// semantic ranker iterates.
pub async fn embeddings_for_model(pool: &SqlitePool, model: &str) -> Result<Vec<EmbeddingRow>> {
    let rows = sqlx::query("SELECT chunk_id, vector, norm FROM embeddings WHERE model = ?")
        .bind(model)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| EmbeddingRow {
            chunk_id: row.get("chunk_id"),
            vector: row.get("vector"),
            norm: row.get("norm"),
        })
        .collect())
}

/// Vectors produced by a model other than the configured one: comparing
/// against them would be silently wrong, so they are counted and
/// surfaced instead.
pub async fn count_foreign_embeddings(pool: &SqlitePool, model: &str) -> Result<i64> {
    Ok(
        sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE model != ?")
            .bind(model)
            .fetch_one(pool)
            .await?,
    )
}

pub async fn count_orphan_embeddings(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar(
        "SELECT COUNT(*) FROM embeddings e \
         LEFT JOIN chunks c ON c.chunk_id = e.chunk_id \
         WHERE c.chunk_id IS NULL",
    )
    .fetch_one(pool)
    .await?)
}

pub async fn count_chunks(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await?)
}

pub async fn count_fts_rows(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM chunk_fts")
        .fetch_one(pool)
        .await?)
}

fn l2_norm(vector: &[f32]) -> f64 {
    vector.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt()
}

// ============ FTS text handling ============

/// unicode61 does not segment CJK text, so CJK codepoints are
/// space-augmented at both write and query time to make them matchable.
pub fn fts_text(text: &str) -> String {
    cjk_space(text)
}

/// Single-token CJK queries become quoted phrases over the augmented
/// form; everything else passes through to the FTS5 query parser.
pub fn fts_query(query: &str) -> String {
    let q = query.trim();
    if q.is_empty() {
        return q.to_string();
    }
    if q.contains(char::is_whitespace) {
        return q.to_string();
    }
    if q.chars().any(is_cjk) {
        let phrase = cjk_space(q).trim().replace('"', "");
        return format!("\"{phrase}\"");
    }
    q.to_string()
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF)
}

fn cjk_space(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        out.push(c);
        if is_cjk(c) {
            out.push(' ');
        }
    }
    out
}
