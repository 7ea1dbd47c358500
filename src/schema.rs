use sqlx::SqlitePool;

use crate::error::{KbError, Result};

/// Tables the rest of the engine assumes exist.
const REQUIRED_TABLES: &[&str] = &[
    "docs",
    "chunks",
    "chunk_fts",
    "embeddings",
    "dir_meta",
    "audit_log",
];

/// Create all tables and indexes. Idempotent.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS docs (
            doc_id TEXT PRIMARY KEY,
            rel_path TEXT UNIQUE NOT NULL,
            title TEXT,
            summary TEXT,
            tags_json TEXT,
            keywords_json TEXT,
            mtime_ns INTEGER,
            size INTEGER,
            content_hash TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            chunk_id TEXT PRIMARY KEY,
            doc_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            heading_path TEXT,
            start_line INTEGER,
            end_line INTEGER,
            text TEXT NOT NULL,
            text_hash TEXT NOT NULL,
            FOREIGN KEY (doc_id) REFERENCES docs(doc_id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks(doc_id)")
        .execute(pool)
        .await?;

    // FTS5 CREATE is not idempotent natively, so check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunk_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunk_fts USING fts5(
                chunk_id UNINDEXED,
                text,
                title,
                rel_path,
                heading_path,
                tokenize='unicode61'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            chunk_id TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            vector BLOB NOT NULL,
            norm REAL NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dir_meta (
            dir_rel_path TEXT PRIMARY KEY,
            meta_json TEXT NOT NULL,
            meta_hash TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL,
            action TEXT NOT NULL,
            details_json TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Probe for the expected tables; a miss means the store was created by
/// something else or damaged, and the caller should suggest `kb repair`.
pub async fn verify_schema(pool: &SqlitePool) -> Result<()> {
    for table in REQUIRED_TABLES {
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM sqlite_master WHERE name = ?")
                .bind(table)
                .fetch_one(pool)
                .await?;
        if !exists {
            return Err(KbError::StoreCorruption(format!(
                "missing table '{table}'"
            )));
        }
    }
    Ok(())
}
