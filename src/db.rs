use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::error::{KbError, Result};

/// Open the index database, optionally creating it.
///
/// WAL journaling and foreign keys are always enabled. Failure to open
/// or create the store is fatal for the whole operation.
pub async fn connect(db_path: &Path, create: bool) -> Result<SqlitePool> {
    if !create && !db_path.exists() {
        return Err(KbError::Fatal(format!(
            "index database not found at {} (run: kb index)",
            db_path.display()
        )));
    }

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
        .map_err(|e| KbError::Fatal(format!("invalid database path: {e}")))?
        .create_if_missing(create)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| KbError::Fatal(format!("cannot open index database: {e}")))?;

    Ok(pool)
}
