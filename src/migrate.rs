use sqlx::SqlitePool;

use crate::error::Result;

/// Create the schema. Safe to run on every open.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS indexed_files (
            file_id TEXT PRIMARY KEY,
            path TEXT NOT NULL UNIQUE,
            content_hash TEXT NOT NULL,
            size INTEGER NOT NULL,
            modified_time INTEGER NOT NULL,
            file_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            last_indexed_at INTEGER,
            failure_reason TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            model_id TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            chunk_id TEXT PRIMARY KEY,
            file_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            chunk_type TEXT NOT NULL,
            UNIQUE(file_id, chunk_index),
            FOREIGN KEY (file_id) REFERENCES indexed_files(file_id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // file_id is denormalized so vector scans can be scoped without a join
    // through chunks.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            embedding_id TEXT PRIMARY KEY,
            chunk_id TEXT NOT NULL UNIQUE,
            file_id TEXT NOT NULL,
            model_id TEXT NOT NULL,
            dims INTEGER NOT NULL,
            vector BLOB NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(chunk_id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                file_id UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    for ddl in [
        "CREATE INDEX IF NOT EXISTS idx_chunks_file_id ON chunks(file_id)",
        "CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model_id)",
        "CREATE INDEX IF NOT EXISTS idx_embeddings_file_id ON embeddings(file_id)",
        "CREATE INDEX IF NOT EXISTS idx_files_status ON indexed_files(status)",
        "CREATE INDEX IF NOT EXISTS idx_files_type ON indexed_files(file_type)",
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }

    Ok(())
}
