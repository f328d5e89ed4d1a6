//! Transactional persistence for files, chunks and embeddings.
//!
//! [`IndexStore`] owns the SQLite pool. All mutation goes through it, and
//! each mutation is one transaction:
//!
//! - [`IndexStore::replace_chunks_and_embeddings`] swaps a file's whole
//!   chunk, embedding and keyword set at once. Readers see the old set or
//!   the new set, never a mix.
//! - [`IndexStore::remove_file`] drops a file and everything it owns.
//!
//! Write transactions start with `BEGIN IMMEDIATE`, so concurrent writers
//! queue on the busy timeout instead of failing on lock upgrade.
//!
//! Reads for one query go through a [`StoreReader`], a read transaction
//! that pins one WAL snapshot for keyword search, vector scan and row
//! lookup alike.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::db;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{IndexError, Result};
use crate::migrate;
use crate::models::{
    Chunk, ChunkType, Embedding, FileRecord, FileStatus, IndexedFile, SearchFilters,
};
use crate::stats::IndexStats;

const POLICY_KEY: &str = "directory_policy";

/// Result of [`IndexStore::add_file`].
#[derive(Debug, Clone)]
pub struct AddFileOutcome {
    pub file: IndexedFile,
    /// False when the stored record was returned untouched.
    pub changed: bool,
}

/// Policy roots as persisted in the settings table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPolicy {
    pub allowed: Vec<PathBuf>,
    pub excluded: Vec<PathBuf>,
}

/// A chunk row joined with its owning file, as needed to build results.
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub chunk_id: String,
    pub file_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub path: PathBuf,
    pub file_type: String,
    pub modified_time: i64,
}

#[derive(Debug, Clone)]
pub struct IndexStore {
    pool: SqlitePool,
    generation: Arc<AtomicU64>,
}

impl IndexStore {
    /// Open the database at `path`, creating the schema if needed.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Bumped after every commit that changes searchable content through
    /// this store (or any clone of it).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Begin a read snapshot.
    pub async fn reader(&self) -> Result<StoreReader> {
        Ok(StoreReader {
            tx: self.pool.begin().await?,
        })
    }

    // ============ Files ============

    /// Insert or update the record for `record.path`.
    ///
    /// When a record exists with the same content hash and `force` is
    /// false, it is returned unchanged. Otherwise the stored hash and stat
    /// data are updated and the file goes back to `Pending`; its committed
    /// chunks stay visible until the next successful replace.
    pub async fn add_file(&self, record: &FileRecord, force: bool) -> Result<AddFileOutcome> {
        if let Some(existing) = self.get_file_by_path(&record.path).await? {
            if existing.content_hash == record.content_hash && !force {
                return Ok(AddFileOutcome {
                    file: existing,
                    changed: false,
                });
            }
            sqlx::query(
                r#"
                UPDATE indexed_files
                SET content_hash = ?, size = ?, modified_time = ?, file_type = ?,
                    status = 'pending', failure_reason = NULL
                WHERE file_id = ?
                "#,
            )
            .bind(&record.content_hash)
            .bind(record.size as i64)
            .bind(record.modified_time)
            .bind(&record.file_type)
            .bind(&existing.file_id)
            .execute(&self.pool)
            .await?;
            self.bump_generation();

            let file = self.require_file(&existing.file_id).await?;
            return Ok(AddFileOutcome {
                file,
                changed: true,
            });
        }

        let file_id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO indexed_files (file_id, path, content_hash, size, modified_time, file_type, status)
            VALUES (?, ?, ?, ?, ?, ?, 'pending')
            ON CONFLICT(path) DO NOTHING
            "#,
        )
        .bind(&file_id)
        .bind(path_key(&record.path))
        .bind(&record.content_hash)
        .bind(record.size as i64)
        .bind(record.modified_time)
        .bind(&record.file_type)
        .execute(&self.pool)
        .await?;

        // A concurrent insert for the same path may have won the race.
        let file = self
            .get_file_by_path(&record.path)
            .await?
            .ok_or_else(|| IndexError::Storage(format!("file vanished: {}", record.path.display())))?;
        Ok(AddFileOutcome {
            changed: true,
            file,
        })
    }

    pub async fn get_file(&self, file_id: &str) -> Result<Option<IndexedFile>> {
        let row = sqlx::query("SELECT * FROM indexed_files WHERE file_id = ?")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    pub async fn get_file_by_path(&self, path: &Path) -> Result<Option<IndexedFile>> {
        let row = sqlx::query("SELECT * FROM indexed_files WHERE path = ?")
            .bind(path_key(path))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    /// All files, ordered by path.
    pub async fn list_files(&self) -> Result<Vec<IndexedFile>> {
        let rows = sqlx::query("SELECT * FROM indexed_files ORDER BY path")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(file_from_row).collect()
    }

    /// Files whose path lies under `dir` (by path prefix).
    pub async fn files_under(&self, dir: &Path) -> Result<Vec<IndexedFile>> {
        let mut prefix = path_key(dir);
        if !prefix.ends_with(std::path::MAIN_SEPARATOR) {
            prefix.push(std::path::MAIN_SEPARATOR);
        }
        let rows = sqlx::query(
            "SELECT * FROM indexed_files WHERE path LIKE ? ESCAPE '\\' ORDER BY path",
        )
        .bind(format!("{}%", escape_like(&prefix)))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }

    /// Delete a file with its chunks, embeddings and keyword rows.
    /// Returns false when no such file existed.
    pub async fn remove_file(&self, file_id: &str) -> Result<bool> {
        let mut tx = self.begin_write().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        // chunks and embeddings go by ON DELETE CASCADE
        let removed = sqlx::query("DELETE FROM indexed_files WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        if removed > 0 {
            self.bump_generation();
        }
        Ok(removed > 0)
    }

    pub async fn mark_pending(&self, file_id: &str) -> Result<()> {
        self.set_status(file_id, FileStatus::Pending, None).await
    }

    /// Record a failure. The previously committed chunk set is kept.
    pub async fn mark_failed(&self, file_id: &str, reason: &str) -> Result<()> {
        self.set_status(file_id, FileStatus::Failed, Some(reason))
            .await
    }

    async fn set_status(
        &self,
        file_id: &str,
        status: FileStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE indexed_files SET status = ?, failure_reason = ? WHERE file_id = ?")
            .bind(status.as_str())
            .bind(reason)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn require_file(&self, file_id: &str) -> Result<IndexedFile> {
        self.get_file(file_id)
            .await?
            .ok_or_else(|| IndexError::Storage(format!("unknown file_id {}", file_id)))
    }

    // ============ Chunks + embeddings ============

    /// Atomically replace every chunk, embedding and keyword row of a file
    /// and mark it `Succeeded`.
    ///
    /// `embeddings[i]` must belong to `chunks[i]`, every chunk must be owned
    /// by `file_id` with `chunk_index == i`, and every vector must come from
    /// `model_id` with one shared dimension. Violations are rejected before
    /// anything is written.
    pub async fn replace_chunks_and_embeddings(
        &self,
        file_id: &str,
        chunks: &[Chunk],
        embeddings: &[Embedding],
        model_id: &str,
        metadata_json: &str,
    ) -> Result<()> {
        check_chunk_set(file_id, chunks, embeddings, model_id)?;

        let mut tx = self.begin_write().await?;

        sqlx::query("DELETE FROM chunks_fts WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM embeddings WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;

        for (chunk, embedding) in chunks.iter().zip(embeddings) {
            sqlx::query(
                r#"
                INSERT INTO chunks (chunk_id, file_id, chunk_index, text, start_offset, end_offset, chunk_type)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.chunk_id)
            .bind(file_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(chunk.start_offset as i64)
            .bind(chunk.end_offset as i64)
            .bind(chunk.chunk_type.as_str())
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, file_id, text) VALUES (?, ?, ?)")
                .bind(&chunk.chunk_id)
                .bind(file_id)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                r#"
                INSERT INTO embeddings (embedding_id, chunk_id, file_id, model_id, dims, vector)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&embedding.embedding_id)
            .bind(&chunk.chunk_id)
            .bind(file_id)
            .bind(&embedding.model_id)
            .bind(embedding.vector.len() as i64)
            .bind(vec_to_blob(&embedding.vector))
            .execute(&mut *tx)
            .await?;
        }

        let updated = sqlx::query(
            r#"
            UPDATE indexed_files
            SET status = 'succeeded', failure_reason = NULL, last_indexed_at = ?,
                model_id = ?, metadata_json = ?
            WHERE file_id = ?
            "#,
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(model_id)
        .bind(metadata_json)
        .bind(file_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            // dropping the transaction rolls it back
            return Err(IndexError::Storage(format!("unknown file_id {}", file_id)));
        }

        tx.commit().await?;
        self.bump_generation();
        Ok(())
    }

    /// Committed chunks of a file in index order.
    pub async fn chunks_for_file(&self, file_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, file_id, chunk_index, text, start_offset, end_offset, chunk_type
            FROM chunks WHERE file_id = ? ORDER BY chunk_index
            "#,
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let chunk_type: String = row.try_get("chunk_type")?;
                Ok(Chunk {
                    chunk_id: row.try_get("chunk_id")?,
                    file_id: row.try_get("file_id")?,
                    chunk_index: row.try_get("chunk_index")?,
                    text: row.try_get("text")?,
                    start_offset: row.try_get::<i64, _>("start_offset")? as usize,
                    end_offset: row.try_get::<i64, _>("end_offset")? as usize,
                    chunk_type: chunk_type.parse::<ChunkType>().map_err(IndexError::Storage)?,
                })
            })
            .collect()
    }

    pub async fn chunk_count(&self, file_id: &str) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE file_id = ?")
            .bind(file_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    /// Committed embeddings of a file, in chunk order.
    pub async fn embeddings_for_file(&self, file_id: &str) -> Result<Vec<Embedding>> {
        let rows = sqlx::query(
            r#"
            SELECT e.embedding_id, e.chunk_id, e.model_id, e.vector
            FROM embeddings e JOIN chunks c ON c.chunk_id = e.chunk_id
            WHERE e.file_id = ? ORDER BY c.chunk_index
            "#,
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let blob: Vec<u8> = row.try_get("vector")?;
                Ok(Embedding {
                    embedding_id: row.try_get("embedding_id")?,
                    chunk_id: row.try_get("chunk_id")?,
                    vector: blob_to_vec(&blob),
                    model_id: row.try_get("model_id")?,
                })
            })
            .collect()
    }

    // ============ Settings ============

    pub async fn save_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn save_policy(&self, policy: &StoredPolicy) -> Result<()> {
        let json = serde_json::to_string(policy)
            .map_err(|e| IndexError::Storage(format!("cannot encode policy: {}", e)))?;
        self.save_setting(POLICY_KEY, &json).await
    }

    pub async fn load_policy(&self) -> Result<Option<StoredPolicy>> {
        match self.load_setting(POLICY_KEY).await? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| IndexError::Storage(format!("corrupt stored policy: {}", e))),
            None => Ok(None),
        }
    }

    // ============ Statistics ============

    /// SQLite `quick_check` failures plus keyword rows and chunks that lost
    /// their counterpart. Empty when the index is consistent.
    pub async fn integrity_issues(&self) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_all(&self.pool)
            .await?;
        let mut issues: Vec<String> = rows.into_iter().filter(|r| r != "ok").collect();

        let orphan_fts: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks_fts WHERE chunk_id NOT IN (SELECT chunk_id FROM chunks)",
        )
        .fetch_one(&self.pool)
        .await?;
        if orphan_fts > 0 {
            issues.push(format!("{} keyword rows without a chunk", orphan_fts));
        }

        let unembedded: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM chunks c
            LEFT JOIN embeddings e ON e.chunk_id = c.chunk_id
            WHERE e.chunk_id IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        if unembedded > 0 {
            issues.push(format!("{} chunks without an embedding", unembedded));
        }
        Ok(issues)
    }

    pub async fn statistics(&self) -> Result<IndexStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS file_count,
                COALESCE(SUM(status = 'failed'), 0) AS failed_count,
                COALESCE(SUM(status = 'pending'), 0) AS pending_count,
                MAX(last_indexed_at) AS last_indexed_at,
                COALESCE(SUM(size), 0) AS total_bytes
            FROM indexed_files
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let chunk_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let embedding_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
            .fetch_one(&self.pool)
            .await?;
        let embedding_model_id: Option<String> = sqlx::query_scalar(
            "SELECT model_id FROM embeddings GROUP BY model_id ORDER BY COUNT(*) DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let by_type = sqlx::query(
            "SELECT file_type, COUNT(*) AS n FROM indexed_files GROUP BY file_type ORDER BY n DESC, file_type",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| Ok((r.try_get::<String, _>("file_type")?, r.try_get::<i64, _>("n")?)))
        .collect::<Result<Vec<_>>>()?;

        Ok(IndexStats {
            file_count: row.try_get("file_count")?,
            failed_count: row.try_get("failed_count")?,
            pending_count: row.try_get("pending_count")?,
            chunk_count,
            embedding_count,
            embedding_model_id,
            last_indexed_at: row.try_get("last_indexed_at")?,
            total_bytes: row.try_get("total_bytes")?,
            files_by_type: by_type,
        })
    }
}

fn check_chunk_set(
    file_id: &str,
    chunks: &[Chunk],
    embeddings: &[Embedding],
    model_id: &str,
) -> Result<()> {
    let reject = |msg: String| Err(IndexError::Storage(format!("rejected chunk set: {}", msg)));

    if chunks.len() != embeddings.len() {
        return reject(format!(
            "{} chunks but {} embeddings",
            chunks.len(),
            embeddings.len()
        ));
    }
    let dims = embeddings.first().map(|e| e.vector.len());
    for (i, (chunk, embedding)) in chunks.iter().zip(embeddings).enumerate() {
        if chunk.file_id != file_id {
            return reject(format!("chunk {} belongs to {}", chunk.chunk_id, chunk.file_id));
        }
        if chunk.chunk_index != i as i64 {
            return reject(format!("chunk_index {} at position {}", chunk.chunk_index, i));
        }
        if embedding.chunk_id != chunk.chunk_id {
            return reject(format!("embedding {} does not match chunk {}", embedding.embedding_id, chunk.chunk_id));
        }
        if embedding.model_id != model_id {
            return reject(format!("embedding from model {}, expected {}", embedding.model_id, model_id));
        }
        if Some(embedding.vector.len()) != dims || embedding.vector.is_empty() {
            return reject(format!("vector dimension {} differs", embedding.vector.len()));
        }
    }
    Ok(())
}

fn file_from_row(row: &SqliteRow) -> Result<IndexedFile> {
    let status: String = row.try_get("status")?;
    let path: String = row.try_get("path")?;
    Ok(IndexedFile {
        file_id: row.try_get("file_id")?,
        path: PathBuf::from(path),
        content_hash: row.try_get("content_hash")?,
        size: row.try_get::<i64, _>("size")? as u64,
        modified_time: row.try_get("modified_time")?,
        file_type: row.try_get("file_type")?,
        status: status.parse::<FileStatus>().map_err(IndexError::Storage)?,
        last_indexed_at: row.try_get("last_indexed_at")?,
        failure_reason: row.try_get("failure_reason")?,
        metadata_json: row.try_get("metadata_json")?,
        model_id: row.try_get("model_id")?,
    })
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Escape `%`, `_` and the escape character itself for `LIKE … ESCAPE '\'`.
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Build an FTS5 MATCH expression that treats every term as a literal.
///
/// Terms are wrapped in double quotes (inner quotes doubled) and joined
/// with `OR`, so FTS5 operators in user input have no effect.
pub fn fts_match_expression(terms: &[String]) -> Option<String> {
    let quoted: Vec<String> = terms
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    if quoted.is_empty() {
        None
    } else {
        Some(quoted.join(" OR "))
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filters: &SearchFilters) {
    if !filters.file_types.is_empty() {
        qb.push(" AND f.file_type IN (");
        let mut sep = qb.separated(", ");
        for t in &filters.file_types {
            sep.push_bind(t.clone());
        }
        sep.push_unseparated(")");
    }
    if let Some(prefix) = &filters.path_prefix {
        let key = path_key(prefix);
        let mut dir = key.clone();
        if !dir.ends_with(std::path::MAIN_SEPARATOR) {
            dir.push(std::path::MAIN_SEPARATOR);
        }
        qb.push(" AND (f.path = ");
        qb.push_bind(key);
        qb.push(" OR f.path LIKE ");
        qb.push_bind(format!("{}%", escape_like(&dir)));
        qb.push(" ESCAPE '\\')");
    }
    if !filters.file_ids.is_empty() {
        qb.push(" AND f.file_id IN (");
        let mut sep = qb.separated(", ");
        for id in &filters.file_ids {
            sep.push_bind(id.clone());
        }
        sep.push_unseparated(")");
    }
}

/// One consistent read view of the index.
pub struct StoreReader {
    tx: Transaction<'static, Sqlite>,
}

impl StoreReader {
    /// BM25-ranked chunk ids for `terms`, best first. Scores are positive,
    /// higher is better.
    pub async fn search_by_keyword(
        &mut self,
        terms: &[String],
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<(String, f64)>> {
        let Some(expr) = fts_match_expression(terms) else {
            return Ok(Vec::new());
        };

        let mut qb = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT c.chunk_id AS chunk_id, -bm25(chunks_fts) AS score
            FROM chunks_fts
            JOIN chunks c ON c.chunk_id = chunks_fts.chunk_id
            JOIN indexed_files f ON f.file_id = c.file_id
            WHERE chunks_fts MATCH "#,
        );
        qb.push_bind(expr);
        push_filters(&mut qb, filters);
        qb.push(" ORDER BY score DESC, c.chunk_id LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb.build().fetch_all(&mut *self.tx).await?;
        rows.iter()
            .map(|r| Ok((r.try_get("chunk_id")?, r.try_get("score")?)))
            .collect()
    }

    /// Stream every `(chunk_id, vector)` of `model_id` that passes
    /// `filters`, calling `visit` for each. Filtering happens in SQL.
    /// Returns the number of rows visited.
    pub async fn scan_embeddings<F>(
        &mut self,
        model_id: &str,
        filters: &SearchFilters,
        mut visit: F,
    ) -> Result<usize>
    where
        F: FnMut(String, Vec<f32>),
    {
        let mut qb = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT e.chunk_id AS chunk_id, e.vector AS vector
            FROM embeddings e
            JOIN indexed_files f ON f.file_id = e.file_id
            WHERE e.model_id = "#,
        );
        qb.push_bind(model_id.to_string());
        push_filters(&mut qb, filters);

        let query = qb.build();
        let mut rows = query.fetch(&mut *self.tx);
        let mut seen = 0usize;
        while let Some(row) = rows.try_next().await? {
            let chunk_id: String = row.try_get("chunk_id")?;
            let blob: Vec<u8> = row.try_get("vector")?;
            visit(chunk_id, blob_to_vec(&blob));
            seen += 1;
        }
        Ok(seen)
    }

    /// Load chunk rows with their file data, keyed by chunk id.
    pub async fn chunk_rows(&mut self, chunk_ids: &[String]) -> Result<HashMap<String, ChunkRow>> {
        if chunk_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT c.chunk_id, c.file_id, c.chunk_index, c.text, f.path, f.file_type, f.modified_time
            FROM chunks c JOIN indexed_files f ON f.file_id = c.file_id
            WHERE c.chunk_id IN ("#,
        );
        let mut sep = qb.separated(", ");
        for id in chunk_ids {
            sep.push_bind(id.clone());
        }
        sep.push_unseparated(")");

        let rows = qb.build().fetch_all(&mut *self.tx).await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let path: String = row.try_get("path")?;
            let chunk = ChunkRow {
                chunk_id: row.try_get("chunk_id")?,
                file_id: row.try_get("file_id")?,
                chunk_index: row.try_get("chunk_index")?,
                text: row.try_get("text")?,
                path: PathBuf::from(path),
                file_type: row.try_get("file_type")?,
                modified_time: row.try_get("modified_time")?,
            };
            out.insert(chunk.chunk_id.clone(), chunk);
        }
        Ok(out)
    }

    /// End the snapshot.
    pub async fn finish(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
