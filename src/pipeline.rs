//! Indexing pipeline orchestration.
//!
//! Coordinates the per-file flow: policy check → stat → hash → extract →
//! chunk → embed → one atomic commit. Unchanged files (same content hash,
//! `Succeeded`, embedded by the active model) are skipped.
//!
//! Directory passes walk the tree once, filter it through one policy
//! snapshot, and run files on a bounded pool of tokio tasks. Per-file
//! failures are isolated in the [`BatchReport`]; a storage failure stops
//! the rest of the pass.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::chunk::{ChunkStrategy, FileChunker};
use crate::config::IndexingConfig;
use crate::embedding::EmbeddingGenerator;
use crate::error::{EmbeddingError, IndexError, Result};
use crate::extract::{detect_file_type, ExtractError, ExtractorRegistry};
use crate::models::{Embedding, FileRecord, FileStatus};
use crate::policy::{log_access, DirectoryPolicy, DirectoryValidator, Verdict};
use crate::progress::{IndexProgress, ProgressReporter};
use crate::store::IndexStore;

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Succeeded,
    Skipped,
    Failed,
}

/// Result of processing one file.
#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub file_id: Option<String>,
    pub chunk_count: usize,
    pub status: OutcomeStatus,
    pub reason: Option<String>,
}

impl FileOutcome {
    fn failed(path: PathBuf, file_id: Option<String>, reason: String) -> Self {
        Self {
            path,
            file_id,
            chunk_count: 0,
            status: OutcomeStatus::Failed,
            reason: Some(reason),
        }
    }
}

/// Totals and per-file outcomes of a directory pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub root: PathBuf,
    /// Files discovered after policy and extension filtering.
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Files never committed because the pass was cancelled or aborted.
    pub cancelled: usize,
    pub chunks_written: usize,
    /// Set when a fatal error stopped the pass early.
    pub aborted: Option<String>,
    pub outcomes: Vec<FileOutcome>,
}

impl BatchReport {
    /// Report for a single-file reindex.
    pub fn single(outcome: FileOutcome) -> Self {
        let mut report = BatchReport {
            root: outcome.path.clone(),
            total: 1,
            ..Default::default()
        };
        report.record(outcome);
        report
    }

    fn record(&mut self, outcome: FileOutcome) {
        match outcome.status {
            OutcomeStatus::Succeeded => {
                self.succeeded += 1;
                self.chunks_written += outcome.chunk_count;
            }
            OutcomeStatus::Skipped => self.skipped += 1,
            OutcomeStatus::Failed => self.failed += 1,
        }
        self.outcomes.push(outcome);
    }

    pub fn failures(&self) -> impl Iterator<Item = &FileOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Failed)
    }
}

/// Options for [`IndexingPipeline::process_directory`].
#[derive(Debug, Clone)]
pub struct DirectoryOptions {
    pub recursive: bool,
    /// Lowercase extensions without the dot. Empty falls back to the
    /// configured list, then to every extension with a dedicated extractor.
    pub extensions: Vec<String>,
    pub force: bool,
    /// 0 uses `indexing.max_workers`.
    pub max_workers: usize,
    /// Cancelling stops new files from starting and abandons uncommitted
    /// ones.
    pub cancel: CancellationToken,
}

impl Default for DirectoryOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            extensions: Vec::new(),
            force: false,
            max_workers: 0,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Clone)]
pub struct IndexingPipeline {
    store: IndexStore,
    validator: Arc<DirectoryValidator>,
    extractors: Arc<ExtractorRegistry>,
    embedder: Arc<EmbeddingGenerator>,
    chunker: FileChunker,
    strategy: Arc<str>,
    indexing: Arc<IndexingConfig>,
    locks: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl IndexingPipeline {
    /// `strategy` is a configured chunking strategy name or `auto`.
    pub fn new(
        store: IndexStore,
        validator: Arc<DirectoryValidator>,
        extractors: Arc<ExtractorRegistry>,
        embedder: Arc<EmbeddingGenerator>,
        chunker: FileChunker,
        strategy: &str,
        indexing: IndexingConfig,
    ) -> Self {
        Self {
            store,
            validator,
            extractors,
            embedder,
            chunker,
            strategy: Arc::from(strategy),
            indexing: Arc::new(indexing),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Index one file against the current policy.
    ///
    /// Extraction and embedding failures mark the file `Failed` and come
    /// back as an outcome; policy, storage and cancellation errors are
    /// returned as `Err`.
    pub async fn process_file(&self, path: &Path, force: bool) -> Result<FileOutcome> {
        let policy = self.validator.snapshot();
        self.process_with(&policy, path, force, &CancellationToken::new())
            .await
    }

    async fn process_with(
        &self,
        policy: &DirectoryPolicy,
        path: &Path,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<FileOutcome> {
        let verdict = policy.validate(path);
        log_access(path, &verdict);
        let canonical = match verdict {
            Verdict::Allowed(c) => c,
            Verdict::Denied(reason) => return Err(IndexError::validation(path, reason)),
        };

        let lock = self.path_lock(&canonical).await;
        let result = {
            let _guard = lock.lock().await;
            self.index_locked(&canonical, force, cancel).await
        };
        self.release_lock(&canonical, lock).await;
        result
    }

    async fn path_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }

    async fn release_lock(&self, path: &Path, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // map + ours: nobody else is waiting
        if Arc::strong_count(&lock) == 2 {
            locks.remove(path);
        }
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    async fn index_locked(
        &self,
        path: &Path,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<FileOutcome> {
        if cancel.is_cancelled() {
            return Err(IndexError::Cancelled);
        }

        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| IndexError::extraction(path, e.to_string()))?;
        if !meta.is_file() {
            return Err(IndexError::extraction(path, "not a regular file"));
        }
        let modified_time = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let file_type = detect_file_type(path);
        let limit = self.extractors.max_file_size();

        let (content_hash, bytes) = read_and_hash(path.to_path_buf(), limit)
            .await
            .map_err(|e| IndexError::extraction(path, e.to_string()))?;

        let record = FileRecord {
            path: path.to_path_buf(),
            content_hash,
            size: meta.len(),
            modified_time,
            file_type: file_type.clone(),
        };
        let added = self.store.add_file(&record, force).await?;
        let file = added.file;
        let model_id = self.embedder.model_id();

        if !added.changed
            && file.status == FileStatus::Succeeded
            && file.model_id.as_deref() == Some(model_id)
        {
            let chunk_count = self.store.chunk_count(&file.file_id).await?;
            debug!(file_id = %file.file_id, "unchanged, skipped");
            return Ok(FileOutcome {
                path: path.to_path_buf(),
                file_id: Some(file.file_id),
                chunk_count,
                status: OutcomeStatus::Skipped,
                reason: None,
            });
        }
        if !added.changed {
            self.store.mark_pending(&file.file_id).await?;
        }

        let Some(bytes) = bytes else {
            let reason = ExtractError::TooLarge {
                size: meta.len(),
                limit,
            }
            .to_string();
            return self.fail(path, &file.file_id, reason).await;
        };

        let registry = Arc::clone(&self.extractors);
        let owned = path.to_path_buf();
        let extracted =
            match tokio::task::spawn_blocking(move || registry.extract_bytes(&owned, &bytes)).await {
                Ok(Ok(extracted)) => extracted,
                Ok(Err(e)) => return self.fail(path, &file.file_id, e.to_string()).await,
                Err(e) => {
                    let reason = format!("extractor panicked: {}", e);
                    return self.fail(path, &file.file_id, reason).await;
                }
            };

        let strategy = ChunkStrategy::resolve(&self.strategy, &file_type);
        let chunks = self.chunker.chunk(&file.file_id, &extracted.text, strategy);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();

        let vectors = match self
            .embedder
            .embed_batch(&texts)
            .await
            .into_iter()
            .collect::<std::result::Result<Vec<_>, EmbeddingError>>()
        {
            Ok(v) => v,
            Err(e) => return self.fail(path, &file.file_id, e.to_string()).await,
        };

        if cancel.is_cancelled() {
            info!(file_id = %file.file_id, "cancelled before commit");
            return Err(IndexError::Cancelled);
        }

        let embeddings: Vec<Embedding> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| Embedding {
                embedding_id: Uuid::new_v4().to_string(),
                chunk_id: chunk.chunk_id.clone(),
                vector,
                model_id: model_id.to_string(),
            })
            .collect();
        let metadata_json = serde_json::Value::Object(extracted.metadata).to_string();

        self.store
            .replace_chunks_and_embeddings(
                &file.file_id,
                &chunks,
                &embeddings,
                model_id,
                &metadata_json,
            )
            .await?;

        info!(file_id = %file.file_id, chunks = chunks.len(), %strategy, "indexed");
        Ok(FileOutcome {
            path: path.to_path_buf(),
            file_id: Some(file.file_id),
            chunk_count: chunks.len(),
            status: OutcomeStatus::Succeeded,
            reason: None,
        })
    }

    async fn fail(&self, path: &Path, file_id: &str, reason: String) -> Result<FileOutcome> {
        warn!(file_id, %reason, "indexing failed");
        self.store.mark_failed(file_id, &reason).await?;
        Ok(FileOutcome::failed(
            path.to_path_buf(),
            Some(file_id.to_string()),
            reason,
        ))
    }

    /// Index every matching file under `root`.
    ///
    /// `progress` sees `(completed, total, path)` after each file, in
    /// completion order.
    #[instrument(skip_all, fields(root = %root.display()))]
    pub async fn process_directory(
        &self,
        root: &Path,
        options: &DirectoryOptions,
        progress: &dyn ProgressReporter,
    ) -> Result<BatchReport> {
        let policy = self.validator.snapshot();
        let verdict = policy.validate(root);
        log_access(root, &verdict);
        let root = match verdict {
            Verdict::Allowed(c) => c,
            Verdict::Denied(reason) => return Err(IndexError::validation(root, reason)),
        };

        progress.report(&IndexProgress::Discovering { root: &root });
        let files = {
            let this = self.clone();
            let policy = Arc::clone(&policy);
            let walk_root = root.clone();
            let options = options.clone();
            tokio::task::spawn_blocking(move || this.discover(&walk_root, &policy, &options))
                .await
                .map_err(|e| IndexError::extraction(&root, format!("directory walk failed: {}", e)))??
        };

        let total = files.len();
        let workers = if options.max_workers > 0 {
            options.max_workers
        } else {
            self.indexing.effective_workers()
        };
        info!(files = total, workers, "starting directory pass");

        let cancel = options.cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut set = JoinSet::new();
        for path in files {
            let this = self.clone();
            let policy = Arc::clone(&policy);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let force = options.force;
            set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return (path, Err(IndexError::Cancelled)),
                };
                let result = this.process_with(&policy, &path, force, &cancel).await;
                (path, result)
            });
        }

        let mut report = BatchReport {
            root: root.clone(),
            total,
            ..Default::default()
        };
        let mut completed = 0usize;
        while let Some(joined) = set.join_next().await {
            completed += 1;
            let path = match joined {
                Ok((path, result)) => {
                    match result {
                        Ok(outcome) => report.record(outcome),
                        Err(IndexError::Cancelled) => report.cancelled += 1,
                        Err(e) if e.is_fatal() => {
                            error!(path = %path.display(), error = %e, "fatal error, aborting pass");
                            if report.aborted.is_none() {
                                report.aborted = Some(e.to_string());
                                cancel.cancel();
                            }
                            report.record(FileOutcome::failed(path.clone(), None, e.to_string()));
                        }
                        Err(e) => {
                            report.record(FileOutcome::failed(path.clone(), None, e.to_string()))
                        }
                    }
                    path
                }
                Err(e) => {
                    error!(error = %e, "indexing worker panicked");
                    report.record(FileOutcome::failed(
                        PathBuf::new(),
                        None,
                        format!("worker panicked: {}", e),
                    ));
                    PathBuf::new()
                }
            };
            progress.report(&IndexProgress::Processing {
                completed,
                total,
                path: &path,
            });
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            cancelled = report.cancelled,
            "directory pass finished"
        );
        Ok(report)
    }

    /// Walk `root` and return the canonical paths to index, sorted.
    fn discover(
        &self,
        root: &Path,
        policy: &DirectoryPolicy,
        options: &DirectoryOptions,
    ) -> Result<Vec<PathBuf>> {
        let mut patterns: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        patterns.extend(self.indexing.exclude_globs.iter().cloned());
        let excludes = build_globset(&patterns)?;

        let extensions: Vec<String> = if !options.extensions.is_empty() {
            normalize_extensions(&options.extensions)
        } else if !self.indexing.extensions.is_empty() {
            normalize_extensions(&self.indexing.extensions)
        } else {
            self.extractors.supported_extensions()
        };

        let mut walker = WalkDir::new(root).follow_links(self.indexing.follow_symlinks);
        if !options.recursive {
            walker = walker.max_depth(1);
        }
        let excluded_roots = policy.excluded_roots();

        let mut candidates = Vec::new();
        for entry in walker
            .into_iter()
            .filter_entry(|e| !excluded_roots.iter().any(|x| e.path().starts_with(x)))
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            if excludes.is_match(relative) {
                continue;
            }
            let ext = path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if !extensions.contains(&ext) {
                continue;
            }
            candidates.push(path.to_path_buf());
        }

        let mut files = policy.allowed_files(candidates.iter().map(PathBuf::as_path));
        files.sort();
        files.dedup();
        Ok(files)
    }
}

fn normalize_extensions(exts: &[String]) -> Vec<String> {
    exts.iter()
        .map(|e| e.trim().trim_start_matches('.').to_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| IndexError::Config(format!("bad exclude glob {}: {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| IndexError::Config(e.to_string()))
}

/// SHA-256 of the file, plus its bytes when they fit under `limit`.
/// Oversized files are hashed by streaming and never held in memory.
async fn read_and_hash(path: PathBuf, limit: u64) -> std::io::Result<(String, Option<Vec<u8>>)> {
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let size = file.metadata()?.len();
        if size > limit {
            let mut hasher = Sha256::new();
            std::io::copy(&mut file, &mut hasher)?;
            return Ok((format!("{:x}", hasher.finalize()), None));
        }
        let mut bytes = Vec::with_capacity(size as usize);
        file.read_to_end(&mut bytes)?;
        let hash = format!("{:x}", Sha256::digest(&bytes));
        Ok((hash, Some(bytes)))
    })
    .await
    .map_err(std::io::Error::other)?
}
