//! Administration façade.
//!
//! [`RagEngine`] owns one of each component, wired from a [`Config`]:
//! the store, the policy validator, the embedding generator, the indexing
//! pipeline, the hybrid search engine and the context assembler. The CLI
//! and embedding programs talk to this type only.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::chunk::FileChunker;
use crate::config::{expand_tilde, validate, Config};
use crate::context::ContextAssembler;
use crate::embedding::{CacheStats, EmbeddingGenerator};
use crate::error::{IndexError, Result};
use crate::extract::ExtractorRegistry;
use crate::models::SearchResult;
use crate::pipeline::{BatchReport, DirectoryOptions, IndexingPipeline};
use crate::policy::{canonicalize, normalize_lexically, DirectoryPolicy, DirectoryValidator, Verdict};
use crate::progress::{NoProgress, ProgressReporter};
use crate::search::{HybridParams, HybridSearchEngine, SearchSettings};
use crate::stats::IndexStats;
use crate::store::{IndexStore, StoredPolicy};

/// Outcome of [`RagEngine::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub issues: Vec<String>,
    /// Unix seconds.
    pub checked_at: i64,
}

pub struct RagEngine {
    config: Config,
    db_path: PathBuf,
    store: IndexStore,
    validator: Arc<DirectoryValidator>,
    embedder: Arc<EmbeddingGenerator>,
    pipeline: IndexingPipeline,
    search: Arc<HybridSearchEngine>,
    context: ContextAssembler,
}

impl RagEngine {
    /// Open (or create) the index described by `config` with its
    /// configured embedding backend.
    pub async fn open(config: Config) -> Result<Self> {
        validate(&config).map_err(|e| IndexError::Config(format!("{:#}", e)))?;
        let embedder = EmbeddingGenerator::from_config(&config.embedding)
            .map_err(|e| IndexError::Config(format!("{:#}", e)))?;
        Self::open_with_embedder(config, Arc::new(embedder)).await
    }

    /// Open with an explicit embedding generator.
    ///
    /// The directory policy saved in the database wins over `config.policy`.
    pub async fn open_with_embedder(config: Config, embedder: Arc<EmbeddingGenerator>) -> Result<Self> {
        let db_path = expand_tilde(&config.db.path);
        let store = IndexStore::open(&db_path).await?;

        let policy = match store.load_policy().await? {
            Some(saved) => DirectoryPolicy::new(&saved.allowed, &saved.excluded),
            None => {
                let allowed: Vec<PathBuf> = config.policy.allowed.iter().map(|p| expand_tilde(p)).collect();
                let excluded: Vec<PathBuf> = config.policy.excluded.iter().map(|p| expand_tilde(p)).collect();
                DirectoryPolicy::new(&allowed, &excluded)
            }
        }
        .map_err(|e| IndexError::Config(format!("invalid directory policy: {}", e)))?;
        let validator = Arc::new(DirectoryValidator::new(policy));

        let extractors = Arc::new(ExtractorRegistry::with_defaults(config.indexing.max_file_size));
        let pipeline = IndexingPipeline::new(
            store.clone(),
            Arc::clone(&validator),
            extractors,
            Arc::clone(&embedder),
            FileChunker::from_config(&config.chunking),
            &config.chunking.strategy,
            config.indexing.clone(),
        );
        let search = Arc::new(HybridSearchEngine::new(
            store.clone(),
            Arc::clone(&embedder),
            SearchSettings::from_config(&config.retrieval),
        ));
        let context = ContextAssembler::new(Arc::clone(&search), config.retrieval.clone());

        info!(db = %db_path.display(), model = embedder.model_id(), "index opened");
        Ok(Self {
            config,
            db_path,
            store,
            validator,
            embedder,
            pipeline,
            search,
            context,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    pub fn pipeline(&self) -> &IndexingPipeline {
        &self.pipeline
    }

    pub fn search_engine(&self) -> &HybridSearchEngine {
        &self.search
    }

    pub fn context(&self) -> &ContextAssembler {
        &self.context
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.embedder.cache_stats()
    }

    pub fn directory_policy(&self) -> Arc<DirectoryPolicy> {
        self.validator.snapshot()
    }

    /// Replace the active policy and persist it.
    pub async fn set_directory_policy(&self, allowed: &[PathBuf], excluded: &[PathBuf]) -> Result<()> {
        let allowed: Vec<PathBuf> = allowed.iter().map(|p| expand_tilde(p)).collect();
        let excluded: Vec<PathBuf> = excluded.iter().map(|p| expand_tilde(p)).collect();
        let policy = DirectoryPolicy::new(&allowed, &excluded)
            .map_err(|e| IndexError::Config(format!("invalid directory policy: {}", e)))?;

        self.store
            .save_policy(&StoredPolicy {
                allowed: policy.allowed_roots().to_vec(),
                excluded: policy.excluded_roots().to_vec(),
            })
            .await?;
        info!(
            allowed = policy.allowed_roots().len(),
            excluded = policy.excluded_roots().len(),
            "directory policy updated"
        );
        self.validator.replace(Arc::new(policy));
        Ok(())
    }

    /// Index a file or a directory tree.
    pub async fn reindex(&self, path: &Path, force: bool) -> Result<BatchReport> {
        let options = DirectoryOptions {
            force,
            ..Default::default()
        };
        self.reindex_with(path, &options, &NoProgress).await
    }

    pub async fn reindex_with(
        &self,
        path: &Path,
        options: &DirectoryOptions,
        progress: &dyn ProgressReporter,
    ) -> Result<BatchReport> {
        let canonical = match self.validator.validate(path) {
            Verdict::Allowed(c) => c,
            Verdict::Denied(reason) => return Err(IndexError::validation(path, reason)),
        };
        if canonical.is_dir() {
            self.pipeline
                .process_directory(&canonical, options, progress)
                .await
        } else {
            let outcome = self.pipeline.process_file(&canonical, options.force).await?;
            Ok(BatchReport::single(outcome))
        }
    }

    /// Drop a file, or every file under a directory, from the index.
    /// The path need not exist on disk anymore. Returns the number of
    /// files removed.
    pub async fn remove_path(&self, path: &Path) -> Result<usize> {
        let target = canonicalize(path).unwrap_or_else(|_| normalize_lexically(path));

        let files = match self.store.get_file_by_path(&target).await? {
            Some(file) => vec![file],
            None => self.store.files_under(&target).await?,
        };
        let mut removed = 0;
        for file in files {
            if self.store.remove_file(&file.file_id).await? {
                removed += 1;
            }
        }
        info!(path = %target.display(), removed, "removed from index");
        Ok(removed)
    }

    pub async fn index_statistics(&self) -> Result<IndexStats> {
        self.store.statistics().await
    }

    /// Check that the database answers and is consistent, and that the
    /// embedding backend returns a vector of the expected dimension.
    pub async fn health_check(&self) -> HealthReport {
        let mut issues = Vec::new();
        match self.store.integrity_issues().await {
            Ok(found) => issues.extend(found),
            Err(e) => issues.push(format!("database check failed: {}", e)),
        }
        if let Err(e) = self.embedder.check_backend().await {
            issues.push(format!("embedding backend check failed: {}", e));
        }
        if !issues.is_empty() {
            warn!(issues = issues.len(), "index health check failed");
        }
        HealthReport {
            healthy: issues.is_empty(),
            issues,
            checked_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Hybrid search with the configured retrieval defaults.
    pub async fn search(&self, query: &str, params: &HybridParams) -> Result<Vec<SearchResult>> {
        self.search.hybrid_search(query, params).await
    }

    pub fn default_params(&self) -> HybridParams {
        HybridParams::from_config(&self.config.retrieval)
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EmbeddingError;
    use tempfile::TempDir;

    fn config_for(tmp: &TempDir) -> Config {
        let mut config = Config::default();
        config.db.path = tmp.path().join("data/rag.sqlite");
        config.policy.allowed = vec![tmp.path().join("docs")];
        config
    }

    #[tokio::test]
    async fn policy_is_persisted_across_opens() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("docs/private")).unwrap();
        std::fs::create_dir_all(tmp.path().join("other")).unwrap();
        let config = config_for(&tmp);

        let engine = RagEngine::open(config.clone()).await.unwrap();
        engine
            .set_directory_policy(&[tmp.path().join("other")], &[])
            .await
            .unwrap();
        engine.close().await;

        let reopened = RagEngine::open(config).await.unwrap();
        let policy = reopened.directory_policy();
        assert_eq!(policy.allowed_roots().len(), 1);
        assert!(policy.allowed_roots()[0].ends_with("other"));
    }

    #[tokio::test]
    async fn reindex_file_and_remove_directory() {
        let tmp = TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        std::fs::create_dir_all(docs.join("sub")).unwrap();
        std::fs::write(docs.join("a.txt"), "alpha file").unwrap();
        std::fs::write(docs.join("sub/b.txt"), "beta file").unwrap();
        let engine = RagEngine::open(config_for(&tmp)).await.unwrap();

        let single = engine.reindex(&docs.join("a.txt"), false).await.unwrap();
        assert_eq!((single.total, single.succeeded), (1, 1));

        let all = engine.reindex(&docs, false).await.unwrap();
        assert_eq!(all.succeeded, 1);
        assert_eq!(all.skipped, 1);
        assert_eq!(engine.index_statistics().await.unwrap().file_count, 2);

        assert_eq!(engine.remove_path(&docs.join("sub")).await.unwrap(), 1);
        assert_eq!(engine.index_statistics().await.unwrap().file_count, 1);
    }

    #[tokio::test]
    async fn reindex_outside_policy_is_denied() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("docs")).unwrap();
        let engine = RagEngine::open(config_for(&tmp)).await.unwrap();
        let err = engine.reindex(tmp.path(), false).await.unwrap_err();
        assert!(matches!(err, IndexError::Validation { .. }));
    }

    struct DownBackend;

    #[async_trait::async_trait]
    impl crate::embedding::EmbeddingBackend for DownBackend {
        fn model_id(&self) -> &str {
            "down"
        }

        fn dims(&self) -> usize {
            8
        }

        async fn embed(&self, _texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
            Err(EmbeddingError::Rejected("401 unauthorized".into()))
        }
    }

    #[tokio::test]
    async fn health_check_reports_backend_failure() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("docs")).unwrap();

        let engine = RagEngine::open(config_for(&tmp)).await.unwrap();
        let report = engine.health_check().await;
        assert!(report.healthy, "issues: {:?}", report.issues);
        engine.close().await;

        let down = Arc::new(EmbeddingGenerator::new(
            Arc::new(DownBackend),
            crate::embedding::GeneratorOptions::default(),
        ));
        let engine = RagEngine::open_with_embedder(config_for(&tmp), down).await.unwrap();
        let report = engine.health_check().await;
        assert!(!report.healthy);
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].contains("401 unauthorized"));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_for(&tmp);
        config.retrieval.vector_weight = 0.0;
        config.retrieval.keyword_weight = 0.0;
        assert!(matches!(
            RagEngine::open(config).await,
            Err(IndexError::Config(_))
        ));
    }
}
