//! Vector, keyword and hybrid search over the index.
//!
//! # Vector search
//!
//! The query is embedded once, then every stored vector of the active
//! model that passes the filters is scored by cosine similarity. Results
//! below the similarity threshold are dropped.
//!
//! # Keyword search
//!
//! The query is reduced to keywords (lowercased, stop words removed) and
//! matched through SQLite FTS5. Scores are `-bm25()`, higher is better.
//!
//! # Hybrid search
//!
//! Both channels fetch `top_k × candidate_factor` candidates from one read
//! snapshot. Each channel's scores are normalized independently
//! ([`FusionNormalization`]), then fused:
//!
//! ```text
//! hybrid = w_v · vector + w_k · keyword      (w_v + w_k = 1)
//! ```
//!
//! A chunk found by one channel only gets 0 for the other. A channel with
//! weight 0 is not queried at all. Ties are broken by newer file
//! modification time, then by chunk id. The top `rerank_top_n` results
//! can be reranked with bonuses for the exact query phrase, matching
//! terms, and an early phrase position.
//!
//! Hybrid result sets are kept in a [`ResultCache`] keyed by the cleaned
//! query and parameters, and dropped as soon as the store commits.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::config::RetrievalConfig;
use crate::embedding::{cosine_similarity, EmbeddingGenerator};
use crate::error::{IndexError, Result};
use crate::extract::detect_file_type;
use crate::models::{MatchType, SearchFilters, SearchResult};
use crate::result_cache::{ResultCache, ResultCacheStats};
use crate::store::{ChunkRow, IndexStore, StoreReader};

pub const MIN_QUERY_CHARS: usize = 2;
pub const MAX_QUERY_CHARS: usize = 500;
const SNIPPET_CHARS: usize = 240;
const SNIPPET_LEAD: usize = 60;

const PHRASE_BONUS: f64 = 0.2;
const TERM_BONUS: f64 = 0.05;
const MAX_TERM_BONUS: f64 = 0.3;
const POSITION_BONUS: f64 = 0.1;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "he",
    "her", "his", "how", "i", "if", "in", "into", "is", "it", "its", "me", "my", "of", "on",
    "or", "our", "she", "so", "than", "that", "the", "their", "them", "then", "there", "these",
    "they", "this", "to", "was", "we", "were", "what", "when", "where", "which", "who", "why",
    "will", "with", "you", "your",
];

/// How each channel's raw scores are mapped before fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FusionNormalization {
    /// `(s - min) / (max - min)`; all-equal lists map to 1.0.
    #[default]
    MinMax,
    /// `exp(s - max) / Σ exp(s_i - max)`.
    Softmax,
}

impl FromStr for FusionNormalization {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "min_max" => Ok(FusionNormalization::MinMax),
            "softmax" => Ok(FusionNormalization::Softmax),
            other => Err(format!("unknown normalization: {}", other)),
        }
    }
}

/// Engine-wide retrieval settings.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub candidate_factor: usize,
    pub rerank_top_n: usize,
    pub normalization: FusionNormalization,
    pub similarity_threshold: f64,
    pub cache_size: usize,
    pub cache_ttl: Duration,
}

impl SearchSettings {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            candidate_factor: config.candidate_factor.max(1),
            rerank_top_n: config.rerank_top_n,
            normalization: config.normalization.parse().unwrap_or_default(),
            similarity_threshold: config.similarity_threshold,
            cache_size: config.cache_size,
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
        }
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self::from_config(&RetrievalConfig::default())
    }
}

/// Per-query hybrid parameters.
#[derive(Debug, Clone)]
pub struct HybridParams {
    pub top_k: usize,
    pub vector_weight: f64,
    pub keyword_weight: f64,
    pub rerank: bool,
    pub filters: SearchFilters,
}

impl HybridParams {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            top_k: config.final_limit,
            vector_weight: config.vector_weight,
            keyword_weight: config.keyword_weight,
            rerank: config.rerank,
            filters: SearchFilters::default(),
        }
    }
}

pub struct HybridSearchEngine {
    store: IndexStore,
    embedder: Arc<EmbeddingGenerator>,
    settings: SearchSettings,
    cache: ResultCache,
}

impl HybridSearchEngine {
    pub fn new(store: IndexStore, embedder: Arc<EmbeddingGenerator>, settings: SearchSettings) -> Self {
        Self {
            cache: ResultCache::new(settings.cache_size, settings.cache_ttl),
            store,
            embedder,
            settings,
        }
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    pub fn cache_stats(&self) -> ResultCacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Rank stored chunks by cosine similarity to `query_vector`.
    pub async fn vector_search(
        &self,
        query_vector: &[f32],
        top_k: usize,
        threshold: f64,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchResult>> {
        check_top_k(top_k)?;
        let filters = normalize_filters(filters)?;
        let mut reader = self.store.reader().await?;
        let hits = self.vector_candidates(&mut reader, query_vector, top_k, threshold, &filters).await?;
        let rows = reader.chunk_rows(&ids(&hits)).await?;
        reader.finish().await?;
        Ok(ranked(hits, &rows, MatchType::Vector, &[], top_k))
    }

    /// Rank stored chunks by BM25 against the query's keywords.
    pub async fn keyword_search(
        &self,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchResult>> {
        check_top_k(top_k)?;
        let query = validate_query(query)?;
        let filters = normalize_filters(filters)?;
        let keywords = extract_keywords(&query);
        let mut reader = self.store.reader().await?;
        let hits = reader.search_by_keyword(&keywords, &filters, top_k).await?;
        let rows = reader.chunk_rows(&ids(&hits)).await?;
        reader.finish().await?;
        Ok(ranked(hits, &rows, MatchType::Keyword, &keywords, top_k))
    }

    /// Fused vector + keyword search.
    #[instrument(skip_all, fields(top_k = params.top_k))]
    pub async fn hybrid_search(&self, query: &str, params: &HybridParams) -> Result<Vec<SearchResult>> {
        check_top_k(params.top_k)?;
        let query = validate_query(query)?;
        let filters = normalize_filters(&params.filters)?;
        let (w_v, w_k) = normalize_weights(params.vector_weight, params.keyword_weight)?;
        let cache_key = format!(
            "{}\u{1f}{}\u{1f}{:.6}\u{1f}{:.6}\u{1f}{}\u{1f}{:?}",
            query, params.top_k, w_v, w_k, params.rerank, filters
        );
        // read before searching, so a commit racing this query discards it
        let generation = self.store.generation();
        if let Some(hit) = self.cache.get(&cache_key, generation) {
            debug!("result cache hit");
            return Ok(hit);
        }

        let keywords = extract_keywords(&query);
        let pool_size = params.top_k.saturating_mul(self.settings.candidate_factor);

        // Embed before opening the snapshot so no read transaction waits on
        // the backend.
        let query_vector = if w_v > 0.0 {
            Some(self.embedder.embed(&query).await?)
        } else {
            None
        };

        let mut reader = self.store.reader().await?;
        let vector_hits = match &query_vector {
            Some(v) => {
                self.vector_candidates(&mut reader, v, pool_size, self.settings.similarity_threshold, &filters)
                    .await?
            }
            None => Vec::new(),
        };
        let keyword_hits = if w_k > 0.0 {
            reader.search_by_keyword(&keywords, &filters, pool_size).await?
        } else {
            Vec::new()
        };
        debug!(
            vector = vector_hits.len(),
            keyword = keyword_hits.len(),
            "hybrid candidates"
        );

        let norm_v = normalize_scores(&vector_hits, self.settings.normalization);
        let norm_k = normalize_scores(&keyword_hits, self.settings.normalization);

        let mut fused: HashMap<String, (Option<f64>, Option<f64>)> = HashMap::new();
        for (id, s) in norm_v {
            fused.entry(id).or_default().0 = Some(s);
        }
        for (id, s) in norm_k {
            fused.entry(id).or_default().1 = Some(s);
        }

        let all_ids: Vec<String> = fused.keys().cloned().collect();
        let rows = reader.chunk_rows(&all_ids).await?;
        reader.finish().await?;

        let mut results: Vec<SearchResult> = fused
            .into_iter()
            .filter_map(|(id, (v, k))| {
                let row = rows.get(&id)?;
                let score = w_v * v.unwrap_or(0.0) + w_k * k.unwrap_or(0.0);
                let match_type = match (v, k) {
                    (Some(_), Some(_)) => MatchType::Hybrid,
                    (Some(_), None) => MatchType::Vector,
                    _ => MatchType::Keyword,
                };
                Some(to_result(row, score, match_type, &keywords))
            })
            .collect();

        sort_results(&mut results);
        if params.rerank {
            rerank(&query, &mut results, self.settings.rerank_top_n);
        }
        results.truncate(params.top_k);
        self.cache.put(cache_key, generation, results.clone());
        Ok(results)
    }

    async fn vector_candidates(
        &self,
        reader: &mut StoreReader,
        query_vector: &[f32],
        limit: usize,
        threshold: f64,
        filters: &SearchFilters,
    ) -> Result<Vec<(String, f64)>> {
        let mut hits = Vec::new();
        reader
            .scan_embeddings(self.embedder.model_id(), filters, |chunk_id, vector| {
                let sim = cosine_similarity(query_vector, &vector) as f64;
                if sim >= threshold {
                    hits.push((chunk_id, sim));
                }
            })
            .await?;
        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(limit);
        Ok(hits)
    }
}

fn ids(hits: &[(String, f64)]) -> Vec<String> {
    hits.iter().map(|(id, _)| id.clone()).collect()
}

fn check_top_k(top_k: usize) -> Result<()> {
    if top_k == 0 {
        return Err(IndexError::Query("top_k must be at least 1".into()));
    }
    Ok(())
}

fn ranked(
    hits: Vec<(String, f64)>,
    rows: &HashMap<String, ChunkRow>,
    match_type: MatchType,
    keywords: &[String],
    top_k: usize,
) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = hits
        .into_iter()
        .filter_map(|(id, score)| rows.get(&id).map(|row| to_result(row, score, match_type, keywords)))
        .collect();
    sort_results(&mut results);
    results.truncate(top_k);
    results
}

fn to_result(row: &ChunkRow, score: f64, match_type: MatchType, keywords: &[String]) -> SearchResult {
    SearchResult {
        chunk_id: row.chunk_id.clone(),
        file_id: row.file_id.clone(),
        file_path: row.path.clone(),
        chunk_index: row.chunk_index,
        score,
        match_type,
        snippet: make_snippet(&row.text, keywords),
        text: row.text.clone(),
        file_type: row.file_type.clone(),
        modified_time: row.modified_time,
    }
}

/// Score descending, then newer file, then chunk id.
pub fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(b.modified_time.cmp(&a.modified_time))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

/// Boost the first `top_n` results and re-sort.
pub fn rerank(query: &str, results: &mut [SearchResult], top_n: usize) {
    let query_lower = query.to_lowercase();
    let terms = extract_keywords(query);
    let n = top_n.min(results.len());

    for result in results.iter_mut().take(n) {
        let content = result.text.to_lowercase();
        let mut boost = 0.0;

        if let Some(pos) = content.find(&query_lower) {
            boost += PHRASE_BONUS;
            boost += POSITION_BONUS * (1.0 - pos as f64 / content.len().max(1) as f64);
        }
        let matched = terms.iter().filter(|t| content.contains(t.as_str())).count();
        boost += (matched as f64 * TERM_BONUS).min(MAX_TERM_BONUS);

        result.score += boost;
    }
    sort_results(results);
}

/// Normalize a channel's `(id, raw score)` list.
pub fn normalize_scores(hits: &[(String, f64)], method: FusionNormalization) -> Vec<(String, f64)> {
    if hits.is_empty() {
        return Vec::new();
    }
    let max = hits.iter().map(|h| h.1).fold(f64::NEG_INFINITY, f64::max);
    match method {
        FusionNormalization::MinMax => {
            let min = hits.iter().map(|h| h.1).fold(f64::INFINITY, f64::min);
            hits.iter()
                .map(|(id, s)| {
                    let norm = if (max - min).abs() < f64::EPSILON {
                        1.0
                    } else {
                        (s - min) / (max - min)
                    };
                    (id.clone(), norm)
                })
                .collect()
        }
        FusionNormalization::Softmax => {
            let exps: Vec<f64> = hits.iter().map(|(_, s)| (s - max).exp()).collect();
            let sum: f64 = exps.iter().sum();
            hits.iter()
                .zip(exps)
                .map(|((id, _), e)| (id.clone(), e / sum))
                .collect()
        }
    }
}

fn normalize_weights(vector_weight: f64, keyword_weight: f64) -> Result<(f64, f64)> {
    if !(vector_weight >= 0.0 && keyword_weight >= 0.0) {
        return Err(IndexError::Query("weights must be non-negative".into()));
    }
    let sum = vector_weight + keyword_weight;
    if sum <= 0.0 {
        return Err(IndexError::Query("vector and keyword weight cannot both be 0".into()));
    }
    Ok((vector_weight / sum, keyword_weight / sum))
}

/// Clean and bound a user query.
///
/// Strips `<>{}\`, collapses whitespace and requires 2..=500 characters.
pub fn validate_query(query: &str) -> Result<String> {
    let stripped: String = query
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | '{' | '}' | '\\'))
        .collect();
    let cleaned = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    let len = cleaned.chars().count();
    if len < MIN_QUERY_CHARS {
        return Err(IndexError::Query(format!(
            "query must be at least {} characters",
            MIN_QUERY_CHARS
        )));
    }
    if len > MAX_QUERY_CHARS {
        return Err(IndexError::Query(format!(
            "query must be at most {} characters",
            MAX_QUERY_CHARS
        )));
    }
    Ok(cleaned)
}

/// Normalize file-type filters (`".MD"` → `"markdown"`) and reject empty
/// entries.
pub fn normalize_filters(filters: &SearchFilters) -> Result<SearchFilters> {
    let mut out = filters.clone();
    out.file_types = Vec::with_capacity(filters.file_types.len());
    for raw in &filters.file_types {
        let t = raw.trim().trim_start_matches('.').to_lowercase();
        if t.is_empty() {
            return Err(IndexError::Query(format!("invalid file type filter: {:?}", raw)));
        }
        let label = detect_file_type(&PathBuf::from(format!("f.{}", t)));
        if !out.file_types.contains(&label) {
            out.file_types.push(label);
        }
    }
    if let Some(prefix) = &filters.path_prefix {
        if prefix.as_os_str().is_empty() {
            return Err(IndexError::Query("empty path prefix".into()));
        }
    }
    Ok(out)
}

/// Lowercased search terms with stop words and one-letter tokens removed.
///
/// Falls back to every token when only stop words remain.
pub fn extract_keywords(query: &str) -> Vec<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
        .collect();

    let mut keywords: Vec<String> = Vec::new();
    for t in tokens.iter().filter(|t| !STOP_WORDS.contains(&t.as_str())) {
        if !keywords.contains(t) {
            keywords.push(t.clone());
        }
    }
    if keywords.is_empty() {
        for t in tokens {
            if !keywords.contains(&t) {
                keywords.push(t);
            }
        }
    }
    keywords
}

/// A window of the text around the first keyword hit.
pub fn make_snippet(text: &str, keywords: &[String]) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= SNIPPET_CHARS {
        return text.replace('\n', " ").trim().to_string();
    }
    let lower = text.to_lowercase();
    let hit_byte = keywords.iter().filter_map(|k| lower.find(k.as_str())).min();
    // Lowercasing can change byte lengths; map back through char counts.
    let hit_char = hit_byte
        .map(|b| lower[..b].chars().count().min(chars.len()))
        .unwrap_or(0);

    let start = hit_char.saturating_sub(SNIPPET_LEAD);
    let start = start.min(chars.len() - SNIPPET_CHARS);
    let end = start + SNIPPET_CHARS;

    let mut snippet = String::new();
    if start > 0 {
        snippet.push_str("...");
    }
    snippet.extend(chars[start..end].iter().map(|c| if *c == '\n' { ' ' } else { *c }));
    if end < chars.len() {
        snippet.push_str("...");
    }
    snippet
}

/// Results sharing a file, best first.
#[derive(Debug, Clone, Serialize)]
pub struct FileGroup {
    pub file_id: String,
    pub file_path: PathBuf,
    pub best_score: f64,
    pub results: Vec<SearchResult>,
}

/// Group results by file, keeping each group in rank order and ordering
/// groups by their best score.
pub fn group_by_file(results: &[SearchResult]) -> Vec<FileGroup> {
    let mut groups: Vec<FileGroup> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for r in results {
        match index.get(r.file_id.as_str()) {
            Some(&i) => {
                let g = &mut groups[i];
                g.best_score = g.best_score.max(r.score);
                g.results.push(r.clone());
            }
            None => {
                index.insert(r.file_id.as_str(), groups.len());
                groups.push(FileGroup {
                    file_id: r.file_id.clone(),
                    file_path: r.file_path.clone(),
                    best_score: r.score,
                    results: vec![r.clone()],
                });
            }
        }
    }
    groups.sort_by(|a, b| b.best_score.partial_cmp(&a.best_score).unwrap_or(Ordering::Equal));
    groups
}

/// Drop results whose chunk is adjacent (index ±1) to a higher-ranked
/// result from the same file.
pub fn dedupe_adjacent(results: Vec<SearchResult>) -> Vec<SearchResult> {
    dedupe_similar(results, f64::INFINITY)
}

/// Like [`dedupe_adjacent`], but also drops results whose text overlaps a
/// higher-ranked result by more than `threshold` ([`text_similarity`]).
pub fn dedupe_similar(results: Vec<SearchResult>, threshold: f64) -> Vec<SearchResult> {
    let mut kept: Vec<SearchResult> = Vec::with_capacity(results.len());
    for r in results {
        let duplicate = kept.iter().any(|k| {
            (k.file_id == r.file_id && (k.chunk_index - r.chunk_index).abs() <= 1)
                || text_similarity(&k.text, &r.text) > threshold
        });
        if !duplicate {
            kept.push(r);
        }
    }
    kept
}

/// Jaccard index of the lowercased whitespace-separated word sets.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    let a_lower = a.to_lowercase();
    let b_lower = b.to_lowercase();
    let words_a: HashSet<&str> = a_lower.split_whitespace().collect();
    let words_b: HashSet<&str> = b_lower.split_whitespace().collect();
    let union = words_a.union(&words_b).count();
    if union == 0 {
        return 0.0;
    }
    words_a.intersection(&words_b).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hits(items: &[(&str, f64)]) -> Vec<(String, f64)> {
        items.iter().map(|(id, s)| (id.to_string(), *s)).collect()
    }

    fn result(chunk_id: &str, file_id: &str, index: i64, score: f64, mtime: i64) -> SearchResult {
        SearchResult {
            chunk_id: chunk_id.into(),
            file_id: file_id.into(),
            file_path: PathBuf::from(format!("/{}.txt", file_id)),
            chunk_index: index,
            score,
            match_type: MatchType::Hybrid,
            snippet: String::new(),
            text: String::new(),
            file_type: "text".into(),
            modified_time: mtime,
        }
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_scores(&[], FusionNormalization::MinMax).is_empty());
    }

    #[test]
    fn test_normalize_range() {
        let result = normalize_scores(
            &hits(&[("c1", 10.0), ("c2", 5.0), ("c3", 0.0)]),
            FusionNormalization::MinMax,
        );
        assert!((result[0].1 - 1.0).abs() < 1e-9);
        assert!((result[1].1 - 0.5).abs() < 1e-9);
        assert!((result[2].1 - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal() {
        let result = normalize_scores(&hits(&[("c1", 3.0), ("c2", 3.0)]), FusionNormalization::MinMax);
        for (_, score) in &result {
            assert!((*score - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn softmax_sums_to_one_and_keeps_order() {
        let result = normalize_scores(
            &hits(&[("c1", 2.0), ("c2", 1.0), ("c3", -1.0)]),
            FusionNormalization::Softmax,
        );
        let sum: f64 = result.iter().map(|r| r.1).sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(result[0].1 > result[1].1 && result[1].1 > result[2].1);
    }

    #[test]
    fn weights_are_normalized() {
        let (v, k) = normalize_weights(3.0, 1.0).unwrap();
        assert!((v - 0.75).abs() < 1e-9 && (k - 0.25).abs() < 1e-9);
        assert!(normalize_weights(0.0, 0.0).is_err());
        assert!(normalize_weights(-1.0, 1.0).is_err());
        assert!(normalize_weights(f64::NAN, 1.0).is_err());
    }

    #[test]
    fn query_validation() {
        assert_eq!(validate_query("  invoice \n\t total ").unwrap(), "invoice total");
        assert_eq!(validate_query("<b>{x}</b>").unwrap(), "bx/b");
        assert!(matches!(validate_query("a"), Err(IndexError::Query(_))));
        assert!(matches!(validate_query("<>"), Err(IndexError::Query(_))));
        assert!(validate_query(&"x".repeat(501)).is_err());
        assert!(validate_query(&"x".repeat(500)).is_ok());
    }

    #[test]
    fn keyword_extraction_drops_stop_words() {
        assert_eq!(
            extract_keywords("What is the Invoice total, for Q3?"),
            vec!["invoice", "total", "q3"]
        );
        assert_eq!(extract_keywords("the of"), vec!["the", "of"]);
        assert!(extract_keywords("a ! ?").is_empty());
    }

    #[test]
    fn filter_types_are_normalized() {
        let filters = SearchFilters {
            file_types: vec![".MD".into(), "markdown".into(), "rs".into()],
            ..Default::default()
        };
        let out = normalize_filters(&filters).unwrap();
        assert_eq!(out.file_types, vec!["markdown", "rust"]);
        let bad = SearchFilters {
            file_types: vec![" . ".into()],
            ..Default::default()
        };
        assert!(normalize_filters(&bad).is_err());
    }

    #[test]
    fn ties_break_by_recency_then_id() {
        let mut rs = vec![
            result("b", "f1", 0, 0.5, 100),
            result("a", "f2", 0, 0.5, 100),
            result("c", "f3", 0, 0.5, 200),
            result("d", "f4", 0, 0.9, 0),
        ];
        sort_results(&mut rs);
        let order: Vec<&str> = rs.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(order, vec!["d", "c", "a", "b"]);
    }

    #[test]
    fn rerank_rewards_exact_phrase() {
        let mut with_phrase = result("a", "f1", 0, 0.5, 0);
        with_phrase.text = "The invoice total is 42".into();
        let mut without = result("b", "f2", 0, 0.6, 0);
        without.text = "total of the invoice".into();
        let mut rs = vec![without, with_phrase];
        rerank("invoice total", &mut rs, 10);
        assert_eq!(rs[0].chunk_id, "a");
        assert!(rs[0].score > 0.5 + PHRASE_BONUS);
    }

    #[test]
    fn rerank_only_touches_top_n() {
        let mut first = result("a", "f1", 0, 0.9, 0);
        first.text = "nothing".into();
        let mut second = result("b", "f2", 0, 0.1, 0);
        second.text = "invoice total".into();
        let mut rs = vec![first, second];
        rerank("invoice total", &mut rs, 1);
        assert_eq!(rs[1].score, 0.1);
    }

    #[test]
    fn snippet_centers_on_first_hit() {
        let text = format!("{}invoice total{}", "x ".repeat(200), " y".repeat(200));
        let snippet = make_snippet(&text, &["invoice".to_string()]);
        assert!(snippet.starts_with("..."));
        assert!(snippet.ends_with("..."));
        assert!(snippet.contains("invoice total"));
        assert_eq!(make_snippet("short\ntext", &[]), "short text");
    }

    #[test]
    fn grouping_and_adjacent_dedupe() {
        let rs = vec![
            result("a0", "fa", 3, 0.9, 0),
            result("b0", "fb", 0, 0.8, 0),
            result("a1", "fa", 4, 0.7, 0),
            result("a2", "fa", 9, 0.6, 0),
        ];
        let groups = group_by_file(&rs);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].file_id, "fa");
        assert_eq!(groups[0].results.len(), 3);

        let deduped = dedupe_adjacent(rs);
        let kept: Vec<&str> = deduped.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(kept, vec!["a0", "b0", "a2"]);
    }

    #[test]
    fn near_duplicate_text_is_dropped() {
        let mut a = result("a0", "fa", 0, 0.9, 0);
        a.text = "The invoice total for March is 1200 dollars".into();
        let mut b = result("b0", "fb", 0, 0.8, 0);
        b.text = "the INVOICE total for march is 1200 dollars".into();
        let mut c = result("c0", "fc", 0, 0.7, 0);
        c.text = "The invoice total for April is 900 dollars".into();
        let mut d = result("a1", "fa", 1, 0.6, 0);
        d.text = "unrelated neighbour chunk".into();

        assert!((text_similarity(&a.text, &b.text) - 1.0).abs() < 1e-9);
        assert!(text_similarity(&a.text, &c.text) < 0.9);
        assert_eq!(text_similarity("", ""), 0.0);

        let kept: Vec<String> = dedupe_similar(vec![a, b, c, d], 0.9)
            .into_iter()
            .map(|r| r.chunk_id)
            .collect();
        assert_eq!(kept, vec!["a0", "c0"]);
    }
}
