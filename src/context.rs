//! Query → ranked context items for a downstream consumer.
//!
//! [`ContextAssembler`] runs a hybrid search, drops weak hits, labels each
//! item with a relevance level and keeps a bounded search history that
//! feeds query suggestions. Items can be rendered into a prompt block or
//! exported as JSON, CSV or Markdown.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::RetrievalConfig;
use crate::error::Result;
use crate::models::{MatchType, SearchFilters, SearchResult};
use crate::search::{validate_query, HybridParams, HybridSearchEngine};

pub const MAX_HISTORY: usize = 100;
const MAX_SUGGESTIONS: usize = 5;

/// Human-readable bucket for a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Relevance {
    Excellent,
    Good,
    Fair,
    Weak,
}

impl Relevance {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            Relevance::Excellent
        } else if score >= 0.7 {
            Relevance::Good
        } else if score >= 0.5 {
            Relevance::Fair
        } else {
            Relevance::Weak
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Relevance::Excellent => "Excellent",
            Relevance::Good => "Good",
            Relevance::Fair => "Fair",
            Relevance::Weak => "Weak",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextItem {
    pub file_path: PathBuf,
    pub file_name: String,
    pub chunk_id: String,
    pub file_id: String,
    pub chunk_index: i64,
    pub score: f64,
    pub match_type: MatchType,
    pub relevance: Relevance,
    pub file_type: String,
    pub snippet: String,
    pub content: String,
}

impl From<SearchResult> for ContextItem {
    fn from(r: SearchResult) -> Self {
        let file_name = r
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            relevance: Relevance::from_score(r.score),
            file_name,
            file_path: r.file_path,
            chunk_id: r.chunk_id,
            file_id: r.file_id,
            chunk_index: r.chunk_index,
            score: r.score,
            match_type: r.match_type,
            file_type: r.file_type,
            snippet: r.snippet,
            content: r.text,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub query: String,
    pub result_count: usize,
    /// Unix seconds.
    pub at: i64,
}

/// Most recent queries plus term frequencies, bounded to [`MAX_HISTORY`].
#[derive(Debug, Default)]
pub struct SearchHistory {
    entries: VecDeque<HistoryEntry>,
    term_frequency: HashMap<String, u64>,
}

impl SearchHistory {
    pub fn add(&mut self, query: &str, result_count: usize) {
        if self.entries.len() == MAX_HISTORY {
            if let Some(evicted) = self.entries.pop_front() {
                self.forget_terms(&evicted.query);
            }
        }
        self.entries.push_back(HistoryEntry {
            query: query.to_string(),
            result_count,
            at: chrono::Utc::now().timestamp(),
        });
        for term in query.to_lowercase().split_whitespace() {
            *self.term_frequency.entry(term.to_string()).or_insert(0) += 1;
        }
    }

    fn forget_terms(&mut self, query: &str) {
        for term in query.to_lowercase().split_whitespace() {
            if let Some(count) = self.term_frequency.get_mut(term) {
                *count -= 1;
                if *count == 0 {
                    self.term_frequency.remove(term);
                }
            }
        }
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.term_frequency.clear();
    }

    /// Past queries starting with `partial` (newest first), then popular
    /// terms starting with it.
    pub fn suggestions(&self, partial: &str, limit: usize) -> Vec<String> {
        let partial = partial.trim().to_lowercase();
        if partial.is_empty() {
            return Vec::new();
        }
        let mut out: Vec<String> = Vec::new();
        for entry in self.entries.iter().rev() {
            if out.len() >= limit {
                return out;
            }
            if entry.query.to_lowercase().starts_with(&partial) && !out.contains(&entry.query) {
                out.push(entry.query.clone());
            }
        }

        let mut terms: Vec<(&String, &u64)> = self
            .term_frequency
            .iter()
            .filter(|(t, _)| t.starts_with(&partial))
            .collect();
        terms.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (term, _) in terms {
            if out.len() >= limit {
                break;
            }
            if !out.contains(term) {
                out.push(term.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    Markdown,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "md" | "markdown" => Ok(ExportFormat::Markdown),
            other => Err(format!("unknown export format: {}", other)),
        }
    }
}

pub struct ContextAssembler {
    search: Arc<HybridSearchEngine>,
    retrieval: RetrievalConfig,
    history: Mutex<SearchHistory>,
}

impl ContextAssembler {
    pub fn new(search: Arc<HybridSearchEngine>, retrieval: RetrievalConfig) -> Self {
        Self {
            search,
            retrieval,
            history: Mutex::new(SearchHistory::default()),
        }
    }

    /// Ranked context items for `query`, best first.
    ///
    /// Items scoring below `retrieval.min_context_score` are dropped. The
    /// query is recorded in the search history.
    pub async fn get_context(
        &self,
        query: &str,
        max_results: usize,
        filters: SearchFilters,
    ) -> Result<Vec<ContextItem>> {
        let cleaned = validate_query(query)?;
        let params = HybridParams {
            top_k: max_results,
            filters,
            ..HybridParams::from_config(&self.retrieval)
        };
        let results = self.search.hybrid_search(&cleaned, &params).await?;
        let min_score = self.retrieval.min_context_score;
        let items: Vec<ContextItem> = results
            .into_iter()
            .filter(|r| r.score >= min_score)
            .map(ContextItem::from)
            .collect();

        debug!(query = %cleaned, items = items.len(), "context assembled");
        self.history().add(&cleaned, items.len());
        Ok(items)
    }

    fn history(&self) -> std::sync::MutexGuard<'_, SearchHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn recent_queries(&self, limit: usize) -> Vec<HistoryEntry> {
        self.history().recent(limit)
    }

    pub fn clear_history(&self) {
        self.history().clear();
    }

    /// Up to five follow-up queries: history matches first, then `query`
    /// extended with frequent longer words from the top three items.
    pub fn suggestions(&self, query: &str, items: &[ContextItem]) -> Vec<String> {
        let mut out = self.history().suggestions(query, 3);
        let query_lower = query.to_lowercase();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for item in items.iter().take(3) {
            for word in item.content.to_lowercase().split_whitespace() {
                let word = word.trim_matches(|c: char| !c.is_alphanumeric());
                if word.chars().count() > 4 && !query_lower.contains(word) {
                    *counts.entry(word.to_string()).or_insert(0) += 1;
                }
            }
        }
        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        for (term, _) in ranked.into_iter().take(3) {
            let suggestion = format!("{} {}", query.trim(), term);
            if !out.contains(&suggestion) {
                out.push(suggestion);
            }
        }
        out.truncate(MAX_SUGGESTIONS);
        out
    }
}

/// Render items as a numbered context block for an LLM prompt.
pub fn format_for_prompt(items: &[ContextItem]) -> String {
    if items.is_empty() {
        return "No relevant context found.".to_string();
    }
    let mut out = String::from("Relevant context:\n");
    for (i, item) in items.iter().enumerate() {
        out.push_str(&format!(
            "\n[{}] {} (chunk {}, relevance {}, score {:.2})\n{}\n",
            i + 1,
            item.file_path.display(),
            item.chunk_index,
            item.relevance.as_str(),
            item.score,
            item.content.trim()
        ));
    }
    out
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("json export failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("csv export failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("csv export failed: {0}")]
    Io(#[from] std::io::Error),
}

pub fn export(items: &[ContextItem], format: ExportFormat) -> std::result::Result<String, ExportError> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(items)?),
        ExportFormat::Csv => export_csv(items),
        ExportFormat::Markdown => Ok(export_markdown(items)),
    }
}

/// One row per item with a header line; no output at all for no items.
fn export_csv(items: &[ContextItem]) -> std::result::Result<String, ExportError> {
    if items.is_empty() {
        return Ok(String::new());
    }
    let mut writer = csv::Writer::from_writer(Vec::new());
    for item in items {
        writer.serialize(item)?;
    }
    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    String::from_utf8(bytes)
        .map_err(|e| ExportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

fn export_markdown(items: &[ContextItem]) -> String {
    let mut out = String::from("# Search Results\n\n");
    out.push_str(&format!(
        "**Export Date:** {}\n",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
    ));
    out.push_str(&format!("**Total Results:** {}\n\n", items.len()));
    for (i, item) in items.iter().enumerate() {
        out.push_str(&format!("## Result {}\n\n", i + 1));
        out.push_str(&format!("**File:** `{}`\n", item.file_name));
        out.push_str(&format!("**Path:** `{}`\n", item.file_path.display()));
        out.push_str(&format!(
            "**Relevance:** {} ({:.1}%)\n",
            item.relevance.as_str(),
            item.score * 100.0
        ));
        out.push_str(&format!("**Type:** {}\n\n", item.file_type));
        out.push_str("### Content Preview\n\n");
        out.push_str(&format!("```\n{}\n```\n\n---\n\n", item.snippet));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(path: &str, score: f64, content: &str) -> ContextItem {
        ContextItem::from(SearchResult {
            chunk_id: format!("c-{}", path),
            file_id: format!("f-{}", path),
            file_path: PathBuf::from(path),
            chunk_index: 0,
            score,
            match_type: MatchType::Hybrid,
            snippet: content.chars().take(40).collect(),
            text: content.to_string(),
            file_type: "text".into(),
            modified_time: 0,
        })
    }

    #[test]
    fn relevance_buckets() {
        assert_eq!(Relevance::from_score(0.95), Relevance::Excellent);
        assert_eq!(Relevance::from_score(0.9), Relevance::Excellent);
        assert_eq!(Relevance::from_score(0.7), Relevance::Good);
        assert_eq!(Relevance::from_score(0.5), Relevance::Fair);
        assert_eq!(Relevance::from_score(0.49), Relevance::Weak);
    }

    #[test]
    fn history_is_bounded() {
        let mut history = SearchHistory::default();
        for i in 0..(MAX_HISTORY + 20) {
            history.add(&format!("query {}", i), i);
        }
        assert_eq!(history.len(), MAX_HISTORY);
        let recent = history.recent(2);
        assert_eq!(recent[0].query, format!("query {}", MAX_HISTORY + 19));
        assert_eq!(recent[1].result_count, MAX_HISTORY + 18);
    }

    #[test]
    fn suggestions_prefer_recent_queries_then_terms() {
        let mut history = SearchHistory::default();
        history.add("invoice total", 2);
        history.add("invoice due date", 1);
        history.add("indexing speed", 0);
        let s = history.suggestions("inv", 5);
        assert_eq!(s[0], "invoice due date");
        assert_eq!(s[1], "invoice total");
        assert_eq!(s[2], "invoice");
        assert!(history.suggestions("  ", 5).is_empty());
    }

    #[test]
    fn prompt_lists_items_in_order() {
        let items = vec![
            item("/docs/a.md", 0.92, "The invoice total is 42."),
            item("/docs/b.md", 0.4, "Payment terms."),
        ];
        let prompt = format_for_prompt(&items);
        let a = prompt.find("[1] /docs/a.md").unwrap();
        let b = prompt.find("[2] /docs/b.md").unwrap();
        assert!(a < b);
        assert!(prompt.contains("relevance Excellent"));
        assert!(prompt.contains("Payment terms."));
        assert_eq!(format_for_prompt(&[]), "No relevant context found.");
    }

    #[test]
    fn exports_json_and_markdown() {
        let items = vec![item("/docs/a.md", 0.75, "quarterly invoice summary")];
        let json = export(&items, ExportFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["file_name"], "a.md");
        assert_eq!(parsed[0]["relevance"], "Good");

        let md = export(&items, ExportFormat::Markdown).unwrap();
        assert!(md.contains("**Total Results:** 1"));
        assert!(md.contains("**Relevance:** Good (75.0%)"));
        assert!("markdown".parse::<ExportFormat>().is_ok());
        assert!("xml".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn csv_export_quotes_multiline_content() {
        let items = vec![
            item("/docs/a.md", 0.75, "line one\nline two, with comma"),
            item("/docs/b.md", 0.3, "plain"),
        ];
        let csv = export(&items, ExportFormat::Csv).unwrap();
        let mut reader = csv::Reader::from_reader(csv.as_bytes());
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "file_path");
        let content_col = headers.iter().position(|h| h == "content").unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][content_col], "line one\nline two, with comma");
        assert_eq!(&rows[1][0], "/docs/b.md");
        assert_eq!("csv".parse::<ExportFormat>(), Ok(ExportFormat::Csv));
        assert_eq!(export(&[], ExportFormat::Csv).unwrap(), "");
    }

    #[test]
    fn evicted_queries_stop_feeding_term_suggestions() {
        let mut history = SearchHistory::default();
        history.add("zebraterm first", 1);
        for i in 0..MAX_HISTORY {
            history.add(&format!("filler {}", i), 0);
        }
        assert_eq!(history.len(), MAX_HISTORY);
        assert!(history.suggestions("zebra", 5).is_empty());
        assert!(!history.term_frequency.contains_key("first"));
        assert_eq!(history.term_frequency.get("filler"), Some(&(MAX_HISTORY as u64)));
    }
}
