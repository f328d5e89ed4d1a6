//! Index statistics and health overview.
//!
//! Summarizes what is indexed: file, chunk and embedding counts, failures,
//! the active embedding model and a per-file-type breakdown. Used by
//! `ragx stats` and by [`RagEngine::index_statistics`](crate::engine::RagEngine::index_statistics).

use std::path::Path;

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub file_count: i64,
    pub chunk_count: i64,
    pub embedding_count: i64,
    pub failed_count: i64,
    pub pending_count: i64,
    /// Model that produced most stored embeddings.
    pub embedding_model_id: Option<String>,
    /// Unix seconds of the most recent successful commit.
    pub last_indexed_at: Option<i64>,
    /// Sum of indexed file sizes.
    pub total_bytes: i64,
    pub files_by_type: Vec<(String, i64)>,
}

/// Human-readable report, as printed by `ragx stats`.
pub fn render(stats: &IndexStats, db_path: &Path) -> String {
    let db_size = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);
    let mut out = String::new();

    out.push_str("RAG Index Stats\n");
    out.push_str("===============\n\n");
    out.push_str(&format!("  Database:    {}\n", db_path.display()));
    out.push_str(&format!("  Size:        {}\n\n", format_bytes(db_size)));
    out.push_str(&format!(
        "  Files:       {} ({} indexed)\n",
        stats.file_count,
        format_bytes(stats.total_bytes.max(0) as u64)
    ));
    out.push_str(&format!("  Failed:      {}\n", stats.failed_count));
    out.push_str(&format!("  Pending:     {}\n", stats.pending_count));
    out.push_str(&format!("  Chunks:      {}\n", stats.chunk_count));
    out.push_str(&format!(
        "  Embedded:    {} / {} ({}%)\n",
        stats.embedding_count,
        stats.chunk_count,
        if stats.chunk_count > 0 {
            (stats.embedding_count * 100) / stats.chunk_count
        } else {
            0
        }
    ));
    out.push_str(&format!(
        "  Model:       {}\n",
        stats.embedding_model_id.as_deref().unwrap_or("none")
    ));
    out.push_str(&format!(
        "  Last index:  {}\n",
        stats
            .last_indexed_at
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    ));

    if !stats.files_by_type.is_empty() {
        out.push_str("\n  By type:\n");
        out.push_str(&format!("  {:<24} {:>6}\n", "TYPE", "FILES"));
        out.push_str(&format!("  {}\n", "-".repeat(31)));
        for (file_type, n) in &stats.files_by_type {
            out.push_str(&format!("  {:<24} {:>6}\n", file_type, n));
        }
    }
    out
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
