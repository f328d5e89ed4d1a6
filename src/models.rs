//! Core data models used throughout the index.
//!
//! These types represent the files, chunks, embeddings, and search results
//! that flow through the indexing and retrieval pipeline.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;

/// Processing state of an indexed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Succeeded,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Succeeded => "succeeded",
            FileStatus::Failed => "failed",
        }
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FileStatus::Pending),
            "succeeded" => Ok(FileStatus::Succeeded),
            "failed" => Ok(FileStatus::Failed),
            other => Err(format!("unknown file status: {}", other)),
        }
    }
}

/// One record per canonical path.
#[derive(Debug, Clone, Serialize)]
pub struct IndexedFile {
    pub file_id: String,
    pub path: PathBuf,
    /// SHA-256 of the file bytes, lowercase hex.
    pub content_hash: String,
    pub size: u64,
    /// Unix seconds.
    pub modified_time: i64,
    pub file_type: String,
    pub status: FileStatus,
    pub last_indexed_at: Option<i64>,
    pub failure_reason: Option<String>,
    /// Extractor metadata, JSON object.
    pub metadata_json: String,
    /// Model that produced the committed embeddings.
    pub model_id: Option<String>,
}

/// Input for [`IndexStore::add_file`](crate::store::IndexStore::add_file).
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: PathBuf,
    pub content_hash: String,
    pub size: u64,
    pub modified_time: i64,
    pub file_type: String,
}

/// How a chunk boundary was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Text,
    Paragraph,
    Sentence,
    Code,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Text => "text",
            ChunkType::Paragraph => "paragraph",
            ChunkType::Sentence => "sentence",
            ChunkType::Code => "code",
        }
    }
}

impl FromStr for ChunkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(ChunkType::Text),
            "paragraph" => Ok(ChunkType::Paragraph),
            "sentence" => Ok(ChunkType::Sentence),
            "code" => Ok(ChunkType::Code),
            other => Err(format!("unknown chunk type: {}", other)),
        }
    }
}

/// A bounded span of a file's extracted text.
///
/// Offsets are character offsets into the extracted text, `end_offset`
/// exclusive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub file_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub chunk_type: ChunkType,
}

/// Embedding vector owned by exactly one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub embedding_id: String,
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub model_id: String,
}

/// Which retrieval channel produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Vector,
    Keyword,
    Hybrid,
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MatchType::Vector => "vector",
            MatchType::Keyword => "keyword",
            MatchType::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

/// A ranked search hit. Transient, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub file_id: String,
    pub file_path: PathBuf,
    pub chunk_index: i64,
    pub score: f64,
    pub match_type: MatchType,
    pub snippet: String,
    /// Full chunk text; used by reranking and context assembly.
    #[serde(skip)]
    pub text: String,
    pub file_type: String,
    pub modified_time: i64,
}

/// Restricts which chunks a search or scan considers. Empty fields do not
/// filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    /// File type labels (`"markdown"`, `"rust"`, ...).
    pub file_types: Vec<String>,
    /// Only files whose canonical path starts with this prefix.
    pub path_prefix: Option<PathBuf>,
    pub file_ids: Vec<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.file_types.is_empty() && self.path_prefix.is_none() && self.file_ids.is_empty()
    }
}
