//! Core data models used throughout docdex.
//!
//! These types represent the projects, documents, chunks, and embeddings that
//! flow through the ingestion and indexing pipeline. Document metadata is a
//! typed struct rather than an open map so the embedding sub-states are
//! checked at compile time.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> DocumentStatus {
        match s {
            "processing" => DocumentStatus::Processing,
            "completed" => DocumentStatus::Completed,
            "failed" => DocumentStatus::Failed,
            _ => DocumentStatus::Pending,
        }
    }
}

/// Broad file category driving parser and chunker selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Code,
    Markdown,
    Text,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Code => "code",
            FileType::Markdown => "markdown",
            FileType::Text => "text",
        }
    }

    pub fn parse(s: &str) -> FileType {
        match s {
            "pdf" => FileType::Pdf,
            "code" => FileType::Code,
            "markdown" => FileType::Markdown,
            _ => FileType::Text,
        }
    }
}

/// Sub-state of embedding generation, mirrored into document metadata so it
/// stays visible after the ephemeral progress record is cleaned up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStatus {
    Processing,
    Completed,
    Failed,
}

/// Counters mirrored into document metadata while embeddings are generated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingCounts {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Typed document metadata. Absent fields are omitted from the stored JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_status: Option<EmbeddingStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_progress: Option<EmbeddingCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_error: Option<String>,
}

/// A document tracked for a project.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub file_path: String,
    pub file_type: FileType,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
    pub metadata: DocumentMeta,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A contiguous slice of a document's extracted text, the unit of embedding
/// and retrieval. Chunks are replaced wholesale on every re-ingestion.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub start_char: Option<i64>,
    pub end_char: Option<i64>,
}

/// A stored embedding vector. At most one per chunk.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub model: String,
    pub dimension: usize,
    pub vector: Vec<f32>,
}

/// Per-project chunking settings, stored as JSON on the project row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

/// A project owning documents and one vector index.
#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub root_path: Option<String>,
    pub settings: ProjectSettings,
    pub created_at: i64,
}

/// One nearest-neighbor match from the vector index.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub distance: f32,
}

/// Snapshot of a project's vector index.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub project_id: String,
    pub dimension: usize,
    pub space: &'static str,
    pub m: usize,
    pub ef_construction: usize,
    pub element_count: usize,
    pub max_elements: usize,
}
