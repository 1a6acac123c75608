//! Document ingestion: parse, chunk, and store.
//!
//! Re-ingesting a path that already has a document is a replacement: the old
//! chunks and embeddings are deleted before the new chunks are written, so a
//! document's chunks always reflect exactly one version of the file. Failures
//! land on the document row as a `failed` status with the error message.

use std::path::Path;

use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::chunk::{self, ChunkOptions};
use crate::config::ChunkingConfig;
use crate::error::{Error, Result};
use crate::models::{Document, DocumentStatus, FileType, Project};
use crate::parser;
use crate::store;

#[derive(Debug)]
pub struct IngestOutcome {
    pub document: Document,
    pub chunk_count: usize,
    /// True when an existing document for the same path was replaced.
    pub replaced: bool,
}

#[derive(Debug, Default)]
pub struct ScanSummary {
    pub ingested: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Ingest a single file into a project.
pub async fn ingest_file(
    pool: &SqlitePool,
    chunking: &ChunkingConfig,
    project: &Project,
    path: &Path,
) -> Result<IngestOutcome> {
    if !path.is_file() {
        return Err(Error::Parse {
            path: path.display().to_string(),
            reason: "file does not exist".to_string(),
        });
    }
    if !parser::is_supported_file(path) {
        return Err(Error::Parse {
            path: path.display().to_string(),
            reason: "unsupported file type".to_string(),
        });
    }

    let file_path = path.display().to_string();
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(&file_path)
        .to_string();
    let file_type = parser::detect_file_type(path);

    let existing = store::find_document_by_path(pool, &project.id, &file_path).await?;
    let replaced = existing.is_some();

    let document = match existing {
        Some(doc) => {
            // Replacement: embeddings reference chunks by foreign key, so
            // they must go first.
            let embeddings = store::delete_embeddings_by_document(pool, &doc.id).await?;
            let chunks = store::delete_chunks_by_document(pool, &doc.id).await?;
            debug!(
                document_id = %doc.id,
                chunks, embeddings, "replacing existing document"
            );
            doc
        }
        None => {
            store::create_document(
                pool,
                &store::NewDocument {
                    project_id: &project.id,
                    name: &name,
                    file_path: &file_path,
                    file_type,
                },
            )
            .await?
        }
    };

    store::update_document_status(pool, &document.id, DocumentStatus::Processing, None).await?;

    match process(pool, chunking, project, &document, path, file_type).await {
        Ok(chunk_count) => {
            store::update_document_status(pool, &document.id, DocumentStatus::Completed, None)
                .await?;
            info!(
                document_id = %document.id,
                path = %file_path,
                chunk_count,
                replaced,
                "document ingested"
            );
            let document = store::get_document(pool, &document.id).await?;
            Ok(IngestOutcome {
                document,
                chunk_count,
                replaced,
            })
        }
        Err(e) => {
            store::update_document_status(
                pool,
                &document.id,
                DocumentStatus::Failed,
                Some(&e.to_string()),
            )
            .await?;
            Err(e)
        }
    }
}

async fn process(
    pool: &SqlitePool,
    chunking: &ChunkingConfig,
    project: &Project,
    document: &Document,
    path: &Path,
    file_type: FileType,
) -> Result<usize> {
    let parsed = parser::parse_file(path).await?;
    if parsed.text.trim().is_empty() {
        return Err(Error::Parse {
            path: path.display().to_string(),
            reason: "no text content extracted".to_string(),
        });
    }

    let opts = ChunkOptions {
        chunk_size: project.settings.chunk_size,
        chunk_overlap: project.settings.chunk_overlap,
        preserve_words: chunking.preserve_words,
    };
    let chunks = match file_type {
        FileType::Code => chunk::chunk_code(&parsed.text, &opts)?,
        _ => chunk::chunk_text(&parsed.text, &opts)?,
    };

    for (i, text_chunk) in chunks.iter().enumerate() {
        store::create_chunk(
            pool,
            &store::NewChunk {
                document_id: &document.id,
                chunk_index: i as i64,
                content: &text_chunk.content,
                start_char: Some(text_chunk.start_char as i64),
                end_char: Some(text_chunk.end_char as i64),
            },
        )
        .await?;
    }

    let mut meta = document.metadata.clone();
    meta.page_count = parsed.page_count;
    meta.chunk_count = Some(chunks.len());
    store::update_document_meta(pool, &document.id, &meta).await?;

    Ok(chunks.len())
}

/// Walk a directory and ingest every supported file. Hidden entries below
/// the root are pruned, subtrees included. One file's failure is logged and
/// counted, never fatal to the scan.
pub async fn ingest_directory(
    pool: &SqlitePool,
    chunking: &ChunkingConfig,
    project: &Project,
    root: &Path,
    max_depth: usize,
) -> Result<ScanSummary> {
    let mut summary = ScanSummary::default();

    for entry in WalkDir::new(root)
        .max_depth(max_depth)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !parser::is_hidden_name(e.file_name()))
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !parser::is_supported_file(path) {
            summary.skipped += 1;
            continue;
        }
        match ingest_file(pool, chunking, project, path).await {
            Ok(_) => summary.ingested += 1,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to ingest file");
                summary.failed += 1;
            }
        }
    }

    info!(
        root = %root.display(),
        ingested = summary.ingested,
        failed = summary.failed,
        skipped = summary.skipped,
        "directory scan finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProjectSettings;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        pool
    }

    fn chunking() -> ChunkingConfig {
        ChunkingConfig::default()
    }

    async fn small_project(pool: &SqlitePool) -> Project {
        store::create_project(
            pool,
            "demo",
            None,
            &ProjectSettings {
                chunk_size: 50,
                chunk_overlap: 10,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn ingests_a_text_file() {
        let pool = test_pool().await;
        let project = small_project(&pool).await;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("notes.txt");
        std::fs::write(&path, "word ".repeat(60)).unwrap();

        let outcome = ingest_file(&pool, &chunking(), &project, &path)
            .await
            .unwrap();
        assert!(!outcome.replaced);
        assert!(outcome.chunk_count > 1);
        assert_eq!(outcome.document.status, DocumentStatus::Completed);
        assert_eq!(outcome.document.metadata.chunk_count, Some(outcome.chunk_count));

        let chunks = store::list_chunks_by_document(&pool, &outcome.document.id)
            .await
            .unwrap();
        assert_eq!(chunks.len(), outcome.chunk_count);
    }

    #[tokio::test]
    async fn reingest_replaces_chunks_not_document() {
        let pool = test_pool().await;
        let project = small_project(&pool).await;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("notes.txt");
        std::fs::write(&path, "word ".repeat(60)).unwrap();

        let first = ingest_file(&pool, &chunking(), &project, &path)
            .await
            .unwrap();

        std::fs::write(&path, "fresh content").unwrap();
        let second = ingest_file(&pool, &chunking(), &project, &path)
            .await
            .unwrap();

        assert!(second.replaced);
        assert_eq!(second.document.id, first.document.id);
        assert_eq!(second.chunk_count, 1);
        let chunks = store::list_chunks_by_document(&pool, &second.document.id)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "fresh content");
    }

    #[tokio::test]
    async fn reingest_of_embedded_document_succeeds() {
        let pool = test_pool().await;
        let project = small_project(&pool).await;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("notes.txt");
        std::fs::write(&path, "word ".repeat(60)).unwrap();

        let first = ingest_file(&pool, &chunking(), &project, &path)
            .await
            .unwrap();

        // Embed one chunk so the replacement has to delete a row that
        // references a chunk by foreign key.
        let chunks = store::list_chunks_by_document(&pool, &first.document.id)
            .await
            .unwrap();
        store::create_embedding(
            &pool,
            &crate::models::EmbeddingRecord {
                chunk_id: chunks[0].id.clone(),
                document_id: first.document.id.clone(),
                model: "test".to_string(),
                dimension: 3,
                vector: vec![0.1, 0.2, 0.3],
            },
        )
        .await
        .unwrap();

        std::fs::write(&path, "replacement text").unwrap();
        let second = ingest_file(&pool, &chunking(), &project, &path)
            .await
            .unwrap();
        assert!(second.replaced);

        let pending = store::chunks_without_embeddings(&pool, &second.document.id)
            .await
            .unwrap();
        assert_eq!(pending.len(), second.chunk_count);
    }

    #[tokio::test]
    async fn empty_file_fails_the_document() {
        let pool = test_pool().await;
        let project = small_project(&pool).await;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("empty.txt");
        std::fs::write(&path, "   \n").unwrap();

        let err = ingest_file(&pool, &chunking(), &project, &path)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));

        let doc = store::find_document_by_path(&pool, &project.id, &path.display().to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert!(doc.error_message.unwrap().contains("no text content"));
    }

    #[tokio::test]
    async fn unsupported_file_is_rejected() {
        let pool = test_pool().await;
        let project = small_project(&pool).await;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("archive.zip");
        std::fs::write(&path, b"PK").unwrap();

        let err = ingest_file(&pool, &chunking(), &project, &path)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[tokio::test]
    async fn code_files_use_code_chunking() {
        let pool = test_pool().await;
        let project = small_project(&pool).await;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lib.rs");
        let mut code = String::new();
        for i in 0..10 {
            code.push_str(&format!("fn helper_{}() {{\n    let x = {};\n}}\n", i, i));
        }
        std::fs::write(&path, &code).unwrap();

        let outcome = ingest_file(&pool, &chunking(), &project, &path)
            .await
            .unwrap();
        assert_eq!(outcome.document.file_type, FileType::Code);
        assert!(outcome.chunk_count >= 2);
    }

    #[tokio::test]
    async fn directory_scan_counts_outcomes() {
        let pool = test_pool().await;
        let project = small_project(&pool).await;
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "alpha beta gamma").unwrap();
        std::fs::write(tmp.path().join("b.md"), "# heading\nbody").unwrap();
        std::fs::write(tmp.path().join("c.zip"), b"PK").unwrap();
        std::fs::write(tmp.path().join(".hidden.txt"), "secret").unwrap();
        std::fs::create_dir(tmp.path().join(".cache")).unwrap();
        std::fs::write(tmp.path().join(".cache/notes.txt"), "also secret").unwrap();

        let summary = ingest_directory(&pool, &chunking(), &project, tmp.path(), 10)
            .await
            .unwrap();
        // Hidden entries are pruned by the walk, not counted as skipped.
        assert_eq!(summary.ingested, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);

        let documents = store::list_documents_by_project(&pool, &project.id)
            .await
            .unwrap();
        assert!(documents
            .iter()
            .all(|d| !d.file_path.contains("/.cache/") && !d.file_path.contains(".hidden")));
    }
}
