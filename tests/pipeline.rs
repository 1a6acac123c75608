//! End-to-end pipeline tests against a mock embedding service.

use std::path::Path;

use httpmock::prelude::*;
use tempfile::TempDir;

use docdex::config::{ChunkingConfig, Config, DbConfig, EmbeddingConfig, IndexConfig, WatcherConfig};
use docdex::error::Error;
use docdex::models::{DocumentStatus, EmbeddingStatus, FileType, ProjectSettings};
use docdex::service::Services;
use docdex::store;

const DIMENSION: usize = 3;

fn test_config(root: &Path, base_url: &str) -> Config {
    Config {
        db: DbConfig {
            path: root.join("data/docdex.sqlite"),
        },
        index: IndexConfig {
            dir: root.join("data/index"),
            initial_capacity: 100,
        },
        embedding: EmbeddingConfig {
            base_url: base_url.to_string(),
            model: "nomic-embed-text".to_string(),
            dimension: DIMENSION,
            timeout_secs: 5,
            max_text_chars: 8192,
        },
        chunking: ChunkingConfig {
            chunk_size: 80,
            chunk_overlap: 10,
            preserve_words: true,
        },
        watcher: WatcherConfig::default(),
    }
}

/// Mock endpoint that answers every embed request with one fixed unit
/// vector. The client issues one request per text, so a constant body works
/// for batches of any size.
async fn mock_embed_server() -> MockServer {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/embed");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"embeddings": [[0.6, 0.48, 0.64]]}"#);
        })
        .await;
    server
}

#[tokio::test]
async fn ingest_embed_and_search() {
    let server = mock_embed_server().await;
    let tmp = TempDir::new().unwrap();
    let (services, _events) = Services::new(test_config(tmp.path(), &server.base_url()))
        .await
        .unwrap();

    let project = services
        .create_project("docs", None, &ProjectSettings {
            chunk_size: 80,
            chunk_overlap: 10,
        })
        .await
        .unwrap();

    let file = tmp.path().join("guide.txt");
    std::fs::write(
        &file,
        "Deployment guide. ".repeat(20) + "Rollback instructions follow the deployment steps.",
    )
    .unwrap();

    let summary = services.ingest_path(&project.id, &file).await.unwrap();
    assert_eq!(summary.ingested, 1);

    // Ingestion hands off to the embedding orchestrator on its own.
    services.wait_for_background_jobs().await;

    let documents = services.list_documents(&project.id).await.unwrap();
    assert_eq!(documents.len(), 1);
    let document = &documents[0];
    assert_eq!(document.status, DocumentStatus::Completed);
    let chunk_count = document.metadata.chunk_count.unwrap();
    assert!(chunk_count > 1);

    let pending = store::chunks_without_embeddings(&services.pool, &document.id)
        .await
        .unwrap();
    assert!(pending.is_empty());

    // Everything is embedded already, so a second request is a zero report.
    let report = services
        .embed_document(&document.id)
        .await
        .unwrap()
        .expect("job should not be skipped");
    assert_eq!(report.total, 0);
    assert_eq!(report.status, EmbeddingStatus::Completed);

    // Terminal progress is visible until the cleanup delay elapses.
    let progress = services.embedding_progress(&document.id).unwrap();
    assert_eq!(progress.status, EmbeddingStatus::Completed);
    assert_eq!(progress.percentage, 100);
    assert!(progress.finished_at.is_some());

    let stats = services.index_stats(&project.id).await.unwrap();
    assert_eq!(stats.element_count, chunk_count);
    assert_eq!(stats.dimension, DIMENSION);

    let results = services.search(&project.id, "deployment", 3).await.unwrap();
    assert_eq!(results.len(), 3);
    for result in &results {
        assert!(!result.content.is_empty());
        assert_eq!(result.document_id, document.id);
    }

    services.shutdown().await;
}

#[tokio::test]
async fn reingest_resets_embeddings() {
    let server = mock_embed_server().await;
    let tmp = TempDir::new().unwrap();
    let (services, _events) = Services::new(test_config(tmp.path(), &server.base_url()))
        .await
        .unwrap();

    let project = services
        .create_project("docs", None, &ProjectSettings::default())
        .await
        .unwrap();

    // Ingest and embed synchronously so the replacement below is the only
    // thing touching the embeddings table.
    let file = tmp.path().join("note.txt");
    std::fs::write(&file, "original content").unwrap();
    services.ingest_file(&project, &file).await.unwrap();

    let document = &services.list_documents(&project.id).await.unwrap()[0];
    services.embed_document(&document.id).await.unwrap();

    let before = store::all_embeddings_by_project(&services.pool, &project.id)
        .await
        .unwrap();
    assert_eq!(before.len(), 1);

    // Replacing the file discards the old chunks and their embeddings.
    std::fs::write(&file, "rewritten content").unwrap();
    services.ingest_file(&project, &file).await.unwrap();

    let after = store::all_embeddings_by_project(&services.pool, &project.id)
        .await
        .unwrap();
    assert!(after.is_empty());

    let chunks = store::chunks_without_embeddings_by_project(&services.pool, &project.id)
        .await
        .unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].content, "rewritten content");

    services.shutdown().await;
}

#[tokio::test]
async fn rebuild_restores_search_from_store() {
    let server = mock_embed_server().await;
    let tmp = TempDir::new().unwrap();
    let (services, _events) = Services::new(test_config(tmp.path(), &server.base_url()))
        .await
        .unwrap();

    let project = services
        .create_project("docs", None, &ProjectSettings::default())
        .await
        .unwrap();

    let file = tmp.path().join("note.md");
    std::fs::write(&file, "# Incident runbook\n\nRestart the service, then check logs.").unwrap();
    services.ingest_path(&project.id, &file).await.unwrap();
    services.wait_for_background_jobs().await;

    let indexed = services.rebuild_index(&project.id).await.unwrap();
    assert_eq!(indexed, 1);

    let results = services.search(&project.id, "runbook", 5).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].content.contains("Incident runbook"));

    services.shutdown().await;
}

#[tokio::test]
async fn degraded_mode_keeps_chunks_without_embeddings() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/embed");
            then.status(500).body("service down");
        })
        .await;

    let tmp = TempDir::new().unwrap();
    let (services, _events) = Services::new(test_config(tmp.path(), &server.base_url()))
        .await
        .unwrap();

    let project = services
        .create_project("docs", None, &ProjectSettings::default())
        .await
        .unwrap();

    // Ingestion never touches the embedding service; the automatic
    // embedding hand-off fails without affecting the stored chunks.
    let file = tmp.path().join("note.txt");
    std::fs::write(&file, "content that survives an embedding outage").unwrap();
    services.ingest_path(&project.id, &file).await.unwrap();
    services.wait_for_background_jobs().await;

    let document = &services.list_documents(&project.id).await.unwrap()[0];
    assert_eq!(document.status, DocumentStatus::Completed);

    let report = services
        .embed_document(&document.id)
        .await
        .unwrap()
        .expect("job should run");
    assert_eq!(report.completed, 0);
    assert_eq!(report.failed, report.total);
    assert_eq!(report.status, EmbeddingStatus::Failed);

    let document = &services.list_documents(&project.id).await.unwrap()[0];
    assert_eq!(
        document.metadata.embedding_status,
        Some(EmbeddingStatus::Failed)
    );
    assert!(document.metadata.embedding_error.is_some());

    // The chunks are still there, ready for a retry once the service is back.
    let pending = store::chunks_without_embeddings(&services.pool, &document.id)
        .await
        .unwrap();
    assert_eq!(pending.len(), report.total);

    let health = services.health().await;
    assert!(!health.healthy);

    services.shutdown().await;
}

#[tokio::test]
async fn one_failing_text_does_not_stop_the_other_batches() {
    let server = mock_embed_server().await;
    let tmp = TempDir::new().unwrap();
    let (services, _events) = Services::new(test_config(tmp.path(), &server.base_url()))
        .await
        .unwrap();

    let project = services
        .create_project("docs", None, &ProjectSettings::default())
        .await
        .unwrap();

    let document = store::create_document(
        &services.pool,
        &store::NewDocument {
            project_id: &project.id,
            name: "big.txt",
            file_path: "/virtual/big.txt",
            file_type: FileType::Text,
        },
    )
    .await
    .unwrap();

    // 16 chunks span two batches. The first chunk blows the configured text
    // limit, so exactly one text fails while every other one embeds.
    for i in 0..16i64 {
        let content = if i == 0 {
            "x".repeat(9000)
        } else {
            format!("chunk number {}", i)
        };
        store::create_chunk(
            &services.pool,
            &store::NewChunk {
                document_id: &document.id,
                chunk_index: i,
                content: &content,
                start_char: None,
                end_char: None,
            },
        )
        .await
        .unwrap();
    }

    let report = services
        .embed_document(&document.id)
        .await
        .unwrap()
        .expect("job should run");
    assert_eq!(report.total, 16);
    assert_eq!(report.completed, 15);
    assert_eq!(report.failed, 1);
    assert_eq!(report.status, EmbeddingStatus::Completed);

    let pending = store::chunks_without_embeddings(&services.pool, &document.id)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].chunk_index, 0);

    let stats = services.index_stats(&project.id).await.unwrap();
    assert_eq!(stats.element_count, 15);

    let progress = services.embedding_progress(&document.id).unwrap();
    assert_eq!(progress.percentage, 94);
    assert_eq!(progress.status, EmbeddingStatus::Completed);

    services.shutdown().await;
}

#[tokio::test]
async fn spawned_ingest_runs_the_full_pipeline() {
    let server = mock_embed_server().await;
    let tmp = TempDir::new().unwrap();
    let (services, _events) = Services::new(test_config(tmp.path(), &server.base_url()))
        .await
        .unwrap();

    let project = services
        .create_project("docs", None, &ProjectSettings::default())
        .await
        .unwrap();

    let file = tmp.path().join("dropped.txt");
    std::fs::write(&file, "a file handed off to a background task").unwrap();

    services.spawn_ingest(project.clone(), file);
    services.wait_for_background_jobs().await;

    let document = &services.list_documents(&project.id).await.unwrap()[0];
    assert_eq!(document.status, DocumentStatus::Completed);
    assert_eq!(
        document.metadata.embedding_status,
        Some(EmbeddingStatus::Completed)
    );

    services.shutdown().await;
}

#[tokio::test]
async fn search_unknown_project_is_not_found() {
    let server = mock_embed_server().await;
    let tmp = TempDir::new().unwrap();
    let (services, _events) = Services::new(test_config(tmp.path(), &server.base_url()))
        .await
        .unwrap();

    let err = services.search("ghost", "anything", 5).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    services.shutdown().await;
}
