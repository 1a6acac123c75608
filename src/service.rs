//! Service wiring and pipeline operations.
//!
//! [`Services`] owns every long-lived component (database pool, embedding
//! client, vector indexes, progress tracker, job guards, watchers) and is
//! constructed explicitly at startup rather than assembled ad hoc by each
//! command. Background work reports failures on a bounded event channel so
//! callers can observe them instead of scraping logs.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embed_jobs::{self, EmbedJobs, EmbedReport};
use crate::embedding::{EmbeddingClient, ServiceHealth};
use crate::error::{Error, Result};
use crate::ingest::{self, IngestOutcome, ScanSummary};
use crate::models::{Document, EmbeddingStatus, IndexStats, Project, ProjectSettings};
use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::store;
use crate::vector_index::VectorIndexManager;
use crate::watcher::{WatchEvent, WatchEventKind, WatcherManager};
use crate::{db, migrate};

/// Capacity of the pipeline event channel. Events beyond a stalled
/// consumer's backlog are dropped with a log line, never block the pipeline.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Failures surfaced from background pipeline work.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    IngestFailed {
        project_id: String,
        path: String,
        error: String,
    },
    EmbeddingFailed {
        document_id: String,
        error: String,
    },
    ProjectEmbeddingFailed {
        project_id: String,
        error: String,
    },
}

/// One search hit joined with its stored chunk.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub distance: f32,
}

pub struct Services {
    pub pool: SqlitePool,
    pub config: Config,
    pub embedding: EmbeddingClient,
    pub index: VectorIndexManager,
    pub progress: ProgressTracker,
    jobs: EmbedJobs,
    watchers: WatcherManager,
    events: mpsc::Sender<PipelineEvent>,
    background: Mutex<Vec<JoinHandle<()>>>,
    /// Handed to spawned tasks; upgrading fails only during teardown, at
    /// which point the task has nothing left to do.
    weak: Weak<Services>,
}

impl Services {
    /// Build every component from config, connect the database, and run
    /// migrations. Returns the receiving end of the pipeline event channel
    /// alongside the services.
    pub async fn new(config: Config) -> Result<(Arc<Self>, mpsc::Receiver<PipelineEvent>)> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;

        let embedding = EmbeddingClient::new(&config.embedding)?;
        let index = VectorIndexManager::new(&config.index, config.embedding.dimension);
        let watchers = WatcherManager::new(config.watcher.clone());
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let services = Arc::new_cyclic(|weak| Self {
            pool,
            config,
            embedding,
            index,
            progress: ProgressTracker::new(),
            jobs: EmbedJobs::new(),
            watchers,
            events,
            background: Mutex::new(Vec::new()),
            weak: weak.clone(),
        });
        Ok((services, events_rx))
    }

    fn emit(&self, event: PipelineEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!(error = %e, "pipeline event dropped");
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut jobs = self.background.lock().unwrap_or_else(|e| e.into_inner());
        jobs.retain(|h| !h.is_finished());
        jobs.push(handle);
    }

    /// Wait for every spawned ingest and embedding task to finish. Loops in
    /// case a running task spawns another.
    pub async fn wait_for_background_jobs(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut jobs = self.background.lock().unwrap_or_else(|e| e.into_inner());
                jobs.drain(..).collect()
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    // ---- projects ----

    pub async fn create_project(
        &self,
        name: &str,
        root_path: Option<&str>,
        settings: &ProjectSettings,
    ) -> Result<Project> {
        if settings.chunk_overlap >= settings.chunk_size {
            return Err(Error::Configuration(
                "chunk_overlap must be in [0, chunk_size)".to_string(),
            ));
        }
        store::create_project(&self.pool, name, root_path, settings).await
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Project> {
        store::get_project(&self.pool, project_id).await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        store::list_projects(&self.pool).await
    }

    pub async fn list_documents(&self, project_id: &str) -> Result<Vec<Document>> {
        store::list_documents_by_project(&self.pool, project_id).await
    }

    // ---- ingestion ----

    /// Ingest a file or, when the path is a directory, every supported file
    /// under it. Ingestion ends by handing the pending chunks off to the
    /// embedding orchestrator as a background task.
    pub async fn ingest_path(&self, project_id: &str, path: &Path) -> Result<ScanSummary> {
        let project = store::get_project(&self.pool, project_id).await?;

        if path.is_dir() {
            let summary = ingest::ingest_directory(
                &self.pool,
                &self.config.chunking,
                &project,
                path,
                self.config.watcher.max_depth,
            )
            .await?;
            if summary.ingested > 0 {
                self.spawn_embed_project(project.id.clone());
            }
            return Ok(summary);
        }

        let outcome = self.ingest_file(&project, path).await?;
        self.spawn_embed_document(outcome.document.id);
        Ok(ScanSummary {
            ingested: 1,
            ..Default::default()
        })
    }

    /// Re-ingest an existing document from its recorded file path, then hand
    /// its fresh chunks off to the embedding orchestrator.
    pub async fn ingest_document(&self, document_id: &str) -> Result<IngestOutcome> {
        let document = store::get_document(&self.pool, document_id).await?;
        let project = store::get_project(&self.pool, &document.project_id).await?;
        let outcome = self
            .ingest_file(&project, Path::new(&document.file_path))
            .await?;
        self.spawn_embed_document(outcome.document.id.clone());
        Ok(outcome)
    }

    pub async fn ingest_file(&self, project: &Project, path: &Path) -> Result<IngestOutcome> {
        match ingest::ingest_file(&self.pool, &self.config.chunking, project, path).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.emit(PipelineEvent::IngestFailed {
                    project_id: project.id.clone(),
                    path: path.display().to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    // ---- embeddings ----

    /// Embed a document's pending chunks. `None` means a job for this
    /// document was already running.
    pub async fn embed_document(&self, document_id: &str) -> Result<Option<EmbedReport>> {
        let report = self
            .jobs
            .embed_document(
                &self.pool,
                &self.embedding,
                &self.index,
                &self.progress,
                document_id,
            )
            .await?;

        if let Some(report) = &report {
            if report.status == EmbeddingStatus::Failed {
                self.emit(PipelineEvent::EmbeddingFailed {
                    document_id: document_id.to_string(),
                    error: format!("{} of {} chunks failed", report.failed, report.total),
                });
            }
        }
        Ok(report)
    }

    /// Embed every pending chunk across a project.
    pub async fn embed_project(&self, project_id: &str) -> Result<Option<EmbedReport>> {
        let report = self
            .jobs
            .embed_project(&self.pool, &self.embedding, &self.index, project_id)
            .await?;

        if let Some(report) = &report {
            if report.status == EmbeddingStatus::Failed {
                self.emit(PipelineEvent::ProjectEmbeddingFailed {
                    project_id: project_id.to_string(),
                    error: format!("{} of {} chunks failed", report.failed, report.total),
                });
            }
        }
        Ok(report)
    }

    /// Hand a document off to the embedding orchestrator without waiting.
    /// Failures land on the pipeline event channel.
    fn spawn_embed_document(&self, document_id: String) {
        let weak = self.weak.clone();
        let handle = tokio::spawn(async move {
            let Some(services) = weak.upgrade() else { return };
            if let Err(e) = services.embed_document(&document_id).await {
                services.emit(PipelineEvent::EmbeddingFailed {
                    document_id,
                    error: e.to_string(),
                });
            }
        });
        self.track(handle);
    }

    fn spawn_embed_project(&self, project_id: String) {
        let weak = self.weak.clone();
        let handle = tokio::spawn(async move {
            let Some(services) = weak.upgrade() else { return };
            if let Err(e) = services.embed_project(&project_id).await {
                services.emit(PipelineEvent::ProjectEmbeddingFailed {
                    project_id,
                    error: e.to_string(),
                });
            }
        });
        self.track(handle);
    }

    pub fn embedding_progress(&self, document_id: &str) -> Option<ProgressSnapshot> {
        self.progress.get(document_id)
    }

    pub fn is_embedding_in_progress(&self, document_id: &str) -> bool {
        self.jobs.is_in_flight(document_id)
    }

    /// Drop every in-memory and on-disk vector index. Returns how many
    /// loaded indexes were dropped.
    pub async fn clear_all_indexes(&self) -> Result<usize> {
        self.index.clear_all().await
    }

    /// Rebuild a project's ANN index from stored embeddings. Returns the
    /// number of vectors indexed.
    pub async fn rebuild_index(&self, project_id: &str) -> Result<usize> {
        store::get_project(&self.pool, project_id).await?;
        embed_jobs::rebuild_index_from_store(&self.pool, &self.index, project_id).await
    }

    // ---- search ----

    pub async fn search(
        &self,
        project_id: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<SearchResult>> {
        store::get_project(&self.pool, project_id).await?;
        let vector = self.embedding.embed(query).await?;
        let hits = self.index.search(project_id, &vector, k).await?;

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let (document_id, content) = match store::get_chunk(&self.pool, &hit.chunk_id).await? {
                Some(chunk) => (chunk.document_id, chunk.content),
                // Index entry with no chunk row: stale index, rebuild fixes it.
                None => (String::new(), String::new()),
            };
            results.push(SearchResult {
                chunk_id: hit.chunk_id,
                document_id,
                content,
                distance: hit.distance,
            });
        }
        Ok(results)
    }

    pub async fn index_stats(&self, project_id: &str) -> Result<IndexStats> {
        store::get_project(&self.pool, project_id).await?;
        self.index.stats(project_id).await
    }

    pub async fn health(&self) -> ServiceHealth {
        self.embedding.health_check().await
    }

    // ---- watching ----

    /// Watch a directory and auto-ingest settled file events into the
    /// project. Falls back to the project's root_path when no path is
    /// given; replaces any existing watch for the project.
    pub async fn watch_project(&self, project_id: &str, path: Option<&Path>) -> Result<()> {
        let project = store::get_project(&self.pool, project_id).await?;
        let root = match path {
            Some(path) => path.display().to_string(),
            None => project.root_path.clone().ok_or_else(|| {
                Error::Configuration(format!("project {} has no root_path to watch", project.id))
            })?,
        };

        let (tx, mut rx) = mpsc::channel::<WatchEvent>(64);
        self.watchers
            .watch_project(&project.id, Path::new(&root), tx)
            .await?;

        let weak = self.weak.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(services) = weak.upgrade() else { return };
                match services.watch_event_needs_ingest(&project.id, &event).await {
                    Ok(true) => {
                        info!(path = %event.path.display(), "watch event, ingesting");
                        services.spawn_ingest(project.clone(), event.path);
                    }
                    Ok(false) => {
                        debug!(path = %event.path.display(), "path already tracked, skipping");
                    }
                    Err(e) => {
                        warn!(path = %event.path.display(), error = %e, "watch event lookup failed");
                    }
                }
            }
        });
        Ok(())
    }

    /// An added path that a document already tracks is skipped (initial
    /// scans and create events replay paths the project knows about);
    /// changes and untracked adds are ingested.
    pub async fn watch_event_needs_ingest(
        &self,
        project_id: &str,
        event: &WatchEvent,
    ) -> Result<bool> {
        if event.kind == WatchEventKind::Changed {
            return Ok(true);
        }
        let existing =
            store::find_document_by_path(&self.pool, project_id, &event.path.display().to_string())
                .await?;
        Ok(existing.is_none())
    }

    /// Ingest a file and then embed it, as a detached task. Failures are
    /// reported on the pipeline event channel instead of being awaited.
    pub fn spawn_ingest(&self, project: Project, path: PathBuf) {
        let weak = self.weak.clone();
        let handle = tokio::spawn(async move {
            let Some(services) = weak.upgrade() else { return };
            match services.ingest_file(&project, &path).await {
                Ok(outcome) => services.spawn_embed_document(outcome.document.id),
                // ingest_file already emitted the event.
                Err(_) => {}
            }
        });
        self.track(handle);
    }

    pub fn unwatch_project(&self, project_id: &str) -> bool {
        self.watchers.unwatch_project(project_id)
    }

    pub fn watched_projects(&self) -> Vec<String> {
        self.watchers.active_projects()
    }

    /// Stop watchers, drain background jobs, flush every loaded index, and
    /// close the pool.
    pub async fn shutdown(&self) {
        self.watchers.stop_all();
        self.wait_for_background_jobs().await;
        self.index.flush_all().await;
        self.pool.close().await;
        info!("services shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkingConfig, DbConfig, EmbeddingConfig, IndexConfig, WatcherConfig};

    fn test_config(dir: &Path) -> Config {
        Config {
            db: DbConfig {
                path: dir.join("docdex.sqlite"),
            },
            index: IndexConfig {
                dir: dir.join("index"),
                initial_capacity: 100,
            },
            embedding: EmbeddingConfig {
                base_url: "http://127.0.0.1:1".to_string(),
                timeout_secs: 1,
                ..Default::default()
            },
            chunking: ChunkingConfig::default(),
            watcher: WatcherConfig::default(),
        }
    }

    #[tokio::test]
    async fn constructs_and_manages_projects() {
        let tmp = tempfile::tempdir().unwrap();
        let (services, _events) = Services::new(test_config(tmp.path())).await.unwrap();

        let project = services
            .create_project("demo", None, &ProjectSettings::default())
            .await
            .unwrap();
        let listed = services.list_projects().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, project.id);

        services.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_bad_project_settings() {
        let tmp = tempfile::tempdir().unwrap();
        let (services, _events) = Services::new(test_config(tmp.path())).await.unwrap();

        let err = services
            .create_project(
                "demo",
                None,
                &ProjectSettings {
                    chunk_size: 100,
                    chunk_overlap: 100,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        services.shutdown().await;
    }

    #[tokio::test]
    async fn tracked_adds_are_skipped_changes_are_ingested() {
        let tmp = tempfile::tempdir().unwrap();
        let (services, _events) = Services::new(test_config(tmp.path())).await.unwrap();

        let project = services
            .create_project("demo", None, &ProjectSettings::default())
            .await
            .unwrap();
        let path = tmp.path().join("tracked.txt");
        std::fs::write(&path, "already ingested").unwrap();
        services.ingest_file(&project, &path).await.unwrap();

        let added = WatchEvent {
            project_id: project.id.clone(),
            path: path.clone(),
            kind: WatchEventKind::Added,
        };
        assert!(!services
            .watch_event_needs_ingest(&project.id, &added)
            .await
            .unwrap());

        let changed = WatchEvent {
            kind: WatchEventKind::Changed,
            ..added.clone()
        };
        assert!(services
            .watch_event_needs_ingest(&project.id, &changed)
            .await
            .unwrap());

        let untracked = WatchEvent {
            path: tmp.path().join("new.txt"),
            ..added
        };
        assert!(services
            .watch_event_needs_ingest(&project.id, &untracked)
            .await
            .unwrap());

        services.shutdown().await;
    }

    #[tokio::test]
    async fn watch_requires_a_root_path() {
        let tmp = tempfile::tempdir().unwrap();
        let (services, _events) = Services::new(test_config(tmp.path())).await.unwrap();

        let project = services
            .create_project("demo", None, &ProjectSettings::default())
            .await
            .unwrap();
        let err = services.watch_project(&project.id, None).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        services.shutdown().await;
    }
}
