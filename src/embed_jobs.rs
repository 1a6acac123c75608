//! Embedding job orchestration.
//!
//! Pulls unembedded chunks from the store, embeds them in fixed-size batches,
//! persists the vectors, and feeds the project's ANN index. A batch failure
//! marks that batch's chunks failed and moves on; the job only counts as
//! failed when nothing at all was embedded. An in-flight guard makes a second
//! request for the same document or project a visible no-op instead of a
//! duplicate job.

use std::collections::HashSet;
use std::sync::Mutex;

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::models::{Chunk, EmbeddingCounts, EmbeddingRecord, EmbeddingStatus};
use crate::progress::ProgressTracker;
use crate::store;
use crate::vector_index::VectorIndexManager;

/// Chunks per embedding batch.
const EMBED_BATCH_SIZE: usize = 15;

/// Final tally of one embedding job.
#[derive(Debug, Clone, Copy)]
pub struct EmbedReport {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub status: EmbeddingStatus,
}

impl EmbedReport {
    fn finish(total: usize, completed: usize, failed: usize) -> Self {
        // A partial success is still a success; only a job that produced
        // nothing while failing something is failed.
        let status = if completed == 0 && failed > 0 {
            EmbeddingStatus::Failed
        } else {
            EmbeddingStatus::Completed
        };
        Self {
            total,
            completed,
            failed,
            status,
        }
    }
}

#[derive(Default)]
pub struct EmbedJobs {
    in_flight: Mutex<HashSet<String>>,
}

impl EmbedJobs {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_claim(&self, key: &str) -> bool {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.insert(key.to_string())
    }

    fn release(&self, key: &str) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(key);
    }

    /// Whether a job for this document (or `project:{id}` key) is running.
    pub fn is_in_flight(&self, key: &str) -> bool {
        let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.contains(key)
    }

    /// Generate embeddings for every unembedded chunk of a document.
    ///
    /// Returns `None` when a job for this document is already running.
    pub async fn embed_document(
        &self,
        pool: &SqlitePool,
        client: &EmbeddingClient,
        index: &VectorIndexManager,
        tracker: &ProgressTracker,
        document_id: &str,
    ) -> Result<Option<EmbedReport>> {
        if !self.try_claim(document_id) {
            info!(document_id, "embedding job already in flight, skipping");
            return Ok(None);
        }

        let result = self
            .embed_document_inner(pool, client, index, tracker, document_id)
            .await;
        self.release(document_id);
        result.map(Some)
    }

    async fn embed_document_inner(
        &self,
        pool: &SqlitePool,
        client: &EmbeddingClient,
        index: &VectorIndexManager,
        tracker: &ProgressTracker,
        document_id: &str,
    ) -> Result<EmbedReport> {
        let document = store::get_document(pool, document_id).await?;
        let chunks = store::chunks_without_embeddings(pool, document_id).await?;
        let total = chunks.len();

        // Nothing pending: complete without touching document state.
        if total == 0 {
            info!(document_id, "no chunks without embeddings, nothing to do");
            return Ok(EmbedReport::finish(0, 0, 0));
        }

        tracker.start(document_id, total);
        let mut meta = document.metadata.clone();
        meta.embedding_status = Some(EmbeddingStatus::Processing);
        meta.embedding_progress = Some(EmbeddingCounts {
            total,
            completed: 0,
            failed: 0,
        });
        store::update_document_meta(pool, document_id, &meta).await?;

        let mut completed = 0usize;
        let mut failed = 0usize;

        for batch in chunks.chunks(EMBED_BATCH_SIZE) {
            match embed_batch(pool, client, index, &document.project_id, batch).await {
                Ok(batch_completed) => {
                    completed += batch_completed;
                    failed += batch.len() - batch_completed;
                }
                Err(e) => {
                    warn!(document_id, error = %e, "embedding batch failed");
                    failed += batch.len();
                }
            }

            tracker.update(document_id, completed, failed);
            meta.embedding_progress = Some(EmbeddingCounts {
                total,
                completed,
                failed,
            });
            store::update_document_meta(pool, document_id, &meta).await?;
        }

        // The index file is advisory; it can always be rebuilt from the
        // store, so a save failure does not fail the job.
        if let Err(e) = index.save(&document.project_id).await {
            warn!(project_id = %document.project_id, error = %e, "failed to save vector index");
        }

        let report = EmbedReport::finish(total, completed, failed);
        let error = match report.status {
            EmbeddingStatus::Failed => Some(format!("{} of {} chunks failed", failed, total)),
            _ => None,
        };

        meta.embedding_status = Some(report.status);
        meta.embedding_error = error.clone();
        store::update_document_meta(pool, document_id, &meta).await?;
        tracker.finish(document_id, report.status, error);

        info!(
            document_id,
            total, completed, failed,
            status = ?report.status,
            "embedding job finished"
        );
        Ok(report)
    }

    /// Generate embeddings for every unembedded chunk across a project.
    ///
    /// Returns `None` when a job for this project is already running.
    pub async fn embed_project(
        &self,
        pool: &SqlitePool,
        client: &EmbeddingClient,
        index: &VectorIndexManager,
        project_id: &str,
    ) -> Result<Option<EmbedReport>> {
        let key = format!("project:{}", project_id);
        if !self.try_claim(&key) {
            info!(project_id, "project embedding job already in flight, skipping");
            return Ok(None);
        }

        let result = self
            .embed_project_inner(pool, client, index, project_id)
            .await;
        self.release(&key);
        result.map(Some)
    }

    async fn embed_project_inner(
        &self,
        pool: &SqlitePool,
        client: &EmbeddingClient,
        index: &VectorIndexManager,
        project_id: &str,
    ) -> Result<EmbedReport> {
        let chunks = store::chunks_without_embeddings_by_project(pool, project_id).await?;
        let total = chunks.len();

        let mut completed = 0usize;
        let mut failed = 0usize;

        for batch in chunks.chunks(EMBED_BATCH_SIZE) {
            match embed_batch(pool, client, index, project_id, batch).await {
                Ok(batch_completed) => {
                    completed += batch_completed;
                    failed += batch.len() - batch_completed;
                }
                Err(e) => {
                    warn!(project_id, error = %e, "embedding batch failed");
                    failed += batch.len();
                }
            }
        }

        if total > 0 {
            if let Err(e) = index.save(project_id).await {
                warn!(project_id, error = %e, "failed to save vector index");
            }
        }

        let report = EmbedReport::finish(total, completed, failed);
        info!(
            project_id,
            total, completed, failed,
            status = ?report.status,
            "project embedding job finished"
        );
        Ok(report)
    }
}

/// Embed one batch of chunks and persist the results. Returns how many
/// chunks in the batch succeeded.
async fn embed_batch(
    pool: &SqlitePool,
    client: &EmbeddingClient,
    index: &VectorIndexManager,
    project_id: &str,
    batch: &[Chunk],
) -> Result<usize> {
    let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
    let result = client.embed_batch(&texts).await;

    let mut items = Vec::new();
    for (chunk, vector) in batch.iter().zip(result.vectors.into_iter()) {
        let Some(vector) = vector else { continue };
        store::create_embedding(
            pool,
            &EmbeddingRecord {
                chunk_id: chunk.id.clone(),
                document_id: chunk.document_id.clone(),
                model: client.model().to_string(),
                dimension: vector.len(),
                vector: vector.clone(),
            },
        )
        .await?;
        items.push((chunk.id.clone(), vector));
    }

    let completed = items.len();
    if !items.is_empty() {
        index.add_embeddings(project_id, &items).await?;
    }
    Ok(completed)
}

/// Rebuild a project's ANN index from the stored embeddings.
pub async fn rebuild_index_from_store(
    pool: &SqlitePool,
    index: &VectorIndexManager,
    project_id: &str,
) -> Result<usize> {
    let records = store::all_embeddings_by_project(pool, project_id).await?;
    index.rebuild(project_id, &records).await?;
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_success_is_completed() {
        assert_eq!(
            EmbedReport::finish(10, 7, 3).status,
            EmbeddingStatus::Completed
        );
        assert_eq!(EmbedReport::finish(0, 0, 0).status, EmbeddingStatus::Completed);
    }

    #[test]
    fn total_failure_is_failed() {
        assert_eq!(EmbedReport::finish(5, 0, 5).status, EmbeddingStatus::Failed);
    }

    #[test]
    fn claim_is_exclusive_until_released() {
        let jobs = EmbedJobs::new();
        assert!(jobs.try_claim("doc-1"));
        assert!(!jobs.try_claim("doc-1"));
        assert!(jobs.try_claim("doc-2"));
        jobs.release("doc-1");
        assert!(jobs.try_claim("doc-1"));
    }
}
