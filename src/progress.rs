//! In-memory progress tracking for embedding jobs.
//!
//! One record per document while a job runs. Records are ephemeral: a
//! finished record lingers for a grace period so late pollers still see the
//! terminal state, then a background task removes it. Durable state lives in
//! document metadata, not here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::models::EmbeddingStatus;

/// How long a terminal record stays visible before cleanup.
const CLEANUP_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct ProgressRecord {
    total: usize,
    completed: usize,
    failed: usize,
    status: EmbeddingStatus,
    error: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    fn mark_terminal(&mut self, status: EmbeddingStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }
}

/// Point-in-time view of a job, with the percentage derived on read.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProgressSnapshot {
    pub document_id: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub percentage: u8,
    pub status: EmbeddingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct ProgressTracker {
    records: Arc<Mutex<HashMap<String, ProgressRecord>>>,
    cleanup_delay: Duration,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::with_cleanup_delay(CLEANUP_DELAY)
    }

    /// Tests shrink the delay so cleanup is observable.
    pub fn with_cleanup_delay(cleanup_delay: Duration) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            cleanup_delay,
        }
    }

    /// Register a new job. Replaces any previous record for the document.
    pub fn start(&self, document_id: &str, total: usize) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert(
            document_id.to_string(),
            ProgressRecord {
                total,
                completed: 0,
                failed: 0,
                status: EmbeddingStatus::Processing,
                error: None,
                started_at: Utc::now(),
                finished_at: None,
            },
        );
    }

    /// Update counters for a running job. Unknown documents are a logged
    /// no-op, never an error. A job whose counters account for every chunk
    /// is finished automatically, so a caller that dies mid-run cannot leak
    /// a processing record forever.
    pub fn update(&self, document_id: &str, completed: usize, failed: usize) {
        let auto_finished = {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            match records.get_mut(document_id) {
                Some(record) => {
                    record.completed = completed;
                    record.failed = failed;
                    if completed + failed >= record.total {
                        let status = if completed == 0 && failed > 0 {
                            EmbeddingStatus::Failed
                        } else {
                            EmbeddingStatus::Completed
                        };
                        record.mark_terminal(status, None);
                        true
                    } else {
                        false
                    }
                }
                None => {
                    warn!(document_id, "progress update for unknown document ignored");
                    false
                }
            }
        };
        if auto_finished {
            self.schedule_cleanup(document_id);
        }
    }

    /// Mark a job terminal and schedule the record for removal.
    pub fn finish(&self, document_id: &str, status: EmbeddingStatus, error: Option<String>) {
        {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            match records.get_mut(document_id) {
                Some(record) => record.mark_terminal(status, error),
                None => {
                    warn!(document_id, "progress finish for unknown document ignored");
                    return;
                }
            }
        }
        self.schedule_cleanup(document_id);
    }

    fn schedule_cleanup(&self, document_id: &str) {
        let records = Arc::clone(&self.records);
        let delay = self.cleanup_delay;
        let id = document_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut records = records.lock().unwrap_or_else(|e| e.into_inner());
            if records.remove(&id).is_some() {
                debug!(document_id = %id, "progress record cleaned up");
            }
        });
    }

    pub fn get(&self, document_id: &str) -> Option<ProgressSnapshot> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(document_id).map(|record| {
            let percentage = if record.total > 0 {
                ((record.completed as f64) * 100.0 / (record.total as f64)).round() as u8
            } else {
                0
            };
            ProgressSnapshot {
                document_id: document_id.to_string(),
                total: record.total,
                completed: record.completed,
                failed: record.failed,
                percentage,
                status: record.status,
                error: record.error.clone(),
                started_at: record.started_at,
                finished_at: record.finished_at,
            }
        })
    }
}
