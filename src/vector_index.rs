//! Per-project approximate nearest neighbor indexes.
//!
//! Wraps `hnsw_rs` with one index per project. The relational store is the
//! source of truth; each index is a derived cache that can be deleted and
//! rebuilt from stored embeddings at any time.
//!
//! Vectors are owned by the wrapper rather than borrowed by the graph, which
//! makes two things possible that `hnsw_rs` does not support directly:
//!
//! - capacity growth: when a batch would push the element count past the
//!   resize threshold, a new graph is built at a larger capacity from the
//!   owned vectors
//! - persistence: vectors are written as an explicit fixed-width binary
//!   table (with a JSON chunk-id mapping sidecar) and the graph is rebuilt
//!   from them at load time, so a corrupt file degrades to an empty index
//!   instead of a panic
//!
//! Internal ids are sequential insertion positions; the mapping sidecar
//! translates them back to chunk ids.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use hnsw_rs::prelude::*;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::models::{EmbeddingRecord, IndexStats, SearchHit};

const MAX_NB_CONNECTION: usize = 16;
const MAX_LAYER: usize = 16;
const EF_CONSTRUCTION: usize = 200;
const EF_SEARCH: usize = 64;

/// Fraction of capacity at which the graph is rebuilt with more headroom.
const RESIZE_THRESHOLD: f64 = 0.9;

/// Vector table header: magic, format version, dimension (u32), count (u64),
/// then `count * dimension` little-endian f32 values.
const VEC_MAGIC: &[u8; 4] = b"DXVI";
const VEC_VERSION: u32 = 1;

/// Newtype so the graph can cross thread boundaries.
///
/// The `'static` lifetime is safe: every graph here is created via
/// `Hnsw::new()` and only ever fed slices of vectors the wrapper owns.
struct GraphCell {
    hnsw: Hnsw<'static, f32, DistCosine>,
}

// SAFETY: hnsw_rs::Hnsw uses Arc-based internal storage and is safe to
// share across threads.
unsafe impl Send for GraphCell {}
unsafe impl Sync for GraphCell {}

struct ProjectIndex {
    graph: GraphCell,
    /// Internal id is the position in these two parallel tables.
    vectors: Vec<Vec<f32>>,
    chunk_ids: Vec<String>,
    by_chunk: HashMap<String, usize>,
    capacity: usize,
}

impl ProjectIndex {
    fn empty(capacity: usize) -> Self {
        Self {
            graph: new_graph(capacity),
            vectors: Vec::new(),
            chunk_ids: Vec::new(),
            by_chunk: HashMap::new(),
            capacity,
        }
    }
}

fn new_graph(capacity: usize) -> GraphCell {
    GraphCell {
        hnsw: Hnsw::new(
            MAX_NB_CONNECTION,
            capacity,
            MAX_LAYER,
            EF_CONSTRUCTION,
            DistCosine,
        ),
    }
}

/// Build a graph over owned vectors, choosing a capacity large enough that
/// the element count stays under the resize threshold.
fn build_project_index(
    vectors: Vec<Vec<f32>>,
    chunk_ids: Vec<String>,
    min_capacity: usize,
) -> ProjectIndex {
    let mut capacity = min_capacity.max(1);
    while (vectors.len() as f64) >= (capacity as f64) * RESIZE_THRESHOLD {
        capacity *= 2;
    }

    let graph = new_graph(capacity);
    for (id, vector) in vectors.iter().enumerate() {
        graph.hnsw.insert_slice((vector.as_slice(), id));
    }

    let by_chunk = chunk_ids
        .iter()
        .enumerate()
        .map(|(id, chunk_id)| (chunk_id.clone(), id))
        .collect();

    ProjectIndex {
        graph,
        vectors,
        chunk_ids,
        by_chunk,
        capacity,
    }
}

/// Owns every loaded project index plus the rebuild guard set.
pub struct VectorIndexManager {
    index_dir: PathBuf,
    dimension: usize,
    initial_capacity: usize,
    indexes: Mutex<HashMap<String, ProjectIndex>>,
    rebuilding: std::sync::Mutex<HashSet<String>>,
}

impl VectorIndexManager {
    pub fn new(config: &IndexConfig, dimension: usize) -> Self {
        Self {
            index_dir: config.dir.clone(),
            dimension,
            initial_capacity: config.initial_capacity,
            indexes: Mutex::new(HashMap::new()),
            rebuilding: std::sync::Mutex::new(HashSet::new()),
        }
    }

    fn vectors_path(&self, project_id: &str) -> PathBuf {
        self.index_dir.join(format!("project-{}.vec", project_id))
    }

    fn mapping_path(&self, project_id: &str) -> PathBuf {
        self.index_dir
            .join(format!("project-{}.mapping.json", project_id))
    }

    /// Add embeddings to a project's index. Chunk ids already present are
    /// skipped, so replaying a batch is harmless. Returns how many vectors
    /// were actually inserted.
    pub async fn add_embeddings(
        &self,
        project_id: &str,
        items: &[(String, Vec<f32>)],
    ) -> Result<usize> {
        for (chunk_id, vector) in items {
            if vector.len() != self.dimension {
                warn!(chunk_id, "vector dimension mismatch, rejecting batch");
                return Err(Error::DimensionMismatch {
                    expected: self.dimension,
                    actual: vector.len(),
                });
            }
        }

        let mut indexes = self.indexes.lock().await;
        let index = self.ensure_loaded(&mut indexes, project_id).await?;

        let pending: Vec<&(String, Vec<f32>)> = items
            .iter()
            .filter(|(chunk_id, _)| !index.by_chunk.contains_key(chunk_id))
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        // Grow at most once per batch, before any insert.
        let projected = index.vectors.len() + pending.len();
        if (projected as f64) > (index.capacity as f64) * RESIZE_THRESHOLD {
            let new_capacity = (index.capacity * 2).max(projected + 1000);
            info!(
                project_id,
                old_capacity = index.capacity,
                new_capacity,
                "growing vector index"
            );
            let vectors = std::mem::take(&mut index.vectors);
            let chunk_ids = std::mem::take(&mut index.chunk_ids);
            *index = tokio::task::spawn_blocking(move || {
                build_project_index(vectors, chunk_ids, new_capacity)
            })
            .await
            .map_err(|e| Error::IndexIo(format!("index rebuild task failed: {}", e)))?;
        }

        let inserted = pending.len();
        for (chunk_id, vector) in pending {
            let internal_id = index.vectors.len();
            index.graph.hnsw.insert_slice((vector.as_slice(), internal_id));
            index.vectors.push(vector.clone());
            index.chunk_ids.push(chunk_id.clone());
            index.by_chunk.insert(chunk_id.clone(), internal_id);
        }

        debug!(project_id, inserted, "added vectors to index");
        Ok(inserted)
    }

    /// Nearest-neighbor search. `k` is clamped to the element count; an
    /// empty index yields an empty result rather than an error.
    pub async fn search(
        &self,
        project_id: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let mut indexes = self.indexes.lock().await;
        let index = self.ensure_loaded(&mut indexes, project_id).await?;

        let count = index.vectors.len();
        if count == 0 || k == 0 {
            return Ok(Vec::new());
        }
        let k = k.min(count);

        let neighbours = index.graph.hnsw.search(query, k, EF_SEARCH.max(k * 2));

        Ok(neighbours
            .into_iter()
            .map(|n| SearchHit {
                chunk_id: index
                    .chunk_ids
                    .get(n.d_id)
                    .cloned()
                    .unwrap_or_else(|| format!("unknown-{}", n.d_id)),
                distance: n.distance,
            })
            .collect())
    }

    /// Replace a project's index with one built from the given records.
    ///
    /// Only one rebuild per project may run at a time; a second concurrent
    /// request fails with a conflict instead of queueing.
    pub async fn rebuild(&self, project_id: &str, records: &[EmbeddingRecord]) -> Result<()> {
        self.lock_rebuild(project_id)?;
        let result = self.rebuild_inner(project_id, records).await;
        self.unlock_rebuild(project_id);
        result
    }

    async fn rebuild_inner(&self, project_id: &str, records: &[EmbeddingRecord]) -> Result<()> {
        let mut vectors = Vec::with_capacity(records.len());
        let mut chunk_ids = Vec::with_capacity(records.len());
        for record in records {
            if record.vector.len() != self.dimension {
                return Err(Error::DimensionMismatch {
                    expected: self.dimension,
                    actual: record.vector.len(),
                });
            }
            vectors.push(record.vector.clone());
            chunk_ids.push(record.chunk_id.clone());
        }

        let min_capacity = self.initial_capacity;
        let index = tokio::task::spawn_blocking(move || {
            build_project_index(vectors, chunk_ids, min_capacity)
        })
        .await
        .map_err(|e| Error::IndexIo(format!("index rebuild task failed: {}", e)))?;

        info!(project_id, vectors = index.vectors.len(), "rebuilt vector index");

        let mut indexes = self.indexes.lock().await;
        indexes.insert(project_id.to_string(), index);
        self.save_locked(&indexes, project_id)
    }

    fn lock_rebuild(&self, project_id: &str) -> Result<()> {
        let mut rebuilding = self.rebuilding.lock().unwrap_or_else(|e| e.into_inner());
        if !rebuilding.insert(project_id.to_string()) {
            return Err(Error::ConcurrencyConflict {
                operation: "index rebuild",
                id: project_id.to_string(),
            });
        }
        Ok(())
    }

    fn unlock_rebuild(&self, project_id: &str) {
        let mut rebuilding = self.rebuilding.lock().unwrap_or_else(|e| e.into_inner());
        rebuilding.remove(project_id);
    }

    /// Persist a project's vectors and chunk-id mapping.
    pub async fn save(&self, project_id: &str) -> Result<()> {
        let indexes = self.indexes.lock().await;
        self.save_locked(&indexes, project_id)
    }

    fn save_locked(
        &self,
        indexes: &HashMap<String, ProjectIndex>,
        project_id: &str,
    ) -> Result<()> {
        let index = indexes
            .get(project_id)
            .ok_or_else(|| Error::not_found("vector index", project_id))?;

        std::fs::create_dir_all(&self.index_dir)?;

        let path = self.vectors_path(project_id);
        let tmp = path.with_extension("vec.tmp");
        {
            let mut file = std::io::BufWriter::new(std::fs::File::create(&tmp)?);
            file.write_all(VEC_MAGIC)?;
            file.write_all(&VEC_VERSION.to_le_bytes())?;
            file.write_all(&(self.dimension as u32).to_le_bytes())?;
            file.write_all(&(index.vectors.len() as u64).to_le_bytes())?;
            for vector in &index.vectors {
                for &v in vector {
                    file.write_all(&v.to_le_bytes())?;
                }
            }
            file.flush()?;
        }
        std::fs::rename(&tmp, &path)?;

        let mapping = serde_json::to_vec(&index.chunk_ids)
            .map_err(|e| Error::IndexIo(format!("mapping serialization failed: {}", e)))?;
        std::fs::write(self.mapping_path(project_id), mapping)?;

        debug!(project_id, vectors = index.vectors.len(), "saved vector index");
        Ok(())
    }

    /// Persist every loaded index. Failures are logged, not propagated, so
    /// shutdown always completes.
    pub async fn flush_all(&self) {
        let indexes = self.indexes.lock().await;
        for project_id in indexes.keys() {
            if let Err(e) = self.save_locked(&indexes, project_id) {
                warn!(project_id, error = %e, "failed to flush vector index");
            }
        }
    }

    /// Drop every loaded index and its on-disk files. Fresh searches start
    /// from empty indexes; `rebuild` repopulates from the store.
    pub async fn clear_all(&self) -> Result<usize> {
        let mut indexes = self.indexes.lock().await;
        let cleared = indexes.len();
        indexes.clear();
        drop(indexes);

        // Sweep persisted files too, including projects that were never
        // loaded in this process.
        if self.index_dir.is_dir() {
            for entry in std::fs::read_dir(&self.index_dir)?.filter_map(|e| e.ok()) {
                let path = entry.path();
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with("project-")
                    && (name.ends_with(".vec") || name.ends_with(".mapping.json"))
                {
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!(path = %path.display(), error = %e, "failed to remove index file");
                    }
                }
            }
        }
        info!(cleared, "cleared all vector indexes");
        Ok(cleared)
    }

    pub async fn stats(&self, project_id: &str) -> Result<IndexStats> {
        let mut indexes = self.indexes.lock().await;
        let index = self.ensure_loaded(&mut indexes, project_id).await?;
        Ok(IndexStats {
            project_id: project_id.to_string(),
            dimension: self.dimension,
            space: "cosine",
            m: MAX_NB_CONNECTION,
            ef_construction: EF_CONSTRUCTION,
            element_count: index.vectors.len(),
            max_elements: index.capacity,
        })
    }

    async fn ensure_loaded<'a>(
        &self,
        indexes: &'a mut HashMap<String, ProjectIndex>,
        project_id: &str,
    ) -> Result<&'a mut ProjectIndex> {
        if !indexes.contains_key(project_id) {
            let index = self.load_or_create(project_id).await?;
            indexes.insert(project_id.to_string(), index);
        }
        Ok(indexes
            .get_mut(project_id)
            .ok_or_else(|| Error::not_found("vector index", project_id))?)
    }

    async fn load_or_create(&self, project_id: &str) -> Result<ProjectIndex> {
        let vec_path = self.vectors_path(project_id);
        let map_path = self.mapping_path(project_id);

        if !vec_path.exists() || !map_path.exists() {
            debug!(project_id, "no persisted index, starting empty");
            return Ok(ProjectIndex::empty(self.initial_capacity));
        }

        match self.read_persisted(&vec_path, &map_path) {
            Ok((vectors, chunk_ids)) => {
                let min_capacity = self.initial_capacity;
                let count = vectors.len();
                let index = tokio::task::spawn_blocking(move || {
                    build_project_index(vectors, chunk_ids, min_capacity)
                })
                .await
                .map_err(|e| Error::IndexIo(format!("index load task failed: {}", e)))?;
                info!(project_id, vectors = count, "loaded vector index from disk");
                Ok(index)
            }
            Err(e) => {
                warn!(project_id, error = %e, "persisted index unreadable, starting empty");
                Ok(ProjectIndex::empty(self.initial_capacity))
            }
        }
    }

    fn read_persisted(
        &self,
        vec_path: &Path,
        map_path: &Path,
    ) -> Result<(Vec<Vec<f32>>, Vec<String>)> {
        let mut file = std::io::BufReader::new(std::fs::File::open(vec_path)?);

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != VEC_MAGIC {
            return Err(Error::IndexIo("bad magic in vector table".to_string()));
        }

        let mut u32_buf = [0u8; 4];
        file.read_exact(&mut u32_buf)?;
        let version = u32::from_le_bytes(u32_buf);
        if version != VEC_VERSION {
            return Err(Error::IndexIo(format!(
                "unsupported vector table version {}",
                version
            )));
        }

        file.read_exact(&mut u32_buf)?;
        let dimension = u32::from_le_bytes(u32_buf) as usize;
        if dimension != self.dimension {
            return Err(Error::IndexIo(format!(
                "vector table dimension {} does not match configured {}",
                dimension, self.dimension
            )));
        }

        let mut u64_buf = [0u8; 8];
        file.read_exact(&mut u64_buf)?;
        let count = u64::from_le_bytes(u64_buf) as usize;

        let mut vectors = Vec::with_capacity(count);
        let mut row = vec![0u8; dimension * 4];
        for _ in 0..count {
            file.read_exact(&mut row)?;
            vectors.push(crate::embedding::blob_to_vec(&row));
        }

        let mapping_bytes = std::fs::read(map_path)?;
        let chunk_ids: Vec<String> = serde_json::from_slice(&mapping_bytes)
            .map_err(|e| Error::IndexIo(format!("mapping sidecar unreadable: {}", e)))?;
        if chunk_ids.len() != vectors.len() {
            return Err(Error::IndexIo(format!(
                "mapping has {} entries for {} vectors",
                chunk_ids.len(),
                vectors.len()
            )));
        }

        Ok((vectors, chunk_ids))
    }
}
