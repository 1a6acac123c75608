//! Relational persistence for projects, documents, chunks, and embeddings.
//!
//! The relational store is the source of truth for embeddings; the vector
//! index is a derived cache rebuilt from these rows. Chunks for a document
//! are always deleted and regenerated together so re-ingestion can never
//! leave stale or duplicate chunks behind.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::{
    Chunk, Document, DocumentMeta, DocumentStatus, EmbeddingRecord, FileType, Project,
    ProjectSettings,
};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============ Projects ============

pub async fn create_project(
    pool: &SqlitePool,
    name: &str,
    root_path: Option<&str>,
    settings: &ProjectSettings,
) -> Result<Project> {
    let id = Uuid::new_v4().to_string();
    let settings_json = serde_json::to_string(settings)
        .map_err(|e| Error::Configuration(format!("invalid project settings: {}", e)))?;
    let created_at = now();

    sqlx::query(
        "INSERT INTO projects (id, name, root_path, settings_json, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(name)
    .bind(root_path)
    .bind(&settings_json)
    .bind(created_at)
    .execute(pool)
    .await?;

    Ok(Project {
        id,
        name: name.to_string(),
        root_path: root_path.map(|s| s.to_string()),
        settings: settings.clone(),
        created_at,
    })
}

pub async fn get_project(pool: &SqlitePool, project_id: &str) -> Result<Project> {
    let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
        .bind(project_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::not_found("project", project_id))?;

    Ok(project_from_row(&row))
}

pub async fn list_projects(pool: &SqlitePool) -> Result<Vec<Project>> {
    let rows = sqlx::query("SELECT * FROM projects ORDER BY created_at")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(project_from_row).collect())
}

fn project_from_row(row: &sqlx::sqlite::SqliteRow) -> Project {
    let settings_json: String = row.get("settings_json");
    Project {
        id: row.get("id"),
        name: row.get("name"),
        root_path: row.get("root_path"),
        settings: serde_json::from_str(&settings_json).unwrap_or_default(),
        created_at: row.get("created_at"),
    }
}

// ============ Documents ============

pub struct NewDocument<'a> {
    pub project_id: &'a str,
    pub name: &'a str,
    pub file_path: &'a str,
    pub file_type: FileType,
}

pub async fn create_document(pool: &SqlitePool, input: &NewDocument<'_>) -> Result<Document> {
    let id = Uuid::new_v4().to_string();
    let ts = now();

    sqlx::query(
        r#"
        INSERT INTO documents (id, project_id, name, file_path, file_type, status, metadata_json, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 'pending', '{}', ?, ?)
        "#,
    )
    .bind(&id)
    .bind(input.project_id)
    .bind(input.name)
    .bind(input.file_path)
    .bind(input.file_type.as_str())
    .bind(ts)
    .bind(ts)
    .execute(pool)
    .await?;

    Ok(Document {
        id,
        project_id: input.project_id.to_string(),
        name: input.name.to_string(),
        file_path: input.file_path.to_string(),
        file_type: input.file_type,
        status: DocumentStatus::Pending,
        error_message: None,
        metadata: DocumentMeta::default(),
        created_at: ts,
        updated_at: ts,
    })
}

pub async fn get_document(pool: &SqlitePool, document_id: &str) -> Result<Document> {
    let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
        .bind(document_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::not_found("document", document_id))?;

    Ok(document_from_row(&row))
}

pub async fn find_document_by_path(
    pool: &SqlitePool,
    project_id: &str,
    file_path: &str,
) -> Result<Option<Document>> {
    let row = sqlx::query("SELECT * FROM documents WHERE project_id = ? AND file_path = ?")
        .bind(project_id)
        .bind(file_path)
        .fetch_optional(pool)
        .await?;

    Ok(row.as_ref().map(document_from_row))
}

pub async fn list_documents_by_project(
    pool: &SqlitePool,
    project_id: &str,
) -> Result<Vec<Document>> {
    let rows = sqlx::query("SELECT * FROM documents WHERE project_id = ? ORDER BY created_at")
        .bind(project_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(document_from_row).collect())
}

pub async fn update_document_status(
    pool: &SqlitePool,
    document_id: &str,
    status: DocumentStatus,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE documents SET status = ?, error_message = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(error_message)
        .bind(now())
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_document_meta(
    pool: &SqlitePool,
    document_id: &str,
    meta: &DocumentMeta,
) -> Result<()> {
    let metadata_json = serde_json::to_string(meta)
        .map_err(|e| Error::Configuration(format!("invalid document metadata: {}", e)))?;

    sqlx::query("UPDATE documents SET metadata_json = ?, updated_at = ? WHERE id = ?")
        .bind(&metadata_json)
        .bind(now())
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(())
}

fn document_from_row(row: &sqlx::sqlite::SqliteRow) -> Document {
    let status: String = row.get("status");
    let file_type: String = row.get("file_type");
    let metadata_json: String = row.get("metadata_json");
    Document {
        id: row.get("id"),
        project_id: row.get("project_id"),
        name: row.get("name"),
        file_path: row.get("file_path"),
        file_type: FileType::parse(&file_type),
        status: DocumentStatus::parse(&status),
        error_message: row.get("error_message"),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

// ============ Chunks ============

pub struct NewChunk<'a> {
    pub document_id: &'a str,
    pub chunk_index: i64,
    pub content: &'a str,
    pub start_char: Option<i64>,
    pub end_char: Option<i64>,
}

pub async fn create_chunk(pool: &SqlitePool, input: &NewChunk<'_>) -> Result<Chunk> {
    let id = Uuid::new_v4().to_string();

    sqlx::query(
        r#"
        INSERT INTO chunks (id, document_id, chunk_index, content, start_char, end_char)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(input.document_id)
    .bind(input.chunk_index)
    .bind(input.content)
    .bind(input.start_char)
    .bind(input.end_char)
    .execute(pool)
    .await?;

    Ok(Chunk {
        id,
        document_id: input.document_id.to_string(),
        chunk_index: input.chunk_index,
        content: input.content.to_string(),
        start_char: input.start_char,
        end_char: input.end_char,
    })
}

pub async fn get_chunk(pool: &SqlitePool, chunk_id: &str) -> Result<Option<Chunk>> {
    let row = sqlx::query("SELECT * FROM chunks WHERE id = ?")
        .bind(chunk_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(chunk_from_row))
}

pub async fn list_chunks_by_document(
    pool: &SqlitePool,
    document_id: &str,
) -> Result<Vec<Chunk>> {
    let rows = sqlx::query("SELECT * FROM chunks WHERE document_id = ? ORDER BY chunk_index")
        .bind(document_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(chunk_from_row).collect())
}

/// Delete all chunks for a document. Returns the number deleted.
pub async fn delete_chunks_by_document(pool: &SqlitePool, document_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

fn chunk_from_row(row: &sqlx::sqlite::SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        start_char: row.get("start_char"),
        end_char: row.get("end_char"),
    }
}

// ============ Embeddings ============

pub async fn create_embedding(pool: &SqlitePool, record: &EmbeddingRecord) -> Result<()> {
    let blob = vec_to_blob(&record.vector);

    sqlx::query(
        r#"
        INSERT INTO embeddings (chunk_id, document_id, model, dimension, vector, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            model = excluded.model,
            dimension = excluded.dimension,
            vector = excluded.vector,
            created_at = excluded.created_at
        "#,
    )
    .bind(&record.chunk_id)
    .bind(&record.document_id)
    .bind(&record.model)
    .bind(record.dimension as i64)
    .bind(&blob)
    .bind(now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_embeddings_by_document(pool: &SqlitePool, document_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM embeddings WHERE document_id = ?")
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Chunks of a document that have no embedding yet, in chunk order.
pub async fn chunks_without_embeddings(
    pool: &SqlitePool,
    document_id: &str,
) -> Result<Vec<Chunk>> {
    let rows = sqlx::query(
        r#"
        SELECT c.* FROM chunks c
        LEFT JOIN embeddings e ON e.chunk_id = c.id
        WHERE c.document_id = ? AND e.chunk_id IS NULL
        ORDER BY c.chunk_index
        "#,
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(chunk_from_row).collect())
}

/// All unembedded chunks across every document of a project.
pub async fn chunks_without_embeddings_by_project(
    pool: &SqlitePool,
    project_id: &str,
) -> Result<Vec<Chunk>> {
    let rows = sqlx::query(
        r#"
        SELECT c.* FROM chunks c
        JOIN documents d ON d.id = c.document_id
        LEFT JOIN embeddings e ON e.chunk_id = c.id
        WHERE d.project_id = ? AND e.chunk_id IS NULL
        ORDER BY c.document_id, c.chunk_index
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(chunk_from_row).collect())
}

pub async fn all_embeddings_by_project(
    pool: &SqlitePool,
    project_id: &str,
) -> Result<Vec<EmbeddingRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT e.* FROM embeddings e
        JOIN documents d ON d.id = e.document_id
        WHERE d.project_id = ?
        ORDER BY e.chunk_id
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("vector");
            let dimension: i64 = row.get("dimension");
            EmbeddingRecord {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                model: row.get("model"),
                dimension: dimension as usize,
                vector: blob_to_vec(&blob),
            }
        })
        .collect())
}
