//! Document listing, retrieval and soft deletion.
//!
//! Used by the `/api/documents` endpoints. Deactivated documents
//! (`is_active = 0`) are hidden from listings and no longer count for
//! content-hash deduplication, but remain fetchable by id.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// Filters for [`list_documents`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentFilter {
    pub namespace: Option<String>,
    pub source_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub id: String,
    pub title: String,
    pub source_type: String,
    pub source_url: Option<String>,
    pub namespace: String,
    pub chunks_count: i64,
    pub crawl_task_id: Option<String>,
    pub crawl_depth: Option<i64>,
    pub created_at: String, // ISO8601
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentResponse {
    pub id: String,
    pub title: String,
    pub source_type: String,
    pub source_url: Option<String>,
    pub namespace: String,
    pub content: String,
    pub content_hash: String,
    pub metadata: serde_json::Value,
    pub crawl_task_id: Option<String>,
    pub crawl_depth: Option<i64>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
    pub chunks: Vec<ChunkResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkResponse {
    pub index: i64,
    pub vector_id: String,
    pub text: String,
    pub metadata: serde_json::Value,
}

/// Active documents, newest first.
pub async fn list_documents(pool: &SqlitePool, filter: &DocumentFilter) -> Result<Vec<DocumentSummary>> {
    let rows = sqlx::query(
        r#"
        SELECT id, title, source_type, source_url, namespace, chunks_count,
               crawl_task_id, crawl_depth, created_at
        FROM documents
        WHERE is_active = 1
          AND (?1 IS NULL OR namespace = ?1)
          AND (?2 IS NULL OR source_type = ?2)
        ORDER BY created_at DESC, id ASC
        "#,
    )
    .bind(&filter.namespace)
    .bind(&filter.source_type)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| DocumentSummary {
            id: row.get("id"),
            title: row.get("title"),
            source_type: row.get("source_type"),
            source_url: row.get("source_url"),
            namespace: row.get("namespace"),
            chunks_count: row.get("chunks_count"),
            crawl_task_id: row.get("crawl_task_id"),
            crawl_depth: row.get("crawl_depth"),
            created_at: format_ts_iso(row.get("created_at")),
        })
        .collect())
}

/// Fetches one document with its chunks. `None` when the id is unknown.
pub async fn get_document(pool: &SqlitePool, id: &str) -> Result<Option<DocumentResponse>> {
    let doc_row = sqlx::query(
        "SELECT id, title, source_type, source_url, namespace, content, content_hash, metadata_json, \
         crawl_task_id, crawl_depth, is_active, created_at, updated_at FROM documents WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    let Some(doc_row) = doc_row else {
        return Ok(None);
    };

    let metadata_json: String = doc_row.get("metadata_json");
    let metadata: serde_json::Value =
        serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({}));

    let chunk_rows = sqlx::query(
        "SELECT chunk_index, vector_id, text, metadata_json FROM chunks \
         WHERE document_id = ? ORDER BY chunk_index ASC",
    )
    .bind(id)
    .fetch_all(pool)
    .await?;

    let chunks = chunk_rows
        .iter()
        .map(|row| {
            let raw: String = row.get("metadata_json");
            ChunkResponse {
                index: row.get("chunk_index"),
                vector_id: row.get("vector_id"),
                text: row.get("text"),
                metadata: serde_json::from_str(&raw).unwrap_or(serde_json::json!({})),
            }
        })
        .collect();

    let is_active: i64 = doc_row.get("is_active");

    Ok(Some(DocumentResponse {
        id: doc_row.get("id"),
        title: doc_row.get("title"),
        source_type: doc_row.get("source_type"),
        source_url: doc_row.get("source_url"),
        namespace: doc_row.get("namespace"),
        content: doc_row.get("content"),
        content_hash: doc_row.get("content_hash"),
        metadata,
        crawl_task_id: doc_row.get("crawl_task_id"),
        crawl_depth: doc_row.get("crawl_depth"),
        is_active: is_active != 0,
        created_at: format_ts_iso(doc_row.get("created_at")),
        updated_at: format_ts_iso(doc_row.get("updated_at")),
        chunks,
    }))
}

/// Soft-deletes a document. Returns `false` when no active document matched.
pub async fn deactivate_document(pool: &SqlitePool, id: &str) -> Result<bool> {
    let now = chrono::Utc::now().timestamp();
    let result =
        sqlx::query("UPDATE documents SET is_active = 0, updated_at = ? WHERE id = ? AND is_active = 1")
            .bind(now)
            .bind(id)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
