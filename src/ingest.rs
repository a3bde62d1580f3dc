//! Page ingestion: crawled page → document → chunks → vectors → SQLite.
//!
//! The relay only knows the [`Ingestor`] trait. [`document_from_page`] maps a
//! [`CrawledPage`] onto the same [`NewDocument`] shape any other source
//! would produce, and [`SqliteIngestor`] is the production pipeline:
//!
//! 1. clean the page text ([`clean_web_content`])
//! 2. skip the page if an identical active document exists in the namespace
//! 3. chunk ([`chunk_text`])
//! 4. embed, when a provider is configured
//! 5. write document, chunks and vectors in one transaction

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::chunk::{chunk_text, clean_web_content};
use crate::config::{ChunkingConfig, Config, EmbeddingConfig};
use crate::embedding::{self, EmbeddingProvider};
use crate::error::CrawlError;
use crate::models::{Chunk, CrawledPage, IngestedDocument, NewDocument};

pub const WEB_SOURCE_TYPE: &str = "web";
const CHUNK_TYPE: &str = "web_content";

/// The indexing pipeline a crawl hands its pages to.
#[async_trait]
pub trait Ingestor: Send + Sync {
    async fn ingest(&self, doc: NewDocument) -> Result<IngestedDocument>;
}

/// Builds the document for one crawled page.
pub fn document_from_page(page: &CrawledPage, namespace: &str, task_id: Option<&str>) -> NewDocument {
    let title = page
        .title()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("Untitled")
        .to_string();

    let depth = page.depth().unwrap_or(0);
    let metadata = json!({
        "url": page.url(),
        "title": title,
        "depth": depth,
        "crawled_at": page.crawled_at(),
        "status_code": page.status_code(),
        "processing_time": page.processing_time(),
        "internal_links": page.internal_links(),
        "external_links": page.external_links(),
        "images": page.images(),
    });

    NewDocument {
        title,
        source_type: WEB_SOURCE_TYPE.to_string(),
        source_url: Some(page.url().to_string()),
        namespace: namespace.to_string(),
        content: page.text().to_string(),
        metadata,
        crawl_task_id: task_id.map(str::to_string),
        crawl_depth: Some(depth),
    }
}

/// Ingests one page, tagging any failure with the page URL.
pub async fn ingest_page(
    ingestor: &dyn Ingestor,
    page: &CrawledPage,
    namespace: &str,
    task_id: Option<&str>,
) -> Result<IngestedDocument, CrawlError> {
    let doc = document_from_page(page, namespace, task_id);
    ingestor
        .ingest(doc)
        .await
        .map_err(|source| CrawlError::Ingestion {
            url: page.url().to_string(),
            source,
        })
}

/// SQLite-backed ingestion pipeline.
pub struct SqliteIngestor {
    pool: SqlitePool,
    chunking: ChunkingConfig,
    embedding: EmbeddingConfig,
    provider: Box<dyn EmbeddingProvider>,
}

impl SqliteIngestor {
    pub fn new(pool: SqlitePool, config: &Config) -> Result<Self> {
        let provider = embedding::create_provider(&config.embedding)?;
        Ok(Self {
            pool,
            chunking: config.chunking.clone(),
            embedding: config.embedding.clone(),
            provider,
        })
    }

    async fn find_duplicate(
        &self,
        namespace: &str,
        content_hash: &str,
    ) -> Result<Option<(String, i64)>> {
        let existing: Option<(String, i64)> = sqlx::query_as(
            "SELECT id, chunks_count FROM documents \
             WHERE namespace = ? AND content_hash = ? AND is_active = 1 LIMIT 1",
        )
        .bind(namespace)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(existing)
    }
}

#[async_trait]
impl Ingestor for SqliteIngestor {
    async fn ingest(&self, doc: NewDocument) -> Result<IngestedDocument> {
        let content = clean_web_content(&doc.content);
        if content.is_empty() {
            bail!("no indexable content after cleaning");
        }

        let content_hash = format!("{:x}", Sha256::digest(content.as_bytes()));
        // Fast path; the unique index on active content settles races.
        if let Some((id, chunks)) = self.find_duplicate(&doc.namespace, &content_hash).await? {
            debug!(document_id = %id, namespace = %doc.namespace, "identical document already indexed");
            return Ok(IngestedDocument {
                id,
                chunks: chunks.max(0) as usize,
                deduplicated: true,
            });
        }

        let doc_id = Uuid::new_v4().to_string();
        let chunks = chunk_text(
            &doc_id,
            &content,
            self.chunking.max_tokens,
            self.chunking.overlap_tokens,
        );

        // Embed before the transaction is opened.
        let vectors = if self.embedding.is_enabled() {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            Some(embedding::embed_chunks(self.provider.as_ref(), self.embedding.batch_size, &texts).await?)
        } else {
            None
        };

        let now = chrono::Utc::now().timestamp();
        let metadata_json = doc.metadata.to_string();

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO documents (id, title, source_type, source_url, namespace, content, content_hash,
                                   chunks_count, metadata_json, crawl_task_id, crawl_depth, crawl_metadata,
                                   created_at, updated_at, is_active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(&doc_id)
        .bind(&doc.title)
        .bind(&doc.source_type)
        .bind(&doc.source_url)
        .bind(&doc.namespace)
        .bind(&content)
        .bind(&content_hash)
        .bind(chunks.len() as i64)
        .bind(&metadata_json)
        .bind(&doc.crawl_task_id)
        .bind(doc.crawl_depth.map(i64::from))
        .bind(&metadata_json)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if !is_unique_violation(&err) {
                return Err(err.into());
            }
            // Another ingestion stored the same content first.
            tx.rollback().await?;
            if let Some((id, chunks)) = self.find_duplicate(&doc.namespace, &content_hash).await? {
                debug!(document_id = %id, namespace = %doc.namespace, "identical document indexed concurrently");
                return Ok(IngestedDocument {
                    id,
                    chunks: chunks.max(0) as usize,
                    deduplicated: true,
                });
            }
            return Err(err.into());
        }

        for chunk in &chunks {
            insert_chunk(&mut tx, chunk).await?;
        }

        if let Some(vectors) = &vectors {
            for (chunk, vector) in chunks.iter().zip(vectors) {
                sqlx::query(
                    "INSERT INTO chunk_vectors (chunk_id, document_id, namespace, model, dims, hash, vector) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&chunk.id)
                .bind(&doc_id)
                .bind(&doc.namespace)
                .bind(self.provider.model_name())
                .bind(vector.len() as i64)
                .bind(&chunk.hash)
                .bind(embedding::vec_to_blob(vector))
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        info!(
            document_id = %doc_id,
            namespace = %doc.namespace,
            url = doc.source_url.as_deref().unwrap_or(""),
            chunks = chunks.len(),
            embedded = vectors.is_some(),
            "document indexed"
        );

        Ok(IngestedDocument {
            id: doc_id,
            chunks: chunks.len(),
            deduplicated: false,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

async fn insert_chunk(tx: &mut sqlx::SqliteConnection, chunk: &Chunk) -> Result<()> {
    let metadata = json!({
        "chunk_index": chunk.chunk_index,
        "chunk_type": CHUNK_TYPE,
        "document_id": chunk.document_id,
    });

    sqlx::query(
        "INSERT INTO chunks (id, document_id, chunk_index, text, hash, vector_id, metadata_json) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&chunk.id)
    .bind(&chunk.document_id)
    .bind(chunk.chunk_index)
    .bind(&chunk.text)
    .bind(&chunk.hash)
    .bind(&chunk.id)
    .bind(metadata.to_string())
    .execute(&mut *tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn setup(tmp: &TempDir) -> (SqlitePool, Config) {
        let config: Config = toml::from_str(&format!(
            r#"
[db]
path = "{}"

[chunking]
max_tokens = 20
overlap_tokens = 4

[server]
bind = "127.0.0.1:0"
"#,
            tmp.path().join("data/test.sqlite").display()
        ))
        .unwrap();
        let pool = db::connect(&config).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        (pool, config)
    }

    fn page(url: &str, text: &str) -> CrawledPage {
        CrawledPage::new(url, text)
            .with_field("title", "Example")
            .with_field("depth", 1)
            .with_field("status_code", 200)
    }

    #[test]
    fn maps_page_to_web_document() {
        let p = page("https://example.com/a", "# A\n\nBody").with_field("title", "   ");
        let doc = document_from_page(&p, "docs", Some("t1"));
        assert_eq!(doc.title, "Untitled");
        assert_eq!(doc.source_type, "web");
        assert_eq!(doc.source_url.as_deref(), Some("https://example.com/a"));
        assert_eq!(doc.namespace, "docs");
        assert_eq!(doc.crawl_task_id.as_deref(), Some("t1"));
        assert_eq!(doc.crawl_depth, Some(1));
        assert_eq!(doc.metadata["url"], "https://example.com/a");
        assert_eq!(doc.metadata["depth"], 1);
        assert_eq!(doc.metadata["status_code"], 200);
        assert!(doc.metadata["internal_links"].is_array());
    }

    #[test]
    fn content_only_page_maps_its_text() {
        let p: CrawledPage = serde_json::from_value(json!({
            "url": "https://example.com/c",
            "content": "Plain body"
        }))
        .unwrap();
        let doc = document_from_page(&p, "docs", None);
        assert_eq!(doc.content, "Plain body");
        assert_eq!(doc.crawl_depth, Some(0));
    }

    #[tokio::test]
    async fn stores_document_and_chunks() {
        let tmp = TempDir::new().unwrap();
        let (pool, config) = setup(&tmp).await;
        let ingestor = SqliteIngestor::new(pool.clone(), &config).unwrap();

        let text = (0..10)
            .map(|i| format!("Paragraph {} has some words in it.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let result = ingest_page(&ingestor, &page("https://example.com/a", &text), "docs", Some("t1"))
            .await
            .unwrap();
        assert!(!result.deduplicated);
        assert!(result.chunks > 1);

        let (source_type, namespace, chunks_count): (String, String, i64) = sqlx::query_as(
            "SELECT source_type, namespace, chunks_count FROM documents WHERE id = ?",
        )
        .bind(&result.id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(source_type, "web");
        assert_eq!(namespace, "docs");
        assert_eq!(chunks_count as usize, result.chunks);

        let metadata: String = sqlx::query_scalar(
            "SELECT metadata_json FROM chunks WHERE document_id = ? AND chunk_index = 0",
        )
        .bind(&result.id)
        .fetch_one(&pool)
        .await
        .unwrap();
        let metadata: serde_json::Value = serde_json::from_str(&metadata).unwrap();
        assert_eq!(metadata["chunk_type"], "web_content");
        assert_eq!(metadata["document_id"], result.id.as_str());
    }

    #[tokio::test]
    async fn identical_content_is_deduplicated_per_namespace() {
        let tmp = TempDir::new().unwrap();
        let (pool, config) = setup(&tmp).await;
        let ingestor = SqliteIngestor::new(pool.clone(), &config).unwrap();
        let p = page("https://example.com/a", "Same body text.");

        let first = ingest_page(&ingestor, &p, "docs", None).await.unwrap();
        let second = ingest_page(&ingestor, &p, "docs", None).await.unwrap();
        assert!(second.deduplicated);
        assert_eq!(first.id, second.id);

        let other = ingest_page(&ingestor, &p, "other", None).await.unwrap();
        assert!(!other.deduplicated);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn concurrent_identical_pages_store_one_document() {
        let tmp = TempDir::new().unwrap();
        let (pool, config) = setup(&tmp).await;
        let ingestor = std::sync::Arc::new(SqliteIngestor::new(pool.clone(), &config).unwrap());

        let mut handles = Vec::new();
        for i in 0..8 {
            let ingestor = ingestor.clone();
            handles.push(tokio::spawn(async move {
                let p = page(&format!("https://example.com/{}", i), "Mirrored body text.");
                ingest_page(ingestor.as_ref(), &p, "docs", None).await
            }));
        }

        let mut ids = Vec::new();
        let mut deduplicated = 0;
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            if result.deduplicated {
                deduplicated += 1;
            }
            ids.push(result.id);
        }
        assert_eq!(deduplicated, 7);
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let active: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE is_active = 1")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(active, 1);
    }

    #[tokio::test]
    async fn soft_deleted_copy_does_not_block_reindexing() {
        let tmp = TempDir::new().unwrap();
        let (pool, config) = setup(&tmp).await;
        let ingestor = SqliteIngestor::new(pool.clone(), &config).unwrap();
        let p = page("https://example.com/a", "Same body text.");

        let first = ingest_page(&ingestor, &p, "docs", None).await.unwrap();
        sqlx::query("UPDATE documents SET is_active = 0 WHERE id = ?")
            .bind(&first.id)
            .execute(&pool)
            .await
            .unwrap();

        let second = ingest_page(&ingestor, &p, "docs", None).await.unwrap();
        assert!(!second.deduplicated);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn vectors_are_stored_per_chunk() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "embeddings": [[0.5, 0.25]]
            })))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let (pool, mut config) = setup(&tmp).await;
        config.embedding.provider = "ollama".to_string();
        config.embedding.model = Some("nomic-embed-text".to_string());
        config.embedding.dims = Some(2);
        config.embedding.url = Some(server.uri());
        config.embedding.batch_size = 1;
        config.embedding.max_retries = 0;
        let ingestor = SqliteIngestor::new(pool.clone(), &config).unwrap();

        let doc = ingest_page(&ingestor, &page("https://example.com/v", "Short page."), "docs", None)
            .await
            .unwrap();
        assert_eq!(doc.chunks, 1);

        let (model, dims, blob): (String, i64, Vec<u8>) = sqlx::query_as(
            "SELECT model, dims, vector FROM chunk_vectors WHERE document_id = ?",
        )
        .bind(&doc.id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(model, "nomic-embed-text");
        assert_eq!(dims, 2);
        assert_eq!(embedding::blob_to_vec(&blob), vec![0.5, 0.25]);
    }

    #[tokio::test]
    async fn empty_page_is_an_ingestion_error() {
        let tmp = TempDir::new().unwrap();
        let (pool, config) = setup(&tmp).await;
        let ingestor = SqliteIngestor::new(pool, &config).unwrap();

        let err = ingest_page(&ingestor, &page("https://example.com/empty", "Menu\n\n"), "docs", None)
            .await
            .unwrap_err();
        match err {
            CrawlError::Ingestion { url, .. } => assert_eq!(url, "https://example.com/empty"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
