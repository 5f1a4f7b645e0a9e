//! SQLite-backed status store.
//!
//! The stage compare-and-set maps to a conditional `UPDATE` whose `WHERE`
//! clause checks both the stored generation and the expected stage; one
//! affected row means the transition won, zero means the caller is stale.
//! Barrier counters are plain `COUNT(*)` queries over partial indexes.
//!
//! When the `sqlite-migrations` feature is enabled (default), embedded
//! migrations (`sqlx::migrate!("./migrations")`) run on connect; disabling
//! the feature assumes external migration orchestration.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::instrument;

use crate::config::{ChunkingConfig, ConcurrencyPolicy};
use crate::errors::{ErrorRecord, IngestError};
use crate::types::{DocumentId, Generation, Stage};

use super::{ChunkRecord, DocumentRecord, RunRecord, StatusStore};

/// Durable [`StatusStore`] over a shared SQLite connection pool.
pub struct SqliteStatusStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStatusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStatusStore").finish()
    }
}

fn backend(context: &str) -> impl FnOnce(sqlx::Error) -> IngestError + '_ {
    move |err| IngestError::store(format!("{context}: {err}"))
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn decode_stage(raw: &str) -> Result<Stage, IngestError> {
    Stage::decode(raw).ok_or_else(|| IngestError::store(format!("corrupt stage value: {raw}")))
}

impl SqliteStatusStore {
    /// Connect (or create) a SQLite database at `database_url`, for example
    /// `sqlite://ragline.db` or `sqlite::memory:`.
    #[must_use = "status store must be used to persist pipeline state"]
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self, IngestError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(backend("parse database url"))?
            .create_if_missing(true);
        // An in-memory database exists per connection; a wider pool would
        // hand out fresh empty databases.
        let memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = SqlitePoolOptions::new()
            .max_connections(if memory { 1 } else { 5 })
            .connect_with(options)
            .await
            .map_err(backend("connect"))?;
        #[cfg(feature = "sqlite-migrations")]
        {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|err| IngestError::store(format!("migration failure: {err}")))?;
        }
        Ok(Self { pool })
    }

    fn row_to_document(row: &SqliteRow) -> Result<DocumentRecord, IngestError> {
        let error_json: Option<String> = row.get("error_json");
        let error = error_json
            .map(|raw| serde_json::from_str::<ErrorRecord>(&raw))
            .transpose()?;
        let stage: String = row.get("stage");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");
        Ok(DocumentRecord {
            document_id: DocumentId::new(row.get::<String, _>("id")),
            content_ref: row.get("content_ref"),
            stage: decode_stage(&stage)?,
            generation: row.get::<i64, _>("generation") as Generation,
            error,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        })
    }

    fn row_to_chunk(row: &SqliteRow) -> Result<ChunkRecord, IngestError> {
        let embedding_json: Option<String> = row.get("embedding_json");
        let embedding = embedding_json
            .map(|raw| serde_json::from_str::<Vec<f32>>(&raw))
            .transpose()?;
        Ok(ChunkRecord {
            document_id: DocumentId::new(row.get::<String, _>("document_id")),
            generation: row.get::<i64, _>("generation") as Generation,
            index: row.get::<i64, _>("chunk_index") as usize,
            content: row.get("content"),
            embedding,
            indexed: row.get::<i64, _>("indexed") != 0,
        })
    }
}

#[async_trait]
impl StatusStore for SqliteStatusStore {
    #[instrument(skip(self), err)]
    async fn create_document(
        &self,
        document_id: &DocumentId,
        content_ref: &str,
    ) -> Result<(), IngestError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO documents (id, content_ref, stage, generation, created_at, updated_at)
            VALUES (?1, ?2, 'pending', 0, ?3, ?3)
            ON CONFLICT(id) DO UPDATE SET content_ref = ?2, updated_at = ?3
            "#,
        )
        .bind(document_id.as_str())
        .bind(content_ref)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(backend("insert document"))?;
        Ok(())
    }

    async fn load_document(
        &self,
        document_id: &DocumentId,
    ) -> Result<Option<DocumentRecord>, IngestError> {
        let row = sqlx::query(
            r#"
            SELECT id, content_ref, stage, generation, error_json, created_at, updated_at
            FROM documents WHERE id = ?1
            "#,
        )
        .bind(document_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend("select document"))?;
        row.as_ref().map(Self::row_to_document).transpose()
    }

    #[instrument(skip(self, chunking), err)]
    async fn begin_generation(
        &self,
        document_id: &DocumentId,
        policy: ConcurrencyPolicy,
        chunking: &ChunkingConfig,
    ) -> Result<Generation, IngestError> {
        let mut tx = self.pool.begin().await.map_err(backend("tx begin"))?;

        let row = sqlx::query("SELECT stage, generation FROM documents WHERE id = ?1")
            .bind(document_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend("select for begin"))?
            .ok_or_else(|| IngestError::store(format!("unknown document: {document_id}")))?;

        let stage = decode_stage(&row.get::<String, _>("stage"))?;
        let current = row.get::<i64, _>("generation") as Generation;
        if current > 0 && !stage.is_terminal() && policy == ConcurrencyPolicy::Reject {
            return Err(IngestError::IngestionInFlight {
                document_id: document_id.clone(),
                active: current,
            });
        }

        let generation = current + 1;
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE documents
            SET generation = ?2, stage = 'pending', error_json = NULL, updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(document_id.as_str())
        .bind(generation as i64)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(backend("advance generation"))?;

        let chunking_json = serde_json::to_string(chunking)?;
        sqlx::query(
            r#"
            INSERT INTO runs (document_id, generation, chunking_json, retries_json, created_at)
            VALUES (?1, ?2, ?3, '{}', ?4)
            ON CONFLICT(document_id, generation) DO NOTHING
            "#,
        )
        .bind(document_id.as_str())
        .bind(generation as i64)
        .bind(&chunking_json)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(backend("insert run"))?;

        tx.commit().await.map_err(backend("tx commit"))?;
        Ok(generation)
    }

    async fn load_run(
        &self,
        document_id: &DocumentId,
        generation: Generation,
    ) -> Result<Option<RunRecord>, IngestError> {
        let row = sqlx::query(
            r#"
            SELECT chunking_json, retries_json, created_at
            FROM runs WHERE document_id = ?1 AND generation = ?2
            "#,
        )
        .bind(document_id.as_str())
        .bind(generation as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend("select run"))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let chunking: ChunkingConfig =
            serde_json::from_str(&row.get::<String, _>("chunking_json"))?;
        let retries: rustc_hash::FxHashMap<String, u32> =
            serde_json::from_str(&row.get::<String, _>("retries_json"))?;
        let created_at: String = row.get("created_at");
        Ok(Some(RunRecord {
            document_id: document_id.clone(),
            generation,
            chunking,
            retries,
            created_at: parse_timestamp(&created_at),
        }))
    }

    #[instrument(skip(self, error), err)]
    async fn compare_and_set_stage(
        &self,
        document_id: &DocumentId,
        generation: Generation,
        expected: Stage,
        next: Stage,
        error: Option<ErrorRecord>,
    ) -> Result<bool, IngestError> {
        if !expected.can_transition_to(next) {
            return Err(IngestError::store(format!(
                "illegal transition {expected} -> {next}"
            )));
        }
        let error_json = error.map(|record| serde_json::to_string(&record)).transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET stage = ?4, error_json = ?5, updated_at = ?6
            WHERE id = ?1 AND generation = ?2 AND stage = ?3
            "#,
        )
        .bind(document_id.as_str())
        .bind(generation as i64)
        .bind(expected.encode())
        .bind(next.encode())
        .bind(&error_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend("cas stage"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<(), IngestError> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(backend("tx begin"))?;
        for chunk in &chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (document_id, generation, chunk_index, content, indexed)
                VALUES (?1, ?2, ?3, ?4, 0)
                ON CONFLICT(document_id, generation, chunk_index) DO NOTHING
                "#,
            )
            .bind(chunk.document_id.as_str())
            .bind(chunk.generation as i64)
            .bind(chunk.index as i64)
            .bind(&chunk.content)
            .execute(&mut *tx)
            .await
            .map_err(backend("insert chunk"))?;
        }
        tx.commit().await.map_err(backend("tx commit"))?;
        Ok(())
    }

    async fn chunks(
        &self,
        document_id: &DocumentId,
        generation: Generation,
    ) -> Result<Vec<ChunkRecord>, IngestError> {
        let rows = sqlx::query(
            r#"
            SELECT document_id, generation, chunk_index, content, embedding_json, indexed
            FROM chunks
            WHERE document_id = ?1 AND generation = ?2
            ORDER BY chunk_index ASC
            "#,
        )
        .bind(document_id.as_str())
        .bind(generation as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend("select chunks"))?;
        rows.iter().map(Self::row_to_chunk).collect()
    }

    async fn record_embedding(
        &self,
        document_id: &DocumentId,
        generation: Generation,
        index: usize,
        embedding: Vec<f32>,
    ) -> Result<(), IngestError> {
        let embedding_json = serde_json::to_string(&embedding)?;
        // Keep-first: a replayed embed task never overwrites a stored vector.
        sqlx::query(
            r#"
            UPDATE chunks SET embedding_json = ?4
            WHERE document_id = ?1 AND generation = ?2 AND chunk_index = ?3
              AND embedding_json IS NULL
            "#,
        )
        .bind(document_id.as_str())
        .bind(generation as i64)
        .bind(index as i64)
        .bind(&embedding_json)
        .execute(&self.pool)
        .await
        .map_err(backend("record embedding"))?;
        Ok(())
    }

    async fn pending_embeddings(
        &self,
        document_id: &DocumentId,
        generation: Generation,
    ) -> Result<usize, IngestError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM chunks
            WHERE document_id = ?1 AND generation = ?2 AND embedding_json IS NULL
            "#,
        )
        .bind(document_id.as_str())
        .bind(generation as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(backend("count pending embeddings"))?;
        Ok(count as usize)
    }

    async fn mark_indexed(
        &self,
        document_id: &DocumentId,
        generation: Generation,
        index: usize,
    ) -> Result<(), IngestError> {
        sqlx::query(
            r#"
            UPDATE chunks SET indexed = 1
            WHERE document_id = ?1 AND generation = ?2 AND chunk_index = ?3
            "#,
        )
        .bind(document_id.as_str())
        .bind(generation as i64)
        .bind(index as i64)
        .execute(&self.pool)
        .await
        .map_err(backend("mark indexed"))?;
        Ok(())
    }

    async fn pending_index(
        &self,
        document_id: &DocumentId,
        generation: Generation,
    ) -> Result<usize, IngestError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM chunks
            WHERE document_id = ?1 AND generation = ?2 AND indexed = 0
            "#,
        )
        .bind(document_id.as_str())
        .bind(generation as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(backend("count pending index"))?;
        Ok(count as usize)
    }

    async fn record_retry(
        &self,
        document_id: &DocumentId,
        generation: Generation,
        stage: Stage,
    ) -> Result<u32, IngestError> {
        let mut tx = self.pool.begin().await.map_err(backend("tx begin"))?;
        let retries_json: String = sqlx::query_scalar(
            "SELECT retries_json FROM runs WHERE document_id = ?1 AND generation = ?2",
        )
        .bind(document_id.as_str())
        .bind(generation as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend("select retries"))?
        .ok_or_else(|| {
            IngestError::store(format!("no run for {document_id} generation {generation}"))
        })?;

        let mut retries: rustc_hash::FxHashMap<String, u32> =
            serde_json::from_str(&retries_json)?;
        let count = retries.entry(stage.encode().to_string()).or_insert(0);
        *count += 1;
        let count = *count;

        sqlx::query("UPDATE runs SET retries_json = ?3 WHERE document_id = ?1 AND generation = ?2")
            .bind(document_id.as_str())
            .bind(generation as i64)
            .bind(serde_json::to_string(&retries)?)
            .execute(&mut *tx)
            .await
            .map_err(backend("update retries"))?;
        tx.commit().await.map_err(backend("tx commit"))?;
        Ok(count)
    }

    #[instrument(skip(self), err)]
    async fn purge_document(&self, document_id: &DocumentId) -> Result<(), IngestError> {
        let mut tx = self.pool.begin().await.map_err(backend("tx begin"))?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?1")
            .bind(document_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend("delete chunks"))?;
        sqlx::query("DELETE FROM runs WHERE document_id = ?1")
            .bind(document_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend("delete runs"))?;
        sqlx::query("DELETE FROM documents WHERE id = ?1")
            .bind(document_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend("delete document"))?;
        tx.commit().await.map_err(backend("tx commit"))?;
        Ok(())
    }
}
