//! Durable pipeline status: documents, runs, and chunk rows.
//!
//! The status store is the only state the pipeline keeps between task
//! invocations. Stage handlers are stateless; ordering and mutual exclusion
//! come from the row-level compare-and-set in
//! [`StatusStore::compare_and_set_stage`], and the per-generation barrier
//! counters ([`StatusStore::pending_embeddings`],
//! [`StatusStore::pending_index`]) gate advancement to the next stage.
//!
//! # Backends
//!
//! - [`MemoryStatusStore`]: volatile, for tests and development.
//! - [`SqliteStatusStore`]: durable, behind the `sqlite` feature.
//!
//! Every write is keyed on `(document, generation, ...)` so at-least-once
//! task delivery replays cleanly: chunk inserts are keep-first upserts,
//! embedding and index marks are idempotent, and a stale generation makes
//! every mutation a no-op reported back to the caller.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ChunkingConfig, ConcurrencyPolicy};
use crate::errors::{ErrorRecord, IngestError};
use crate::types::{DocumentId, Generation, Stage, chunk_id};

pub use memory::MemoryStatusStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStatusStore;

/// Pipeline-owned state of one document.
///
/// Business fields (title, permissions) belong to the external document
/// service; this record carries only what the pipeline mutates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: DocumentId,
    /// Object-store key of the raw upload.
    pub content_ref: String,
    pub stage: Stage,
    /// Current generation; 0 until the first submission.
    pub generation: Generation,
    pub error: Option<ErrorRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    /// Whether a non-terminal generation is currently running.
    #[must_use]
    pub fn has_active_generation(&self) -> bool {
        self.generation > 0 && !self.stage.is_terminal()
    }
}

/// One chunk of one document generation. Immutable once created except for
/// the embedding and indexed marks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub document_id: DocumentId,
    pub generation: Generation,
    /// Stable sequence index within the generation.
    pub index: usize,
    pub content: String,
    /// Set once the embed stage produced a vector for this chunk.
    pub embedding: Option<Vec<f32>>,
    /// Set once the vector is upserted into the generation's collection.
    pub indexed: bool,
}

impl ChunkRecord {
    pub fn new(
        document_id: DocumentId,
        generation: Generation,
        index: usize,
        content: impl Into<String>,
    ) -> Self {
        Self {
            document_id,
            generation,
            index,
            content: content.into(),
            embedding: None,
            indexed: false,
        }
    }

    /// Deterministic point id used for vector upserts.
    #[must_use]
    pub fn chunk_id(&self) -> String {
        chunk_id(&self.document_id, self.generation, self.index)
    }
}

/// Per-generation run bookkeeping: the chunking configuration the generation
/// was started with and the retry counts per stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub document_id: DocumentId,
    pub generation: Generation,
    pub chunking: ChunkingConfig,
    /// Stage name → attempts recorded.
    pub retries: rustc_hash::FxHashMap<String, u32>,
    pub created_at: DateTime<Utc>,
}

/// What a status query returns to the caller.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusView {
    pub stage: Stage,
    pub generation: Generation,
    pub error: Option<ErrorRecord>,
}

impl From<&DocumentRecord> for StatusView {
    fn from(doc: &DocumentRecord) -> Self {
        Self {
            stage: doc.stage,
            generation: doc.generation,
            error: doc.error.clone(),
        }
    }
}

/// Durable record of each document's pipeline state.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Ensure a document row exists, updating the content reference on
    /// re-submission. Never touches stage or generation.
    async fn create_document(
        &self,
        document_id: &DocumentId,
        content_ref: &str,
    ) -> Result<(), IngestError>;

    async fn load_document(
        &self,
        document_id: &DocumentId,
    ) -> Result<Option<DocumentRecord>, IngestError>;

    /// Start a new generation, serializing concurrent submissions.
    ///
    /// With [`ConcurrencyPolicy::Reject`] an active generation yields
    /// `IngestionInFlight`; with [`ConcurrencyPolicy::Supersede`] the counter
    /// increments and stale workers discard at write time. The new
    /// generation starts in `Pending` with the error cleared.
    async fn begin_generation(
        &self,
        document_id: &DocumentId,
        policy: ConcurrencyPolicy,
        chunking: &ChunkingConfig,
    ) -> Result<Generation, IngestError>;

    /// Load the run bookkeeping for a generation.
    async fn load_run(
        &self,
        document_id: &DocumentId,
        generation: Generation,
    ) -> Result<Option<RunRecord>, IngestError>;

    /// Row-level compare-and-set on the document's stage.
    ///
    /// Succeeds only when the stored generation matches `generation` and the
    /// stored stage matches `expected`; returns `false` otherwise, in which
    /// case the caller discards its work.
    async fn compare_and_set_stage(
        &self,
        document_id: &DocumentId,
        generation: Generation,
        expected: Stage,
        next: Stage,
        error: Option<ErrorRecord>,
    ) -> Result<bool, IngestError>;

    /// Persist chunk rows. Keyed on `(document, generation, index)` with
    /// keep-first semantics; replaying the chunk stage never duplicates or
    /// rewrites rows.
    async fn insert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<(), IngestError>;

    /// All chunks of a generation, ordered by sequence index.
    async fn chunks(
        &self,
        document_id: &DocumentId,
        generation: Generation,
    ) -> Result<Vec<ChunkRecord>, IngestError>;

    /// Attach a vector to a chunk. Keep-first: a replayed embed task cannot
    /// overwrite an existing vector.
    async fn record_embedding(
        &self,
        document_id: &DocumentId,
        generation: Generation,
        index: usize,
        embedding: Vec<f32>,
    ) -> Result<(), IngestError>;

    /// Chunks of the generation still missing a vector.
    async fn pending_embeddings(
        &self,
        document_id: &DocumentId,
        generation: Generation,
    ) -> Result<usize, IngestError>;

    /// Mark a chunk's vector as upserted. Idempotent.
    async fn mark_indexed(
        &self,
        document_id: &DocumentId,
        generation: Generation,
        index: usize,
    ) -> Result<(), IngestError>;

    /// Chunks of the generation not yet upserted into the vector index.
    async fn pending_index(
        &self,
        document_id: &DocumentId,
        generation: Generation,
    ) -> Result<usize, IngestError>;

    /// Record one retry for a stage of a generation, returning the new count.
    async fn record_retry(
        &self,
        document_id: &DocumentId,
        generation: Generation,
        stage: Stage,
    ) -> Result<u32, IngestError>;

    /// Remove the document row and everything hanging off it. Admin hook;
    /// the pipeline itself never deletes documents.
    async fn purge_document(&self, document_id: &DocumentId) -> Result<(), IngestError>;
}
