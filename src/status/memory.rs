//! Volatile status store for tests and development.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::config::{ChunkingConfig, ConcurrencyPolicy};
use crate::errors::{ErrorRecord, IngestError};
use crate::types::{DocumentId, Generation, Stage};

use super::{ChunkRecord, DocumentRecord, RunRecord, StatusStore};

#[derive(Default)]
struct MemoryState {
    documents: FxHashMap<String, DocumentRecord>,
    runs: FxHashMap<(String, Generation), RunRecord>,
    /// BTreeMap keeps chunk rows ordered by sequence index.
    chunks: FxHashMap<(String, Generation), BTreeMap<usize, ChunkRecord>>,
}

/// In-memory [`StatusStore`] with the same CAS and keep-first semantics as
/// the durable backends.
#[derive(Default)]
pub struct MemoryStatusStore {
    state: RwLock<MemoryState>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn create_document(
        &self,
        document_id: &DocumentId,
        content_ref: &str,
    ) -> Result<(), IngestError> {
        let mut state = self.state.write();
        let now = Utc::now();
        state
            .documents
            .entry(document_id.as_str().to_string())
            .and_modify(|doc| {
                doc.content_ref = content_ref.to_string();
                doc.updated_at = now;
            })
            .or_insert_with(|| DocumentRecord {
                document_id: document_id.clone(),
                content_ref: content_ref.to_string(),
                stage: Stage::Pending,
                generation: 0,
                error: None,
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn load_document(
        &self,
        document_id: &DocumentId,
    ) -> Result<Option<DocumentRecord>, IngestError> {
        Ok(self.state.read().documents.get(document_id.as_str()).cloned())
    }

    async fn begin_generation(
        &self,
        document_id: &DocumentId,
        policy: ConcurrencyPolicy,
        chunking: &ChunkingConfig,
    ) -> Result<Generation, IngestError> {
        let mut state = self.state.write();
        let doc = state
            .documents
            .get_mut(document_id.as_str())
            .ok_or_else(|| IngestError::store(format!("unknown document: {document_id}")))?;

        if doc.has_active_generation() && policy == ConcurrencyPolicy::Reject {
            return Err(IngestError::IngestionInFlight {
                document_id: document_id.clone(),
                active: doc.generation,
            });
        }

        doc.generation += 1;
        doc.stage = Stage::Pending;
        doc.error = None;
        doc.updated_at = Utc::now();
        let generation = doc.generation;

        state.runs.insert(
            (document_id.as_str().to_string(), generation),
            RunRecord {
                document_id: document_id.clone(),
                generation,
                chunking: chunking.clone(),
                retries: FxHashMap::default(),
                created_at: Utc::now(),
            },
        );
        Ok(generation)
    }

    async fn load_run(
        &self,
        document_id: &DocumentId,
        generation: Generation,
    ) -> Result<Option<RunRecord>, IngestError> {
        Ok(self
            .state
            .read()
            .runs
            .get(&(document_id.as_str().to_string(), generation))
            .cloned())
    }

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
        let mut state = self.state.write();
        let Some(doc) = state.documents.get_mut(document_id.as_str()) else {
            return Ok(false);
        };
        if doc.generation != generation || doc.stage != expected {
            return Ok(false);
        }
        doc.stage = next;
        doc.error = error;
        doc.updated_at = Utc::now();
        Ok(true)
    }

    async fn insert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<(), IngestError> {
        let mut state = self.state.write();
        for chunk in chunks {
            let key = (chunk.document_id.as_str().to_string(), chunk.generation);
            state
                .chunks
                .entry(key)
                .or_default()
                .entry(chunk.index)
                .or_insert(chunk);
        }
        Ok(())
    }

    async fn chunks(
        &self,
        document_id: &DocumentId,
        generation: Generation,
    ) -> Result<Vec<ChunkRecord>, IngestError> {
        Ok(self
            .state
            .read()
            .chunks
            .get(&(document_id.as_str().to_string(), generation))
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn record_embedding(
        &self,
        document_id: &DocumentId,
        generation: Generation,
        index: usize,
        embedding: Vec<f32>,
    ) -> Result<(), IngestError> {
        let mut state = self.state.write();
        let chunk = state
            .chunks
            .get_mut(&(document_id.as_str().to_string(), generation))
            .and_then(|rows| rows.get_mut(&index))
            .ok_or_else(|| {
                IngestError::store(format!(
                    "no chunk {index} for {document_id} generation {generation}"
                ))
            })?;
        if chunk.embedding.is_none() {
            chunk.embedding = Some(embedding);
        }
        Ok(())
    }

    async fn pending_embeddings(
        &self,
        document_id: &DocumentId,
        generation: Generation,
    ) -> Result<usize, IngestError> {
        Ok(self
            .state
            .read()
            .chunks
            .get(&(document_id.as_str().to_string(), generation))
            .map(|rows| rows.values().filter(|c| c.embedding.is_none()).count())
            .unwrap_or(0))
    }

    async fn mark_indexed(
        &self,
        document_id: &DocumentId,
        generation: Generation,
        index: usize,
    ) -> Result<(), IngestError> {
        let mut state = self.state.write();
        let chunk = state
            .chunks
            .get_mut(&(document_id.as_str().to_string(), generation))
            .and_then(|rows| rows.get_mut(&index))
            .ok_or_else(|| {
                IngestError::store(format!(
                    "no chunk {index} for {document_id} generation {generation}"
                ))
            })?;
        chunk.indexed = true;
        Ok(())
    }

    async fn pending_index(
        &self,
        document_id: &DocumentId,
        generation: Generation,
    ) -> Result<usize, IngestError> {
        Ok(self
            .state
            .read()
            .chunks
            .get(&(document_id.as_str().to_string(), generation))
            .map(|rows| rows.values().filter(|c| !c.indexed).count())
            .unwrap_or(0))
    }

    async fn record_retry(
        &self,
        document_id: &DocumentId,
        generation: Generation,
        stage: Stage,
    ) -> Result<u32, IngestError> {
        let mut state = self.state.write();
        let run = state
            .runs
            .get_mut(&(document_id.as_str().to_string(), generation))
            .ok_or_else(|| {
                IngestError::store(format!("no run for {document_id} generation {generation}"))
            })?;
        let count = run.retries.entry(stage.encode().to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn purge_document(&self, document_id: &DocumentId) -> Result<(), IngestError> {
        let mut state = self.state.write();
        state.documents.remove(document_id.as_str());
        state
            .runs
            .retain(|(doc, _), _| doc != document_id.as_str());
        state
            .chunks
            .retain(|(doc, _), _| doc != document_id.as_str());
        Ok(())
    }
}
