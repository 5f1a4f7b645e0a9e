//! The ingestion pipeline core.
//!
//! [`Pipeline`] orchestrates `chunk → embed → index` for one document
//! generation and owns every status-store mutation. It is stateless across
//! invocations: a stage handler reads the document row, refuses to run unless
//! the document sits in the expected predecessor stage, does its idempotent
//! work, and advances the stage with a compare-and-set. Two racing workers
//! can both execute a stage; only one CAS wins, and the loser discards.
//!
//! # At-least-once tolerance
//!
//! The task dispatcher may deliver any `(document, generation, stage)` task
//! more than once. Every write a handler performs is keyed:
//!
//! - chunk rows on `(document, generation, index)` with keep-first upserts,
//! - vectors on the deterministic chunk id,
//! - stage transitions on `(generation, expected stage)`.
//!
//! Replays therefore converge on the same end state without duplication.
//!
//! # Supersession
//!
//! Superseding is the only cancellation mechanism: a new submission bumps the
//! generation counter, and in-flight workers notice the stale stamp when they
//! compare it against the document's current generation before committing,
//! discarding their work silently.

use std::future::Future;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::chunker::chunk_text;
use crate::config::{ChunkingConfig, PipelineConfig};
use crate::embed::{EmbedError, EmbeddingProvider};
use crate::errors::{ErrorRecord, IngestError};
use crate::events::{EventSink, PipelineEvent};
use crate::index::{IndexError, ScoredPoint, VectorIndex};
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::status::{ChunkRecord, DocumentRecord, StatusStore, StatusView};
use crate::types::{DocumentId, Generation, Stage, TaskPayload};

/// Result of executing one stage task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage completed and the generation advanced; dispatch `next`.
    Advanced { next: TaskPayload },
    /// The generation reached `Ready`.
    Completed,
    /// Stale or already-done work; nothing was written.
    Discarded,
}

/// Accepted submission: the generation that was started and the first task
/// to hand to the dispatcher.
#[derive(Clone, Debug)]
pub struct Submission {
    pub generation: Generation,
    pub task: TaskPayload,
}

/// Stateless orchestrator over the pipeline's collaborators.
pub struct Pipeline {
    config: PipelineConfig,
    status: Arc<dyn StatusStore>,
    objects: Arc<dyn ObjectStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        status: Arc<dyn StatusStore>,
        objects: Arc<dyn ObjectStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            config,
            status,
            objects,
            embedder,
            index,
            sinks: Vec::new(),
        }
    }

    /// Register a diagnostic event sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn emit(&self, event: PipelineEvent) {
        for sink in &self.sinks {
            sink.handle(&event);
        }
    }

    /// Collection holding one generation's vectors.
    fn collection_name(&self, document_id: &DocumentId, generation: Generation) -> String {
        format!(
            "{}.{}.g{}",
            self.config.collection_prefix, document_id, generation
        )
    }

    /// Per-document alias that search traffic resolves through.
    fn alias_name(&self, document_id: &DocumentId) -> String {
        format!("{}.{}", self.config.collection_prefix, document_id)
    }

    /// Wrap an external call in the configured bounded timeout.
    async fn timed<T, E, Fut>(
        &self,
        what: &'static str,
        fut: Fut,
    ) -> Result<Result<T, E>, IngestError>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        tokio::time::timeout(self.config.call_timeout, fut)
            .await
            .map_err(|_| IngestError::Timeout {
                what,
                elapsed_ms: self.config.call_timeout.as_millis() as u64,
            })
    }

    /// Accept a document for ingestion using the configured chunking.
    pub async fn submit(
        &self,
        document_id: &DocumentId,
        content_ref: &str,
    ) -> Result<Submission, IngestError> {
        let chunking = self.config.chunking.clone();
        self.submit_with_chunking(document_id, content_ref, chunking)
            .await
    }

    /// Accept a document for ingestion with a per-generation chunking
    /// configuration, persisted with the run so replays stay deterministic.
    #[instrument(skip(self, chunking), err)]
    pub async fn submit_with_chunking(
        &self,
        document_id: &DocumentId,
        content_ref: &str,
        chunking: ChunkingConfig,
    ) -> Result<Submission, IngestError> {
        self.status.create_document(document_id, content_ref).await?;
        let generation = self
            .status
            .begin_generation(document_id, self.config.concurrency, &chunking)
            .await?;
        self.emit(PipelineEvent::GenerationStarted {
            document_id: document_id.clone(),
            generation,
        });
        Ok(Submission {
            generation,
            task: TaskPayload::new(document_id.clone(), generation, Stage::Chunking),
        })
    }

    /// Latest durable state of a document, or `None` if it was never
    /// submitted (or has been purged).
    pub async fn get_status(
        &self,
        document_id: &DocumentId,
    ) -> Result<Option<StatusView>, IngestError> {
        Ok(self
            .status
            .load_document(document_id)
            .await?
            .as_ref()
            .map(StatusView::from))
    }

    /// Similarity search through the document's alias. Only a `Ready`
    /// generation is ever visible here.
    pub async fn search(
        &self,
        document_id: &DocumentId,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredPoint>, IngestError> {
        self.index
            .search(&self.alias_name(document_id), query, top_k)
            .await
            .map_err(index_err)
    }

    /// Admin deletion hook: drop every generation collection, the status
    /// rows, and the raw upload. The pipeline never calls this on its own.
    #[instrument(skip(self), err)]
    pub async fn purge(&self, document_id: &DocumentId) -> Result<(), IngestError> {
        let Some(doc) = self.status.load_document(document_id).await? else {
            return Ok(());
        };
        for generation in 1..=doc.generation {
            self.index
                .delete_collection(&self.collection_name(document_id, generation))
                .await
                .map_err(index_err)?;
        }
        self.status.purge_document(document_id).await?;
        self.objects
            .delete(&doc.content_ref)
            .await
            .map_err(object_err)?;
        Ok(())
    }

    /// Dispatcher entry point: execute one stage task.
    #[instrument(skip(self), fields(task = %task), err)]
    pub async fn handle_task(&self, task: &TaskPayload) -> Result<StageOutcome, IngestError> {
        if !matches!(task.stage, Stage::Chunking | Stage::Embedding | Stage::Indexing) {
            return Err(IngestError::InvalidTask { stage: task.stage });
        }
        let Some(doc) = self.status.load_document(&task.document_id).await? else {
            // The document was purged while the task sat in the queue.
            warn!(document = %task.document_id, "task for unknown document discarded");
            return Ok(StageOutcome::Discarded);
        };
        if doc.generation != task.generation {
            self.discard_stale(task, doc.generation);
            return Ok(StageOutcome::Discarded);
        }
        match task.stage {
            Stage::Chunking => self.run_chunking(task, doc).await,
            Stage::Embedding => self.run_embedding(task, doc).await,
            Stage::Indexing => self.run_indexing(task, doc).await,
            _ => unreachable!("validated above"),
        }
    }

    /// Move a generation to `Failed`, recording the terminating cause.
    ///
    /// No-op if the generation was superseded or already terminal.
    #[instrument(skip(self, error), err)]
    pub async fn fail(
        &self,
        document_id: &DocumentId,
        generation: Generation,
        error: &IngestError,
    ) -> Result<(), IngestError> {
        loop {
            let Some(doc) = self.status.load_document(document_id).await? else {
                return Ok(());
            };
            if doc.generation != generation || doc.stage.is_terminal() {
                return Ok(());
            }
            let record = ErrorRecord::new(doc.stage, error);
            if self
                .status
                .compare_and_set_stage(document_id, generation, doc.stage, Stage::Failed, Some(record))
                .await?
            {
                self.emit(PipelineEvent::GenerationFailed {
                    document_id: document_id.clone(),
                    generation,
                    stage: doc.stage,
                    code: error.code().to_string(),
                });
                return Ok(());
            }
            // Lost a race against another transition; re-read and retry.
        }
    }

    fn discard_stale(&self, task: &TaskPayload, current: Generation) {
        debug!(task = %task, current, "stale generation, discarding");
        self.emit(PipelineEvent::StaleDiscarded {
            document_id: task.document_id.clone(),
            stamped: task.generation,
            current,
        });
    }

    /// Re-check the generation stamp immediately before committing writes.
    async fn still_current(&self, task: &TaskPayload) -> Result<bool, IngestError> {
        let Some(doc) = self.status.load_document(&task.document_id).await? else {
            return Ok(false);
        };
        if doc.generation != task.generation {
            self.discard_stale(task, doc.generation);
            return Ok(false);
        }
        Ok(true)
    }

    async fn advance(
        &self,
        task: &TaskPayload,
        from: Stage,
        to: Stage,
    ) -> Result<bool, IngestError> {
        let moved = self
            .status
            .compare_and_set_stage(&task.document_id, task.generation, from, to, None)
            .await?;
        if moved {
            self.emit(PipelineEvent::StageChanged {
                document_id: task.document_id.clone(),
                generation: task.generation,
                from,
                to,
            });
        }
        Ok(moved)
    }

    async fn run_chunking(
        &self,
        task: &TaskPayload,
        doc: DocumentRecord,
    ) -> Result<StageOutcome, IngestError> {
        match doc.stage {
            // `Chunking` is a crash replay mid-stage: the work below is
            // idempotent and the fetch simply runs again.
            Stage::Pending | Stage::Chunking => {}
            _ => return Ok(StageOutcome::Discarded),
        }

        // The raw content must be confirmed present before the document
        // leaves `Pending`; a missing upload fails the generation without
        // ever recording a stage transition.
        let bytes = match self
            .timed("object store get", self.objects.get(&doc.content_ref))
            .await?
        {
            Ok(bytes) => bytes,
            Err(ObjectStoreError::NotFound { key }) => {
                return Err(IngestError::ContentMissing { content_ref: key });
            }
            Err(err) => return Err(object_err(err)),
        };
        let text = String::from_utf8(bytes).map_err(|err| IngestError::ChunkingFailed {
            message: format!("content is not valid UTF-8: {err}"),
        })?;

        if doc.stage == Stage::Pending
            && !self.advance(task, Stage::Pending, Stage::Chunking).await?
        {
            // Another worker claimed the transition; replay-safe to stop.
            return Ok(StageOutcome::Discarded);
        }

        // The generation's persisted chunking config keeps re-runs
        // byte-identical even if defaults changed since submission.
        let chunking = self
            .status
            .load_run(&task.document_id, task.generation)
            .await?
            .map(|run| run.chunking)
            .unwrap_or_else(|| self.config.chunking.clone());
        let passages = chunk_text(&text, &chunking)?;
        let records: Vec<ChunkRecord> = passages
            .into_iter()
            .enumerate()
            .map(|(index, content)| {
                ChunkRecord::new(task.document_id.clone(), task.generation, index, content)
            })
            .collect();

        if !self.still_current(task).await? {
            return Ok(StageOutcome::Discarded);
        }
        self.status.insert_chunks(records).await?;

        if !self.advance(task, Stage::Chunking, Stage::Embedding).await? {
            return Ok(StageOutcome::Discarded);
        }
        let next = TaskPayload::new(task.document_id.clone(), task.generation, Stage::Embedding);
        Ok(StageOutcome::Advanced { next })
    }

    async fn run_embedding(
        &self,
        task: &TaskPayload,
        doc: DocumentRecord,
    ) -> Result<StageOutcome, IngestError> {
        if doc.stage != Stage::Embedding {
            return Ok(StageOutcome::Discarded);
        }

        let chunks = self.status.chunks(&task.document_id, task.generation).await?;
        let pending: Vec<&ChunkRecord> =
            chunks.iter().filter(|c| c.embedding.is_none()).collect();

        for batch in pending.chunks(self.config.embed_batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let vectors = self.embed_with_retry(task, &texts).await?;
            if !self.still_current(task).await? {
                return Ok(StageOutcome::Discarded);
            }
            for (chunk, vector) in batch.iter().zip(vectors) {
                self.status
                    .record_embedding(&task.document_id, task.generation, chunk.index, vector)
                    .await?;
            }
        }

        let remaining = self
            .status
            .pending_embeddings(&task.document_id, task.generation)
            .await?;
        if remaining != 0 {
            return Err(IngestError::store(format!(
                "embedding barrier not satisfied: {remaining} chunks still pending"
            )));
        }

        if !self.advance(task, Stage::Embedding, Stage::Indexing).await? {
            return Ok(StageOutcome::Discarded);
        }
        let next = TaskPayload::new(task.document_id.clone(), task.generation, Stage::Indexing);
        Ok(StageOutcome::Advanced { next })
    }

    /// Embed one batch, retrying transient failures with backoff up to the
    /// configured budget, then escalating to a fatal `RetriesExhausted`.
    async fn embed_with_retry(
        &self,
        task: &TaskPayload,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, IngestError> {
        let policy = &self.config.retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let transient = match self
                .timed("embedding call", self.embedder.embed(texts))
                .await
            {
                Ok(Ok(vectors)) => {
                    if vectors.len() != texts.len() {
                        return Err(IngestError::EmbeddingPermanent {
                            message: format!(
                                "provider returned {} vectors for {} inputs",
                                vectors.len(),
                                texts.len()
                            ),
                        });
                    }
                    return Ok(vectors);
                }
                Ok(Err(EmbedError::Permanent(message))) => {
                    return Err(IngestError::EmbeddingPermanent { message });
                }
                Ok(Err(EmbedError::Transient(message))) => {
                    IngestError::EmbeddingTransient { message }
                }
                Err(timeout) => timeout,
            };

            if !policy.allows(attempt) {
                return Err(IngestError::RetriesExhausted {
                    stage: Stage::Embedding,
                    attempts: attempt,
                    last: transient.to_string(),
                });
            }
            let recorded = self
                .status
                .record_retry(&task.document_id, task.generation, Stage::Embedding)
                .await?;
            let delay = policy.delay_for(attempt);
            self.emit(PipelineEvent::RetryScheduled {
                document_id: task.document_id.clone(),
                generation: task.generation,
                stage: Stage::Embedding,
                attempt: recorded,
                delay_ms: delay.as_millis() as u64,
            });
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_indexing(
        &self,
        task: &TaskPayload,
        doc: DocumentRecord,
    ) -> Result<StageOutcome, IngestError> {
        if doc.stage != Stage::Indexing {
            return Ok(StageOutcome::Discarded);
        }

        let collection = self.collection_name(&task.document_id, task.generation);
        self.timed("index ensure collection", self.index.ensure_collection(&collection))
            .await?
            .map_err(index_err)?;

        let chunks = self.status.chunks(&task.document_id, task.generation).await?;
        if !self.still_current(task).await? {
            return Ok(StageOutcome::Discarded);
        }
        for chunk in chunks.iter().filter(|c| !c.indexed) {
            let Some(vector) = chunk.embedding.clone() else {
                return Err(IngestError::store(format!(
                    "chunk {} reached the index stage without a vector",
                    chunk.index
                )));
            };
            let payload = json!({
                "document_id": chunk.document_id,
                "generation": chunk.generation,
                "chunk_index": chunk.index,
                "content": chunk.content,
            });
            self.timed(
                "index upsert",
                self.index.upsert(&collection, &chunk.chunk_id(), vector, payload),
            )
            .await?
            .map_err(index_err)?;
            self.status
                .mark_indexed(&task.document_id, task.generation, chunk.index)
                .await?;
        }

        let remaining = self
            .status
            .pending_index(&task.document_id, task.generation)
            .await?;
        if remaining != 0 {
            return Err(IngestError::store(format!(
                "index barrier not satisfied: {remaining} chunks still pending"
            )));
        }

        // The alias moves only after the transition to `Ready` wins; a worker
        // superseded mid-stage never redirects reads or deletes a collection.
        if !self.advance(task, Stage::Indexing, Stage::Ready).await? {
            return Ok(StageOutcome::Discarded);
        }

        let alias = self.alias_name(&task.document_id);
        self.timed("index alias swap", self.index.swap_alias(&alias, &collection))
            .await?
            .map_err(index_err)?;
        self.emit(PipelineEvent::AliasSwapped {
            document_id: task.document_id.clone(),
            generation: task.generation,
            alias,
            collection,
        });

        // Superseded generations are no longer reachable through the alias;
        // drop their collections.
        for generation in 1..task.generation {
            self.index
                .delete_collection(&self.collection_name(&task.document_id, generation))
                .await
                .map_err(index_err)?;
        }

        Ok(StageOutcome::Completed)
    }
}

fn index_err(err: IndexError) -> IngestError {
    IngestError::IndexUpsert {
        message: err.to_string(),
    }
}

fn object_err(err: ObjectStoreError) -> IngestError {
    IngestError::ObjectStore {
        message: err.to_string(),
    }
}
