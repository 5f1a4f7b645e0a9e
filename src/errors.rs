//! Error taxonomy for the ingestion pipeline.
//!
//! Every failure the pipeline can surface is an [`IngestError`] variant, and
//! every variant maps to exactly one [`ErrorClass`]:
//!
//! - `Fatal`: the generation moves to `Failed` immediately, no retries.
//! - `Transient`: retried with exponential backoff up to the configured
//!   bound, then escalated to `Fatal` via [`IngestError::RetriesExhausted`].
//! - `Stale`: the task carried a superseded generation; the result is
//!   discarded and never shown to the caller.
//!
//! Terminal failures are persisted as an [`ErrorRecord`] on the document so a
//! status query can expose the terminating cause.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{DocumentId, Generation, Stage};

/// Retry classification of an [`IngestError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Not retried; the generation fails with this cause.
    Fatal,
    /// Retried with backoff, then escalated.
    Transient,
    /// Superseded work; discarded silently.
    Stale,
}

/// Errors surfaced by the ingestion pipeline and its collaborators.
#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    /// The object store has no content under the submitted reference.
    /// Indicates a broken upload, so this is fatal rather than retried.
    #[error("raw content missing from object store: {content_ref}")]
    #[diagnostic(
        code(ragline::content_missing),
        help("Re-upload the document; the pipeline never retries a missing upload.")
    )]
    ContentMissing { content_ref: String },

    /// The chunker rejected the extracted text or its configuration.
    #[error("chunking failed: {message}")]
    #[diagnostic(code(ragline::chunking_failed))]
    ChunkingFailed { message: String },

    /// Embedding call failed in a way worth retrying (timeout, rate limit,
    /// connection reset).
    #[error("transient embedding failure: {message}")]
    #[diagnostic(
        code(ragline::embedding_transient),
        help("Retried automatically with exponential backoff.")
    )]
    EmbeddingTransient { message: String },

    /// Embedding provider rejected the input itself (malformed batch,
    /// unsupported content). Never retried.
    #[error("permanent embedding failure: {message}")]
    #[diagnostic(code(ragline::embedding_permanent))]
    EmbeddingPermanent { message: String },

    /// Vector index upsert or alias operation failed.
    #[error("vector index upsert failed: {message}")]
    #[diagnostic(
        code(ragline::index_upsert),
        help("Upserts are keyed by chunk id; replaying the stage is safe.")
    )]
    IndexUpsert { message: String },

    /// A generation is already active for this document and the concurrency
    /// policy is `Reject`.
    #[error("ingestion already in flight for {document_id} (generation {active})")]
    #[diagnostic(
        code(ragline::ingestion_in_flight),
        help("Wait for the active generation to finish, or submit under the Supersede policy.")
    )]
    IngestionInFlight {
        document_id: DocumentId,
        active: Generation,
    },

    /// The task was stamped with a generation that is no longer current.
    #[error("stale generation for {document_id}: task carries g{stamped}, current is g{current}")]
    #[diagnostic(code(ragline::stale_generation))]
    StaleGeneration {
        document_id: DocumentId,
        stamped: Generation,
        current: Generation,
    },

    /// An external call exceeded its bounded timeout.
    #[error("{what} timed out after {elapsed_ms}ms")]
    #[diagnostic(code(ragline::timeout))]
    Timeout { what: &'static str, elapsed_ms: u64 },

    /// Object store backend failure other than a missing key.
    #[error("object store error: {message}")]
    #[diagnostic(code(ragline::object_store))]
    ObjectStore { message: String },

    /// Status store backend failure.
    #[error("status store error: {message}")]
    #[diagnostic(code(ragline::status_store))]
    Store { message: String },

    /// A transient error exhausted its retry budget and is now terminal.
    #[error("{stage} stage exhausted {attempts} attempts; last error: {last}")]
    #[diagnostic(
        code(ragline::retries_exhausted),
        help("The document is Failed; an explicit re-submission starts a fresh generation.")
    )]
    RetriesExhausted {
        stage: Stage,
        attempts: u32,
        last: String,
    },

    /// A dispatched payload named a stage that is never executed directly.
    #[error("task names non-executable stage {stage}")]
    #[diagnostic(code(ragline::invalid_task))]
    InvalidTask { stage: Stage },

    /// JSON serialization/deserialization error in persisted state.
    #[error(transparent)]
    #[diagnostic(code(ragline::serde_json))]
    Serde(#[from] serde_json::Error),
}

impl IngestError {
    /// Classify this error for the dispatcher's retry policy.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            IngestError::ContentMissing { .. }
            | IngestError::ChunkingFailed { .. }
            | IngestError::EmbeddingPermanent { .. }
            | IngestError::IngestionInFlight { .. }
            | IngestError::RetriesExhausted { .. }
            | IngestError::InvalidTask { .. }
            | IngestError::Serde(_) => ErrorClass::Fatal,

            IngestError::EmbeddingTransient { .. }
            | IngestError::IndexUpsert { .. }
            | IngestError::Timeout { .. }
            | IngestError::ObjectStore { .. }
            | IngestError::Store { .. } => ErrorClass::Transient,

            IngestError::StaleGeneration { .. } => ErrorClass::Stale,
        }
    }

    /// Stable short code persisted alongside a failed generation.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::ContentMissing { .. } => "content_missing",
            IngestError::ChunkingFailed { .. } => "chunking_failed",
            IngestError::EmbeddingTransient { .. } => "embedding_transient",
            IngestError::EmbeddingPermanent { .. } => "embedding_permanent",
            IngestError::IndexUpsert { .. } => "index_upsert",
            IngestError::IngestionInFlight { .. } => "ingestion_in_flight",
            IngestError::StaleGeneration { .. } => "stale_generation",
            IngestError::Timeout { .. } => "timeout",
            IngestError::ObjectStore { .. } => "object_store",
            IngestError::Store { .. } => "status_store",
            IngestError::RetriesExhausted { .. } => "retries_exhausted",
            IngestError::InvalidTask { .. } => "invalid_task",
            IngestError::Serde(_) => "serde_json",
        }
    }

    /// Convenience constructor for status-store backend errors.
    pub fn store(message: impl Into<String>) -> Self {
        IngestError::Store {
            message: message.into(),
        }
    }
}

/// Serde-friendly record of the error that terminated a generation.
///
/// This is what the status store persists on a `Failed` document and what a
/// status query returns to the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    #[serde(default = "Utc::now")]
    pub when: DateTime<Utc>,
    /// Stage the generation was in when it failed.
    pub stage: Stage,
    /// Stable code, see [`IngestError::code`].
    pub code: String,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(stage: Stage, error: &IngestError) -> Self {
        Self {
            when: Utc::now(),
            stage,
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}
