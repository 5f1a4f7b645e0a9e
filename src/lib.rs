//! # ragline
//!
//! An asynchronous, multi-stage document ingestion pipeline for RAG corpora:
//! raw uploads are chunked, embedded, and indexed into a vector store, with
//! durable per-document status tracking the whole way.
//!
//! ## Model
//!
//! Each submission starts a **generation** of the document. A generation
//! walks a forward-only stage machine
//! (`Pending → Chunking → Embedding → Indexing → Ready`, `Failed` from any
//! non-terminal stage) persisted in a [`status::StatusStore`]; transitions are
//! row-level compare-and-set operations, so any number of workers can race on
//! the same task and exactly one advances the document.
//!
//! Stage tasks are delivered at-least-once by a [`dispatcher::TaskDispatcher`]
//! and every stage handler is idempotent: chunk rows, vectors, and index
//! upserts are keyed on `(document, generation, index)` with keep-first
//! writes. Re-submitting a document supersedes the running generation; stale
//! workers notice the bumped counter before committing and discard.
//!
//! A generation becomes searchable only at the very end, when the document's
//! alias is atomically swapped onto the freshly built vector collection.
//! Searches either see the complete old generation or the complete new one.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ragline::config::PipelineConfig;
//! use ragline::dispatcher::LocalDispatcher;
//! use ragline::embed::MockEmbeddingProvider;
//! use ragline::index::MemoryVectorIndex;
//! use ragline::object_store::{MemoryObjectStore, ObjectStore};
//! use ragline::pipeline::Pipeline;
//! use ragline::status::MemoryStatusStore;
//! use ragline::types::DocumentId;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let objects = Arc::new(MemoryObjectStore::new());
//! objects.put("uploads/doc-1", b"hello world".to_vec()).await?;
//!
//! let pipeline = Arc::new(Pipeline::new(
//!     PipelineConfig::default(),
//!     Arc::new(MemoryStatusStore::new()),
//!     objects,
//!     Arc::new(MockEmbeddingProvider::new()),
//!     Arc::new(MemoryVectorIndex::new()),
//! ));
//! let dispatcher = LocalDispatcher::new(Arc::clone(&pipeline), 4);
//!
//! let doc = DocumentId::from("doc-1");
//! dispatcher.submit(&doc, "uploads/doc-1").await?;
//! dispatcher.wait_idle(Duration::from_secs(5)).await;
//!
//! let status = pipeline.get_status(&doc).await?;
//! println!("{status:?}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`types`]: document ids, generations, the [`types::Stage`] machine.
//! - [`errors`]: the [`errors::IngestError`] taxonomy and retry classes.
//! - [`config`]: pipeline, chunking, and concurrency configuration.
//! - [`retry`]: bounded exponential backoff policy.
//! - [`chunker`]: deterministic fixed-window text chunking.
//! - [`object_store`]: raw content storage behind a small trait.
//! - [`embed`]: embedding providers (HTTP and a deterministic mock).
//! - [`index`]: vector index trait with collections and alias swaps.
//! - [`status`]: durable status stores (in-memory and SQLite).
//! - [`pipeline`]: the stage orchestrator.
//! - [`dispatcher`]: at-least-once task dispatch with bounded retries.
//! - [`events`]: diagnostic event stream.
//! - [`telemetry`]: tracing setup.

pub mod chunker;
pub mod config;
pub mod dispatcher;
pub mod embed;
pub mod errors;
pub mod events;
pub mod index;
pub mod object_store;
pub mod pipeline;
pub mod retry;
pub mod status;
pub mod telemetry;
pub mod types;

pub use config::{ChunkingConfig, ConcurrencyPolicy, PipelineConfig};
pub use errors::{ErrorClass, ErrorRecord, IngestError};
pub use pipeline::{Pipeline, StageOutcome, Submission};
pub use retry::RetryPolicy;
pub use status::{StatusStore, StatusView};
pub use types::{DocumentId, Generation, Stage, TaskPayload};
