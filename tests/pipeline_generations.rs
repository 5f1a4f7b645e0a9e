//! Concurrent re-ingestion: supersession, rejection, stale-task discards,
//! and alias movement across generations.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::{IDLE_TIMEOUT, doc, fast_config, harness, upload};
use ragline::config::{ChunkingConfig, ConcurrencyPolicy};
use ragline::embed::MockEmbeddingProvider;
use ragline::errors::IngestError;
use ragline::events::PipelineEvent;
use ragline::index::{IndexError, MemoryVectorIndex, ScoredPoint, VectorIndex};
use ragline::object_store::{MemoryObjectStore, ObjectStore};
use ragline::pipeline::{Pipeline, StageOutcome};
use ragline::status::{MemoryStatusStore, StatusStore};
use ragline::types::{DocumentId, Stage, TaskPayload};
use serde_json::Value;

#[tokio::test]
async fn resubmission_supersedes_and_task_of_old_generation_discards() {
    let h = harness(fast_config(), MockEmbeddingProvider::new());
    upload(&h, "uploads/doc", "first version of the document").await;

    // Start generation 1 but do not run it yet.
    let first = h.pipeline.submit(&doc("doc"), "uploads/doc").await.unwrap();
    assert_eq!(first.generation, 1);

    // Supersede before any stage executed.
    upload(&h, "uploads/doc", "second version of the document").await;
    let second = h.pipeline.submit(&doc("doc"), "uploads/doc").await.unwrap();
    assert_eq!(second.generation, 2);

    // The generation-1 chunk task is now stale and does nothing.
    let outcome = h.pipeline.handle_task(&first.task).await.unwrap();
    assert_eq!(outcome, StageOutcome::Discarded);
    assert!(h.events.snapshot().iter().any(|e| matches!(
        e,
        PipelineEvent::StaleDiscarded { stamped: 1, current: 2, .. }
    )));

    // Generation 2 runs to completion untouched.
    let mut task = second.task;
    loop {
        match h.pipeline.handle_task(&task).await.unwrap() {
            StageOutcome::Advanced { next } => task = next,
            StageOutcome::Completed => break,
            StageOutcome::Discarded => panic!("current generation must not discard"),
        }
    }
    let status = h.pipeline.get_status(&doc("doc")).await.unwrap().unwrap();
    assert_eq!(status.stage, Stage::Ready);
    assert_eq!(status.generation, 2);
}

#[tokio::test]
async fn supersession_mid_flight_discards_before_commit() {
    let h = harness(fast_config(), MockEmbeddingProvider::new());
    upload(&h, "uploads/doc", "original content").await;

    let first = h.pipeline.submit(&doc("doc"), "uploads/doc").await.unwrap();
    // Run chunking for generation 1, leaving it parked in Embedding.
    let StageOutcome::Advanced { next: embed_task } =
        h.pipeline.handle_task(&first.task).await.unwrap()
    else {
        panic!("chunking should advance");
    };

    // A new submission bumps the generation while the embed task is queued.
    let second = h.pipeline.submit(&doc("doc"), "uploads/doc").await.unwrap();
    assert_eq!(second.generation, 2);

    let outcome = h.pipeline.handle_task(&embed_task).await.unwrap();
    assert_eq!(outcome, StageOutcome::Discarded);

    // Nothing from generation 1 leaked into the index.
    assert_eq!(h.index.point_count("ragline.doc.g1"), 0);
}

#[tokio::test]
async fn reject_policy_refuses_submission_while_a_generation_is_active() {
    let config = fast_config().with_concurrency(ConcurrencyPolicy::Reject);
    let h = harness(config, MockEmbeddingProvider::new());
    upload(&h, "uploads/doc", "contents").await;

    let first = h.pipeline.submit(&doc("doc"), "uploads/doc").await.unwrap();
    let err = h.pipeline.submit(&doc("doc"), "uploads/doc").await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::IngestionInFlight { active: 1, .. }
    ));

    // Drive generation 1 to Ready; a terminal stage frees the document.
    let mut task = first.task;
    loop {
        match h.pipeline.handle_task(&task).await.unwrap() {
            StageOutcome::Advanced { next } => task = next,
            StageOutcome::Completed => break,
            StageOutcome::Discarded => panic!("nothing to discard here"),
        }
    }
    let second = h.pipeline.submit(&doc("doc"), "uploads/doc").await.unwrap();
    assert_eq!(second.generation, 2);
}

#[tokio::test]
async fn alias_moves_to_the_new_generation_and_old_collection_is_dropped() {
    let h = harness(fast_config(), MockEmbeddingProvider::new());
    upload(&h, "uploads/doc", "generation one text").await;

    h.dispatcher.submit(&doc("doc"), "uploads/doc").await.unwrap();
    assert!(h.dispatcher.wait_idle(IDLE_TIMEOUT).await);
    assert_eq!(
        h.index.resolve_alias("ragline.doc").await.unwrap().as_deref(),
        Some("ragline.doc.g1")
    );

    upload(&h, "uploads/doc", "generation two text").await;
    h.dispatcher.submit(&doc("doc"), "uploads/doc").await.unwrap();
    assert!(h.dispatcher.wait_idle(IDLE_TIMEOUT).await);

    assert_eq!(
        h.index.resolve_alias("ragline.doc").await.unwrap().as_deref(),
        Some("ragline.doc.g2")
    );
    // The superseded generation's collection was cleaned up after the swap.
    assert_eq!(h.index.collection_names(), vec!["ragline.doc.g2".to_string()]);

    let swaps: Vec<String> = h
        .events
        .snapshot()
        .into_iter()
        .filter_map(|event| match event {
            PipelineEvent::AliasSwapped { collection, .. } => Some(collection),
            _ => None,
        })
        .collect();
    assert_eq!(swaps, vec!["ragline.doc.g1".to_string(), "ragline.doc.g2".to_string()]);

    h.dispatcher.shutdown().await;
}

#[tokio::test]
async fn old_generation_stays_searchable_until_the_new_one_is_ready() {
    let h = harness(fast_config(), MockEmbeddingProvider::new());
    upload(&h, "uploads/doc", "the original searchable text").await;

    h.dispatcher.submit(&doc("doc"), "uploads/doc").await.unwrap();
    assert!(h.dispatcher.wait_idle(IDLE_TIMEOUT).await);

    // Generation 2 submitted but deliberately not executed yet.
    upload(&h, "uploads/doc", "the replacement text").await;
    let second = h.pipeline.submit(&doc("doc"), "uploads/doc").await.unwrap();

    // Search still resolves to the complete generation 1.
    let hits = h.pipeline.search(&doc("doc"), &[1.0; 8], 5).await.unwrap();
    assert!(hits.iter().all(|hit| hit.id.starts_with("doc:g1:")));
    assert!(!hits.is_empty());

    // After generation 2 completes, only its points are visible.
    let mut task = second.task;
    loop {
        match h.pipeline.handle_task(&task).await.unwrap() {
            StageOutcome::Advanced { next } => task = next,
            StageOutcome::Completed => break,
            StageOutcome::Discarded => panic!("current generation must not discard"),
        }
    }
    let hits = h.pipeline.search(&doc("doc"), &[1.0; 8], 5).await.unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|hit| hit.id.starts_with("doc:g2:")));

    h.dispatcher.shutdown().await;
}

/// Index that supersedes the document through the status store the first
/// time a generation-2 vector lands, standing in for a re-submission that
/// races the index stage after its last staleness check.
struct SupersedeOnUpsert {
    inner: Arc<MemoryVectorIndex>,
    status: Arc<MemoryStatusStore>,
    document: DocumentId,
    fired: AtomicBool,
}

#[async_trait]
impl VectorIndex for SupersedeOnUpsert {
    async fn ensure_collection(&self, collection: &str) -> Result<(), IndexError> {
        self.inner.ensure_collection(collection).await
    }

    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: Vec<f32>,
        payload: Value,
    ) -> Result<(), IndexError> {
        if collection.ends_with(".g2") && !self.fired.swap(true, Ordering::SeqCst) {
            self.status
                .begin_generation(
                    &self.document,
                    ConcurrencyPolicy::Supersede,
                    &ChunkingConfig::default(),
                )
                .await
                .expect("supersession must start");
        }
        self.inner.upsert(collection, id, vector, payload).await
    }

    async fn swap_alias(&self, alias: &str, collection: &str) -> Result<(), IndexError> {
        self.inner.swap_alias(alias, collection).await
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, IndexError> {
        self.inner.resolve_alias(alias).await
    }

    async fn delete_collection(&self, collection: &str) -> Result<(), IndexError> {
        self.inner.delete_collection(collection).await
    }

    async fn search(
        &self,
        alias: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredPoint>, IndexError> {
        self.inner.search(alias, query, top_k).await
    }
}

async fn drive(pipeline: &Pipeline, mut task: TaskPayload) -> StageOutcome {
    loop {
        match pipeline.handle_task(&task).await.unwrap() {
            StageOutcome::Advanced { next } => task = next,
            outcome => return outcome,
        }
    }
}

#[tokio::test]
async fn supersession_during_index_upserts_leaves_alias_on_ready_generation() {
    let objects = Arc::new(MemoryObjectStore::new());
    objects
        .put("uploads/doc", b"text that survives a mid-index race".to_vec())
        .await
        .unwrap();
    let status = Arc::new(MemoryStatusStore::new());
    let inner = Arc::new(MemoryVectorIndex::new());
    let index = Arc::new(SupersedeOnUpsert {
        inner: Arc::clone(&inner),
        status: Arc::clone(&status),
        document: doc("doc"),
        fired: AtomicBool::new(false),
    });
    let pipeline = Pipeline::new(
        fast_config(),
        Arc::clone(&status) as Arc<dyn StatusStore>,
        Arc::clone(&objects) as Arc<dyn ObjectStore>,
        Arc::new(MockEmbeddingProvider::new()),
        index as Arc<dyn VectorIndex>,
    );

    // Generation 1 completes; the alias serves its collection.
    let first = pipeline.submit(&doc("doc"), "uploads/doc").await.unwrap();
    assert_eq!(drive(&pipeline, first.task).await, StageOutcome::Completed);
    assert_eq!(
        inner.resolve_alias("ragline.doc").await.unwrap().as_deref(),
        Some("ragline.doc.g1")
    );

    // Generation 2 is superseded while its vectors are being upserted; the
    // losing worker must not commit anything visible.
    let second = pipeline.submit(&doc("doc"), "uploads/doc").await.unwrap();
    assert_eq!(second.generation, 2);
    assert_eq!(drive(&pipeline, second.task).await, StageOutcome::Discarded);

    assert_eq!(
        inner.resolve_alias("ragline.doc").await.unwrap().as_deref(),
        Some("ragline.doc.g1")
    );
    assert!(inner.collection_names().contains(&"ragline.doc.g1".to_string()));
    let view = pipeline.get_status(&doc("doc")).await.unwrap().unwrap();
    assert_eq!(view.generation, 3);
    assert_eq!(view.stage, Stage::Pending);

    // The superseding generation then completes normally and takes over.
    let third = TaskPayload::new(doc("doc"), 3, Stage::Chunking);
    assert_eq!(drive(&pipeline, third).await, StageOutcome::Completed);
    assert_eq!(
        inner.resolve_alias("ragline.doc").await.unwrap().as_deref(),
        Some("ragline.doc.g3")
    );
    assert_eq!(inner.collection_names(), vec!["ragline.doc.g3".to_string()]);
}

#[tokio::test]
async fn task_for_a_purged_document_is_discarded() {
    let h = harness(fast_config(), MockEmbeddingProvider::new());
    upload(&h, "uploads/doc", "short lived").await;

    let submission = h.pipeline.submit(&doc("doc"), "uploads/doc").await.unwrap();
    h.pipeline.purge(&doc("doc")).await.unwrap();

    let stale = TaskPayload::new(doc("doc"), submission.generation, Stage::Chunking);
    let outcome = h.pipeline.handle_task(&stale).await.unwrap();
    assert_eq!(outcome, StageOutcome::Discarded);
}
