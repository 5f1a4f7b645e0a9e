//! Shared test harness wiring the pipeline to in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use ragline::config::PipelineConfig;
use ragline::dispatcher::LocalDispatcher;
use ragline::embed::{EmbeddingProvider, MockEmbeddingProvider};
use ragline::events::MemorySink;
use ragline::index::{MemoryVectorIndex, VectorIndex};
use ragline::object_store::{MemoryObjectStore, ObjectStore};
use ragline::pipeline::Pipeline;
use ragline::retry::RetryPolicy;
use ragline::status::{MemoryStatusStore, StatusStore};
use ragline::types::DocumentId;

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Harness {
    pub pipeline: Arc<Pipeline>,
    pub dispatcher: LocalDispatcher,
    pub objects: Arc<MemoryObjectStore>,
    pub embedder: Arc<MockEmbeddingProvider>,
    pub index: Arc<MemoryVectorIndex>,
    pub status: Arc<MemoryStatusStore>,
    pub events: MemorySink,
}

pub fn harness(config: PipelineConfig, embedder: MockEmbeddingProvider) -> Harness {
    let objects = Arc::new(MemoryObjectStore::new());
    let embedder = Arc::new(embedder);
    let index = Arc::new(MemoryVectorIndex::new());
    let status = Arc::new(MemoryStatusStore::new());
    let events = MemorySink::new();
    let pipeline = Arc::new(
        Pipeline::new(
            config,
            Arc::clone(&status) as Arc<dyn StatusStore>,
            Arc::clone(&objects) as Arc<dyn ObjectStore>,
            Arc::clone(&embedder) as Arc<dyn EmbeddingProvider>,
            Arc::clone(&index) as Arc<dyn VectorIndex>,
        )
        .with_sink(Arc::new(events.clone())),
    );
    let dispatcher = LocalDispatcher::new(Arc::clone(&pipeline), 2);
    Harness {
        pipeline,
        dispatcher,
        objects,
        embedder,
        index,
        status,
        events,
    }
}

/// Configuration with no retry delays, suitable for fast tests.
pub fn fast_config() -> PipelineConfig {
    PipelineConfig::default().with_retry(RetryPolicy::immediate(3))
}

pub async fn upload(harness: &Harness, key: &str, content: &str) {
    harness
        .objects
        .put(key, content.as_bytes().to_vec())
        .await
        .expect("memory store put cannot fail");
}

pub fn doc(id: &str) -> DocumentId {
    DocumentId::from(id)
}
