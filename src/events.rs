//! Diagnostic events emitted by the pipeline.
//!
//! Stage transitions, retries, stale discards, and alias swaps are emitted to
//! registered [`EventSink`]s. Sinks observe; they never influence control
//! flow, and a misbehaving sink cannot fail a stage.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::types::{DocumentId, Generation, Stage};

/// A structured pipeline event.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    GenerationStarted {
        document_id: DocumentId,
        generation: Generation,
    },
    StageChanged {
        document_id: DocumentId,
        generation: Generation,
        from: Stage,
        to: Stage,
    },
    RetryScheduled {
        document_id: DocumentId,
        generation: Generation,
        stage: Stage,
        attempt: u32,
        delay_ms: u64,
    },
    StaleDiscarded {
        document_id: DocumentId,
        stamped: Generation,
        current: Generation,
    },
    GenerationFailed {
        document_id: DocumentId,
        generation: Generation,
        stage: Stage,
        code: String,
    },
    AliasSwapped {
        document_id: DocumentId,
        generation: Generation,
        alias: String,
        collection: String,
    },
}

/// Consumer of pipeline events.
pub trait EventSink: Send + Sync {
    fn handle(&self, event: &PipelineEvent);
}

/// In-memory sink for tests and snapshots.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<PipelineEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all captured events.
    pub fn snapshot(&self) -> Vec<PipelineEvent> {
        self.entries.lock().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn handle(&self, event: &PipelineEvent) {
        self.entries.lock().push(event.clone());
    }
}

/// Sink that forwards events as `tracing` records.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn handle(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::GenerationFailed { .. } | PipelineEvent::RetryScheduled { .. } => {
                tracing::warn!(?event, "pipeline event");
            }
            _ => tracing::debug!(?event, "pipeline event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_captures_in_order() {
        let sink = MemorySink::new();
        let doc = DocumentId::from("d1");
        sink.handle(&PipelineEvent::GenerationStarted {
            document_id: doc.clone(),
            generation: 1,
        });
        sink.handle(&PipelineEvent::StageChanged {
            document_id: doc,
            generation: 1,
            from: Stage::Pending,
            to: Stage::Chunking,
        });
        let events = sink.snapshot();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], PipelineEvent::GenerationStarted { .. }));
        sink.clear();
        assert!(sink.snapshot().is_empty());
    }
}
