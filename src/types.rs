//! Core identifiers and the pipeline stage machine.
//!
//! This module defines the fundamental types shared across the crate: document
//! identifiers, generation counters, deterministic chunk identifiers, the
//! [`Stage`] state machine, and the [`TaskPayload`] contract handed to the
//! task dispatcher.
//!
//! # Stage ordering
//!
//! A document generation only ever moves forward through
//! `Pending → Chunking → Embedding → Indexing → Ready`, with `Failed`
//! reachable from any non-terminal stage. [`Stage::can_transition_to`] is the
//! single source of truth for that ordering; every status-store write is
//! gated on it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier for a document under ingestion.
///
/// The pipeline never interprets the contents; it is whatever key the
/// upstream document service uses.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Monotonic per-document generation counter.
///
/// Generation 0 means "never ingested"; the first submission starts
/// generation 1. Superseding a running ingestion increments the counter and
/// invalidates all writes stamped with the older value.
pub type Generation = u64;

/// Deterministic chunk identifier derived from `(document, generation, index)`.
///
/// Because the identifier is a pure function of its coordinates, replaying a
/// stage task re-derives the same ids and every chunk row / vector upsert
/// stays idempotent.
#[must_use]
pub fn chunk_id(document_id: &DocumentId, generation: Generation, index: usize) -> String {
    format!("{document_id}:g{generation}:{index}")
}

/// Pipeline stage of a document generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Status record created, raw content not yet confirmed.
    Pending,
    /// Splitting extracted text into chunk rows.
    Chunking,
    /// Producing a vector for every chunk of the generation.
    Embedding,
    /// Upserting vectors into the generation's collection.
    Indexing,
    /// All vectors indexed and the search alias swapped. Terminal.
    Ready,
    /// A fatal error or an exhausted retry budget. Terminal.
    Failed,
}

impl Stage {
    /// The successor stage on the happy path, `None` for terminal stages.
    #[must_use]
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Pending => Some(Stage::Chunking),
            Stage::Chunking => Some(Stage::Embedding),
            Stage::Embedding => Some(Stage::Indexing),
            Stage::Indexing => Some(Stage::Ready),
            Stage::Ready | Stage::Failed => None,
        }
    }

    /// Returns `true` for [`Ready`](Self::Ready) and [`Failed`](Self::Failed).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Ready | Stage::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// Legal moves are the single happy-path step and `Failed` from any
    /// non-terminal stage. Everything else, including standing still, is
    /// rejected so racing workers cannot double-advance a document.
    #[must_use]
    pub fn can_transition_to(self, next: Stage) -> bool {
        if next == Stage::Failed {
            return !self.is_terminal();
        }
        self.next() == Some(next)
    }

    /// Encode for persistence.
    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::Chunking => "chunking",
            Stage::Embedding => "embedding",
            Stage::Indexing => "indexing",
            Stage::Ready => "ready",
            Stage::Failed => "failed",
        }
    }

    /// Decode a persisted stage string. Unknown strings indicate a corrupt
    /// status row and yield `None`.
    #[must_use]
    pub fn decode(s: &str) -> Option<Stage> {
        match s {
            "pending" => Some(Stage::Pending),
            "chunking" => Some(Stage::Chunking),
            "embedding" => Some(Stage::Embedding),
            "indexing" => Some(Stage::Indexing),
            "ready" => Some(Stage::Ready),
            "failed" => Some(Stage::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// The tagged task contract carried by the dispatcher.
///
/// Every dispatched stage execution names its document, the generation it was
/// stamped with, and the stage it intends to run. Handlers validate all three
/// at the boundary; a payload stamped with a superseded generation is
/// discarded without side effects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub document_id: DocumentId,
    pub generation: Generation,
    pub stage: Stage,
}

impl TaskPayload {
    pub fn new(document_id: DocumentId, generation: Generation, stage: Stage) -> Self {
        Self {
            document_id,
            generation,
            stage,
        }
    }

    /// The follow-up payload for the next stage, if one exists.
    #[must_use]
    pub fn follow_up(&self) -> Option<TaskPayload> {
        self.stage.next().filter(|s| !s.is_terminal()).map(|stage| {
            TaskPayload::new(self.document_id.clone(), self.generation, stage)
        })
    }
}

impl fmt::Display for TaskPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@g{}/{}",
            self.document_id, self.generation, self.stage
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_happy_path_is_linear() {
        let mut stage = Stage::Pending;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            assert!(stage.can_transition_to(next));
            stage = next;
            seen.push(stage);
        }
        assert_eq!(
            seen,
            vec![
                Stage::Pending,
                Stage::Chunking,
                Stage::Embedding,
                Stage::Indexing,
                Stage::Ready
            ]
        );
    }

    #[test]
    fn failed_reachable_from_non_terminal_only() {
        for stage in [
            Stage::Pending,
            Stage::Chunking,
            Stage::Embedding,
            Stage::Indexing,
        ] {
            assert!(stage.can_transition_to(Stage::Failed));
        }
        assert!(!Stage::Ready.can_transition_to(Stage::Failed));
        assert!(!Stage::Failed.can_transition_to(Stage::Failed));
    }

    #[test]
    fn no_standing_still_or_backtracking() {
        assert!(!Stage::Embedding.can_transition_to(Stage::Embedding));
        assert!(!Stage::Indexing.can_transition_to(Stage::Chunking));
        assert!(!Stage::Ready.can_transition_to(Stage::Pending));
    }

    #[test]
    fn stage_encode_round_trip() {
        for stage in [
            Stage::Pending,
            Stage::Chunking,
            Stage::Embedding,
            Stage::Indexing,
            Stage::Ready,
            Stage::Failed,
        ] {
            assert_eq!(Stage::decode(stage.encode()), Some(stage));
        }
        assert_eq!(Stage::decode("bogus"), None);
    }

    #[test]
    fn chunk_ids_are_stable() {
        let doc = DocumentId::from("doc-1");
        assert_eq!(chunk_id(&doc, 3, 7), "doc-1:g3:7");
        assert_eq!(chunk_id(&doc, 3, 7), chunk_id(&doc, 3, 7));
    }

    #[test]
    fn follow_up_stops_at_ready() {
        let task = TaskPayload::new(DocumentId::from("d"), 1, Stage::Indexing);
        assert!(task.follow_up().is_none());

        let task = TaskPayload::new(DocumentId::from("d"), 1, Stage::Chunking);
        let next = task.follow_up().unwrap();
        assert_eq!(next.stage, Stage::Embedding);
        assert_eq!(next.generation, 1);
    }
}
