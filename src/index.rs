//! Vector index abstraction.
//!
//! Each document generation writes into its own collection; search traffic
//! only ever goes through the per-document alias, which is swapped atomically
//! when a generation reaches `Ready`. In-flight re-indexing therefore never
//! exposes partial results to search.
//!
//! Upserts are keyed by chunk id, so replaying the index stage after a crash
//! overwrites points instead of duplicating them.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by a vector index backend.
#[derive(Debug, Error, Diagnostic)]
pub enum IndexError {
    #[error("unknown collection: {name}")]
    #[diagnostic(code(ragline::index::unknown_collection))]
    UnknownCollection { name: String },

    #[error("vector index backend error: {message}")]
    #[diagnostic(code(ragline::index::backend))]
    Backend { message: String },
}

/// A search hit: point id, similarity score, and the payload stored with it.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Value,
}

/// Collection-based vector storage with alias indirection.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection if it does not exist. Idempotent.
    async fn ensure_collection(&self, collection: &str) -> Result<(), IndexError>;

    /// Insert or overwrite the point with this id.
    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: Vec<f32>,
        payload: Value,
    ) -> Result<(), IndexError>;

    /// Atomically point `alias` at `collection`.
    async fn swap_alias(&self, alias: &str, collection: &str) -> Result<(), IndexError>;

    /// Collection currently behind `alias`, if any.
    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, IndexError>;

    /// Drop a collection and any aliases pointing at it. Missing collections
    /// are ignored so superseded-generation cleanup can be replayed.
    async fn delete_collection(&self, collection: &str) -> Result<(), IndexError>;

    /// Nearest-neighbour search through an alias. An unbound alias returns
    /// no hits: the document simply is not searchable yet.
    async fn search(
        &self,
        alias: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredPoint>, IndexError>;
}

#[derive(Default)]
struct MemoryIndexState {
    collections: FxHashMap<String, FxHashMap<String, (Vec<f32>, Value)>>,
    aliases: FxHashMap<String, String>,
}

/// In-memory vector index for tests and development.
///
/// Similarity is cosine; ties resolve by point id so results are stable.
#[derive(Default)]
pub struct MemoryVectorIndex {
    state: RwLock<MemoryIndexState>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of points in a collection, for test assertions.
    pub fn point_count(&self, collection: &str) -> usize {
        self.state
            .read()
            .collections
            .get(collection)
            .map_or(0, FxHashMap::len)
    }

    /// Names of all live collections, for test assertions.
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().collections.keys().cloned().collect();
        names.sort();
        names
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn ensure_collection(&self, collection: &str) -> Result<(), IndexError> {
        self.state
            .write()
            .collections
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: Vec<f32>,
        payload: Value,
    ) -> Result<(), IndexError> {
        let mut state = self.state.write();
        let points = state.collections.get_mut(collection).ok_or_else(|| {
            IndexError::UnknownCollection {
                name: collection.to_string(),
            }
        })?;
        points.insert(id.to_string(), (vector, payload));
        Ok(())
    }

    async fn swap_alias(&self, alias: &str, collection: &str) -> Result<(), IndexError> {
        let mut state = self.state.write();
        if !state.collections.contains_key(collection) {
            return Err(IndexError::UnknownCollection {
                name: collection.to_string(),
            });
        }
        state
            .aliases
            .insert(alias.to_string(), collection.to_string());
        Ok(())
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, IndexError> {
        Ok(self.state.read().aliases.get(alias).cloned())
    }

    async fn delete_collection(&self, collection: &str) -> Result<(), IndexError> {
        let mut state = self.state.write();
        state.collections.remove(collection);
        state.aliases.retain(|_, target| target != collection);
        Ok(())
    }

    async fn search(
        &self,
        alias: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredPoint>, IndexError> {
        let state = self.state.read();
        let Some(collection) = state.aliases.get(alias) else {
            return Ok(Vec::new());
        };
        let points = state.collections.get(collection).ok_or_else(|| {
            IndexError::UnknownCollection {
                name: collection.clone(),
            }
        })?;
        let mut hits: Vec<ScoredPoint> = points
            .iter()
            .map(|(id, (vector, payload))| ScoredPoint {
                id: id.clone(),
                score: cosine(query, vector),
                payload: payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }
}
