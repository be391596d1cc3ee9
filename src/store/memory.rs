//! Process-local vector store with cosine-similarity search.

use super::{point_id, Embed, ScoredChunk, VectorStore};
use crate::error::EtlError;
use crate::models::Chunk;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredPoint {
    vector: Vec<f32>,
    content: String,
    identificador: String,
    metadata: Map<String, Value>,
}

#[derive(Debug)]
pub struct InMemoryStore<E> {
    embedder: E,
    points: RwLock<HashMap<Uuid, StoredPoint>>,
}

impl<E> InMemoryStore<E> {
    pub fn new(embedder: E) -> Self {
        Self {
            embedder,
            points: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.points.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn embedder(&self) -> &E {
        &self.embedder
    }
}

fn poisoned<T>(_: T) -> EtlError {
    EtlError::Store("in-memory store lock poisoned".into())
}

impl<E: Embed> VectorStore for InMemoryStore<E> {
    async fn add_documents(&self, chunks: &[Chunk]) -> Result<usize, EtlError> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;

        let mut points = self.points.write().map_err(poisoned)?;
        for (chunk, vector) in chunks.iter().zip(vectors) {
            points.insert(
                point_id(chunk),
                StoredPoint {
                    vector,
                    content: chunk.text.clone(),
                    identificador: chunk.identificador.clone(),
                    metadata: chunk.metadata.clone(),
                },
            );
        }
        Ok(chunks.len())
    }

    async fn similarity_search_with_score(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, EtlError> {
        let query_vector = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EtlError::Embedding("no vector returned for query".into()))?;

        let points = self.points.read().map_err(poisoned)?;
        let mut scored: Vec<ScoredChunk> = points
            .values()
            .map(|p| ScoredChunk {
                content: p.content.clone(),
                metadata: p.metadata.clone(),
                score: cosine_similarity(&query_vector, &p.vector),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }

    async fn contains_identifier(&self, identificador: &str) -> Result<bool, EtlError> {
        let points = self.points.read().map_err(poisoned)?;
        Ok(points.values().any(|p| p.identificador == identificador))
    }
}

/// Cosine similarity; `0.0` when either vector has zero norm or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
