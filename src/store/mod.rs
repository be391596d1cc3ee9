//! Vector store collaborators.
//!
//! - [`Embed`]: turns texts into vectors ([`EmbeddingClient`] talks to any
//!   OpenAI-compatible `/embeddings` endpoint)
//! - [`VectorStore`]: `add_documents`, `similarity_search_with_score` and an
//!   equality lookup by `identificador`
//! - [`QdrantStore`] over the Qdrant gRPC client and [`InMemoryStore`] for
//!   local runs and tests, both selectable through [`AnyStore`]
//!
//! Chunk point ids are UUID v5 of `source/identificador/index`, so loading the
//! same document twice overwrites its points instead of duplicating them.

pub mod embeddings;
pub mod memory;
pub mod qdrant;

pub use embeddings::EmbeddingClient;
pub use memory::InMemoryStore;
pub use qdrant::QdrantStore;

use crate::config::{Config, VectorStoreKind};
use crate::error::EtlError;
use crate::models::Chunk;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Payload key under which the chunk metadata is stored.
pub const METADATA_KEY: &str = "metadata";
/// Payload key holding the chunk text.
pub const CONTENT_KEY: &str = "page_content";

#[allow(async_fn_in_trait)]
pub trait Embed {
    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EtlError>;
}

/// A search hit.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub content: String,
    pub metadata: Map<String, Value>,
    pub score: f32,
}

#[allow(async_fn_in_trait)]
pub trait VectorStore {
    /// Embed and store `chunks`. Returns how many points were written.
    async fn add_documents(&self, chunks: &[Chunk]) -> Result<usize, EtlError>;

    async fn similarity_search_with_score(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, EtlError>;

    /// Whether any stored chunk carries this `identificador`.
    async fn contains_identifier(&self, identificador: &str) -> Result<bool, EtlError>;
}

/// Deterministic point id for a chunk.
pub fn point_id(chunk: &Chunk) -> Uuid {
    let key = format!(
        "{}/{}/{}",
        chunk.source.key(),
        chunk.identificador,
        chunk.index
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
}

/// Store selected by configuration.
#[derive(Debug)]
pub enum AnyStore {
    Qdrant(QdrantStore<EmbeddingClient>),
    Memory(InMemoryStore<EmbeddingClient>),
}

impl AnyStore {
    /// Build the configured store for `collection`.
    pub fn from_config(config: &Config, collection: &str) -> Result<Self, EtlError> {
        let embedder = EmbeddingClient::from_config(&config.embeddings)?;
        Ok(match config.vector_store {
            VectorStoreKind::Qdrant => {
                Self::Qdrant(QdrantStore::new(&config.qdrant, collection, embedder)?)
            }
            VectorStoreKind::Memory => Self::Memory(InMemoryStore::new(embedder)),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Qdrant(_) => "qdrant",
            Self::Memory(_) => "memory",
        }
    }
}

impl VectorStore for AnyStore {
    async fn add_documents(&self, chunks: &[Chunk]) -> Result<usize, EtlError> {
        match self {
            Self::Qdrant(s) => s.add_documents(chunks).await,
            Self::Memory(s) => s.add_documents(chunks).await,
        }
    }

    async fn similarity_search_with_score(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, EtlError> {
        match self {
            Self::Qdrant(s) => s.similarity_search_with_score(query, k).await,
            Self::Memory(s) => s.similarity_search_with_score(query, k).await,
        }
    }

    async fn contains_identifier(&self, identificador: &str) -> Result<bool, EtlError> {
        match self {
            Self::Qdrant(s) => s.contains_identifier(identificador).await,
            Self::Memory(s) => s.contains_identifier(identificador).await,
        }
    }
}

/// Deterministic bag-of-characters embedder for tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::Embed;
    use crate::error::EtlError;
    use std::cell::Cell;

    #[derive(Debug, Default)]
    pub struct LetterEmbedder {
        pub calls: Cell<usize>,
        pub fail_first: Cell<usize>,
    }

    impl Embed for LetterEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EtlError> {
            self.calls.set(self.calls.get() + 1);
            if self.fail_first.get() > 0 {
                self.fail_first.set(self.fail_first.get() - 1);
                return Err(EtlError::Embedding("rate limited".into()));
            }
            Ok(texts.iter().map(|t| letters(t)).collect())
        }
    }

    pub fn letters(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; 27];
        for c in text.to_lowercase().chars() {
            match c {
                'a'..='z' => v[(c as u8 - b'a') as usize] += 1.0,
                _ => v[26] += 0.1,
            }
        }
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrapers::Source;

    fn chunk(identificador: &str, index: usize) -> Chunk {
        Chunk {
            text: "texto".into(),
            metadata: Map::new(),
            source: Source::Boe,
            identificador: identificador.into(),
            index,
        }
    }

    #[test]
    fn test_point_id_is_stable_and_distinct() {
        assert_eq!(point_id(&chunk("BOE-A-2024-1", 0)), point_id(&chunk("BOE-A-2024-1", 0)));
        assert_ne!(point_id(&chunk("BOE-A-2024-1", 0)), point_id(&chunk("BOE-A-2024-1", 1)));
        assert_ne!(point_id(&chunk("BOE-A-2024-1", 0)), point_id(&chunk("BOE-A-2024-2", 0)));
    }

    #[test]
    fn test_store_from_config() {
        let mut config = Config::default();
        config.vector_store = VectorStoreKind::Memory;
        let store = AnyStore::from_config(&config, "boe").unwrap();
        assert_eq!(store.kind(), "memory");

        config.vector_store = VectorStoreKind::Qdrant;
        let store = AnyStore::from_config(&config, "boe").unwrap();
        assert_eq!(store.kind(), "qdrant");
    }
}
