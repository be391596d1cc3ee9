//! Qdrant vector store over the `qdrant-client` gRPC API.
//!
//! The collection is created on first write with cosine distance and the
//! dimension of the first embedding, plus a keyword index on
//! `metadata.identificador` for the existence lookup.

use super::{point_id, Embed, ScoredChunk, VectorStore, CONTENT_KEY, METADATA_KEY};
use crate::config::QdrantConfig;
use crate::error::EtlError;
use crate::models::Chunk;
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder, Distance,
    FieldType, Filter, PointStruct, ScoredPoint, SearchPointsBuilder, UpsertPointsBuilder,
    VectorParamsBuilder,
};
use qdrant_client::{Qdrant, QdrantError};
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

/// Points per upsert request.
const UPSERT_BATCH: usize = 64;

const IDENTIFIER_FIELD: &str = "metadata.identificador";

type Payload = HashMap<String, qdrant_client::qdrant::Value>;

pub struct QdrantStore<E> {
    client: Qdrant,
    collection: String,
    embedder: E,
    ready: OnceCell<()>,
}

impl<E> fmt::Debug for QdrantStore<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QdrantStore")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

fn store_error(action: &str, collection: &str, e: QdrantError) -> EtlError {
    EtlError::Store(format!("{action} on {collection} failed: {e}"))
}

/// Point payload: the chunk text plus its metadata map.
fn chunk_payload(chunk: &Chunk) -> Result<Payload, EtlError> {
    let mut payload = Map::new();
    payload.insert(CONTENT_KEY.to_string(), Value::String(chunk.text.clone()));
    payload.insert(METADATA_KEY.to_string(), Value::Object(chunk.metadata.clone()));
    Ok(serde_json::from_value(Value::Object(payload))?)
}

fn to_json(value: qdrant_client::qdrant::Value) -> Value {
    match value.kind {
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        Some(Kind::IntegerValue(i)) => Value::from(i),
        Some(Kind::DoubleValue(d)) => Number::from_f64(d).map_or(Value::Null, Value::Number),
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::ListValue(list)) => Value::Array(list.values.into_iter().map(to_json).collect()),
        Some(Kind::StructValue(object)) => Value::Object(
            object
                .fields
                .into_iter()
                .map(|(key, value)| (key, to_json(value)))
                .collect(),
        ),
        Some(Kind::NullValue(_)) | None => Value::Null,
    }
}

fn scored_chunk(point: ScoredPoint) -> ScoredChunk {
    let mut payload = point.payload;
    ScoredChunk {
        content: match payload.remove(CONTENT_KEY).map(to_json) {
            Some(Value::String(s)) => s,
            _ => String::new(),
        },
        metadata: match payload.remove(METADATA_KEY).map(to_json) {
            Some(Value::Object(m)) => m,
            _ => Map::new(),
        },
        score: point.score,
    }
}

impl<E> QdrantStore<E> {
    /// # Errors
    ///
    /// [`EtlError::Store`] when the client cannot be created from `config.url`.
    pub fn new(config: &QdrantConfig, collection: &str, embedder: E) -> Result<Self, EtlError> {
        let mut builder = Qdrant::from_url(&config.url);
        if let Some(key) = &config.api_key {
            builder = builder.api_key(key.clone());
        }
        let client = builder
            .build()
            .map_err(|e| EtlError::Store(format!("cannot create Qdrant client for {}: {e}", config.url)))?;
        Ok(Self {
            client,
            collection: collection.to_string(),
            embedder,
            ready: OnceCell::new(),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    async fn collection_exists(&self) -> Result<bool, EtlError> {
        self.client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| store_error("collection lookup", &self.collection, e))
    }

    async fn ensure_collection(&self, dimension: usize) -> Result<(), EtlError> {
        self.ready
            .get_or_try_init(|| self.create_if_missing(dimension))
            .await
            .map(|_| ())
    }

    async fn create_if_missing(&self, dimension: usize) -> Result<(), EtlError> {
        if self.collection_exists().await? {
            return Ok(());
        }
        info!(collection = %self.collection, dimension, "Creating Qdrant collection");
        let size = u64::try_from(dimension)
            .map_err(|_| EtlError::Store(format!("vector size {dimension} out of range")))?;
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(VectorParamsBuilder::new(size, Distance::Cosine)),
            )
            .await
            .map_err(|e| store_error("create collection", &self.collection, e))?;
        self.client
            .create_field_index(
                CreateFieldIndexCollectionBuilder::new(&self.collection, IDENTIFIER_FIELD, FieldType::Keyword)
                    .wait(true),
            )
            .await
            .map_err(|e| store_error("create identificador index", &self.collection, e))?;
        Ok(())
    }
}

impl<E: Embed> VectorStore for QdrantStore<E> {
    #[instrument(level = "debug", skip(self, chunks), fields(collection = %self.collection, count = chunks.len()))]
    async fn add_documents(&self, chunks: &[Chunk]) -> Result<usize, EtlError> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        let dimension = vectors.first().map(Vec::len).unwrap_or_default();
        self.ensure_collection(dimension).await?;

        let points = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| {
                Ok(PointStruct::new(
                    point_id(chunk).to_string(),
                    vector,
                    chunk_payload(chunk)?,
                ))
            })
            .collect::<Result<Vec<_>, EtlError>>()?;

        for batch in points.chunks(UPSERT_BATCH) {
            self.client
                .upsert_points(UpsertPointsBuilder::new(&self.collection, batch.to_vec()).wait(true))
                .await
                .map_err(|e| store_error("upsert", &self.collection, e))?;
        }
        debug!(count = points.len(), "Upserted points");
        Ok(points.len())
    }

    async fn similarity_search_with_score(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, EtlError> {
        let vector = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EtlError::Embedding("no vector returned for query".into()))?;
        let limit = u64::try_from(k).map_err(|_| EtlError::Store(format!("k {k} out of range")))?;

        let response = self
            .client
            .search_points(SearchPointsBuilder::new(&self.collection, vector, limit).with_payload(true))
            .await
            .map_err(|e| store_error("search", &self.collection, e))?;
        Ok(response.result.into_iter().map(scored_chunk).collect())
    }

    async fn contains_identifier(&self, identificador: &str) -> Result<bool, EtlError> {
        if !self.collection_exists().await? {
            return Ok(false);
        }
        let response = self
            .client
            .count(
                CountPointsBuilder::new(&self.collection)
                    .filter(Filter::must(vec![Condition::matches(
                        IDENTIFIER_FIELD,
                        identificador.to_string(),
                    )]))
                    .exact(true),
            )
            .await
            .map_err(|e| store_error("count", &self.collection, e))?;
        Ok(response.result.is_some_and(|r| r.count > 0))
    }
}
