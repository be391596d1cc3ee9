//! Split scraped documents into chunks and load them into a vector store.
//!
//! Every document's scratch file is disposed once its text has been read,
//! whether the document is chunked, filtered out by `skip_existing`, or fails.
//! Remaining scratch files are removed on drop if the run aborts early.
//! All chunks of a run go to the store in one call, retried with a fixed delay.

use crate::config::Config;
use crate::error::EtlError;
use crate::models::{Chunk, MetadataDocument};
use crate::retry::{retry, RetryPolicy};
use crate::splitter::{CharacterSplitter, SplitterConfig};
use crate::store::VectorStore;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Counts reported by [`Etl::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub documents: usize,
    pub skipped: usize,
    pub chunks: usize,
}

pub struct Etl<'a, S> {
    store: &'a S,
    splitter: CharacterSplitter,
    load_policy: RetryPolicy,
    skip_existing: bool,
}

impl<'a, S: VectorStore> Etl<'a, S> {
    pub fn new(config: &Config, store: &'a S) -> Self {
        Self {
            store,
            splitter: CharacterSplitter::new(SplitterConfig::from(config)),
            load_policy: RetryPolicy::fixed(
                config.load.retries,
                Duration::from_secs(config.load.delay_secs),
            ),
            skip_existing: config.skip_existing,
        }
    }

    pub fn with_load_policy(mut self, policy: RetryPolicy) -> Self {
        self.load_policy = policy;
        self
    }

    /// Chunk every document and load the chunks.
    ///
    /// # Errors
    ///
    /// [`EtlError::Load`] once the load retries are spent, [`EtlError::Io`] when
    /// a scratch file cannot be read, and store errors from the
    /// `skip_existing` lookup.
    #[instrument(level = "info", skip_all, fields(documents = docs.len()))]
    pub async fn run(&self, docs: Vec<MetadataDocument>) -> Result<LoadReport, EtlError> {
        let mut report = LoadReport::default();
        let mut chunks = Vec::new();

        for doc in docs {
            if self.skip_existing && self.store.contains_identifier(&doc.identificador).await? {
                info!(identificador = %doc.identificador, "Already loaded; skipping");
                discard(doc);
                report.skipped += 1;
                continue;
            }
            chunks.extend(self.chunk_document(doc)?);
            report.documents += 1;
        }
        report.chunks = chunks.len();

        if chunks.is_empty() {
            info!(skipped = report.skipped, "Nothing to load");
            return Ok(report);
        }

        self.load(&chunks).await?;
        info!(
            documents = report.documents,
            skipped = report.skipped,
            chunks = report.chunks,
            "ETL loaded"
        );
        Ok(report)
    }

    /// Read the document text, dispose the scratch file, and cut the text into chunks.
    fn chunk_document(&self, doc: MetadataDocument) -> Result<Vec<Chunk>, EtlError> {
        debug!(identificador = %doc.identificador, path = %doc.scratch.path().display(), "Chunking document");
        let text = doc.scratch.read();
        let metadata = doc.metadata();
        let source = doc.source;
        let identificador = doc.identificador;
        if let Err(e) = doc.scratch.dispose() {
            warn!(%identificador, error = %e, "Could not delete scratch file");
        }

        let (text, metadata) = (text?, metadata?);
        let chunks: Vec<Chunk> = self
            .splitter
            .split_text(&text)
            .into_iter()
            .enumerate()
            .map(|(index, text)| Chunk {
                text,
                metadata: metadata.clone(),
                source,
                identificador: identificador.clone(),
                index,
            })
            .collect();
        if chunks.is_empty() {
            warn!(%identificador, "Document has no text to load");
        }
        Ok(chunks)
    }

    async fn load(&self, chunks: &[Chunk]) -> Result<usize, EtlError> {
        let store = self.store;
        retry(&self.load_policy, "vector store load", |_| true, move |_attempt| {
            store.add_documents(chunks)
        })
        .await
        .map_err(|e| EtlError::Load {
            attempts: self.load_policy.max_attempts,
            reason: e.to_string(),
        })
    }
}

fn discard(doc: MetadataDocument) {
    let identificador = doc.identificador;
    if let Err(e) = doc.scratch.dispose() {
        warn!(%identificador, error = %e, "Could not delete scratch file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceDetails;
    use crate::scrapers::Source;
    use crate::store::testing::LetterEmbedder;
    use crate::store::InMemoryStore;
    use chrono::NaiveDate;

    fn config(skip_existing: bool) -> Config {
        Config {
            separator: " ".into(),
            chunk_size: 20,
            chunk_overlap: 5,
            skip_existing,
            ..Config::default()
        }
    }

    fn document(identificador: &str, text: &str) -> MetadataDocument {
        MetadataDocument::builder(
            Source::Dgt,
            identificador,
            SourceDetails::Dgt {
                numero_consulta: identificador.into(),
                organo: "SG de Impuestos sobre el Consumo".into(),
                normativa: "Ley 37/1992".into(),
            },
        )
        .fecha_publicacion(NaiveDate::from_ymd_opt(2024, 3, 7))
        .build(text)
        .unwrap()
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::fixed(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_run_chunks_and_loads_documents() {
        let store = InMemoryStore::new(LetterEmbedder::default());
        let docs = vec![
            document("V0001-24", "el tipo impositivo aplicable a la entrega de viviendas"),
            document("V0002-24", "deduccion por maternidad"),
        ];
        let paths: Vec<_> = docs.iter().map(|d| d.scratch.path().to_path_buf()).collect();

        let etl = Etl::new(&config(false), &store).with_load_policy(fast());
        let report = etl.run(docs).await.unwrap();

        assert_eq!(report.documents, 2);
        assert_eq!(report.skipped, 0);
        assert!(report.chunks > 2);
        assert_eq!(store.len(), report.chunks);
        assert!(paths.iter().all(|p| !p.exists()));

        let hits = store.similarity_search_with_score("maternidad", 1).await.unwrap();
        assert_eq!(hits[0].metadata["identificador"], "V0002-24");
        assert_eq!(hits[0].metadata["fecha_publicacion"], "2024-03-07");
    }

    #[tokio::test]
    async fn test_load_retries_transient_failures() {
        let store = InMemoryStore::new(LetterEmbedder::default());
        store.embedder().fail_first.set(2);

        let etl = Etl::new(&config(false), &store).with_load_policy(fast());
        let report = etl.run(vec![document("V0003-24", "consulta breve")]).await.unwrap();

        assert_eq!(store.embedder().calls.get(), 3);
        assert_eq!(store.len(), report.chunks);
    }

    #[tokio::test]
    async fn test_load_failure_after_retries_is_fatal() {
        let store = InMemoryStore::new(LetterEmbedder::default());
        store.embedder().fail_first.set(10);
        let doc = document("V0004-24", "consulta que no llega a cargarse");
        let path = doc.scratch.path().to_path_buf();

        let etl = Etl::new(&config(false), &store).with_load_policy(fast());
        let err = etl.run(vec![doc]).await.unwrap_err();

        assert!(matches!(err, EtlError::Load { attempts: 3, .. }));
        assert_eq!(store.embedder().calls.get(), 3);
        assert!(store.is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_skip_existing_drops_loaded_documents() {
        let store = InMemoryStore::new(LetterEmbedder::default());
        Etl::new(&config(false), &store)
            .with_load_policy(fast())
            .run(vec![document("V0005-24", "primera carga")])
            .await
            .unwrap();
        let loaded = store.len();

        let again = document("V0005-24", "primera carga repetida con mas texto");
        let path = again.scratch.path().to_path_buf();
        let report = Etl::new(&config(true), &store)
            .with_load_policy(fast())
            .run(vec![again, document("V0006-24", "segunda")])
            .await
            .unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.documents, 1);
        assert_eq!(store.len(), loaded + report.chunks);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_empty_run_does_not_touch_the_store() {
        let store = InMemoryStore::new(LetterEmbedder::default());
        let report = Etl::new(&config(false), &store).run(Vec::new()).await.unwrap();
        assert_eq!(report, LoadReport::default());
        assert_eq!(store.embedder().calls.get(), 0);
    }
}
