//! Process-wide collaborators, built once in `main` and passed down.

use crate::config::Config;
use crate::error::EtlError;
use crate::http::HttpClient;
use crate::scrapers::{AnyScraper, Source};
use crate::store::AnyStore;
use tracing::info;

#[derive(Debug)]
pub struct AppContext {
    pub config: Config,
    pub http: HttpClient,
}

impl AppContext {
    pub fn new(config: Config) -> Result<Self, EtlError> {
        let http = HttpClient::new(&config.http)?;
        Ok(Self { config, http })
    }

    pub fn scraper(&self, source: Source) -> Result<AnyScraper, EtlError> {
        AnyScraper::for_source(source, self)
    }

    /// Vector store bound to the collection configured for `source`.
    pub fn store(&self, source: Source) -> Result<AnyStore, EtlError> {
        let collection = self.config.collection_for(source);
        let store = AnyStore::from_config(&self.config, &collection)?;
        info!(%source, %collection, kind = store.kind(), "Vector store ready");
        Ok(store)
    }
}
