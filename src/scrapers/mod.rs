//! Official bulletin scrapers.
//!
//! Every publisher implements [`Scraper`]: `download_day` discovers the day's
//! dispositions and `download_document` turns one reference into a
//! [`MetadataDocument`] with its body already written to a scratch file.
//!
//! # Supported Sources
//!
//! | Source | Module | Discovery | Documents |
//! |--------|--------|-----------|-----------|
//! | BOE | [`boe`] | XML day index, sections `1` and `T` | per-document XML, ELI HTML text |
//! | BOCM | [`bocm`] | POST date, `Link` header to the day summary | HTML pages |
//! | BOA | [`boa`] | JSON day search | inline JSON records |
//! | BOPV | [`bopv`] | month calendar arrays, day summaries | HTML pages |
//! | BOJA | [`boja`] | year calendar, section listings | HTML pages |
//! | BOPZ | [`bopz`] | POST search form | listing rows + bulletin PDFs |
//! | BOPGR | [`bopgr`] | whole-bulletin PDF | line state machine records |
//! | DGT | [`dgt`] | paginated POST search over two tabs | HTML consultations |
//!
//! # Error policy
//!
//! Identical for all sources. The discovery call for a day is wrapped by
//! [`discover`]: document-local failures are logged and the day yields nothing.
//! Each discovered reference then goes through [`collect_documents`], which logs
//! and skips document-local failures. Only environmental errors (`Io`,
//! `Config`) leave `download_day`, and [`Scraper::download_days`] lets them
//! abort the range.

pub mod boa;
pub mod bocm;
pub mod boe;
pub mod boja;
pub mod bopgr;
pub mod bopv;
pub mod bopz;
pub mod dgt;

use crate::context::AppContext;
use crate::error::EtlError;
use crate::models::{DispositionSummary, MetadataDocument};
use crate::utils::{days_inclusive, truncate_for_log};
use chrono::NaiveDate;
use clap::ValueEnum;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::fmt;
use std::future::Future;
use tracing::{error, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Source {
    Boe,
    Bocm,
    Boa,
    Bopv,
    Boja,
    Bopz,
    Bopgr,
    Dgt,
}

impl Source {
    pub const ALL: [Source; 8] = [
        Source::Boe,
        Source::Bocm,
        Source::Boa,
        Source::Bopv,
        Source::Boja,
        Source::Bopz,
        Source::Bopgr,
        Source::Dgt,
    ];

    /// Upper-case acronym stored as `source_name`.
    pub fn name(self) -> &'static str {
        match self {
            Source::Boe => "BOE",
            Source::Bocm => "BOCM",
            Source::Boa => "BOA",
            Source::Bopv => "BOPV",
            Source::Boja => "BOJA",
            Source::Bopz => "BOPZ",
            Source::Bopgr => "BOPGR",
            Source::Dgt => "DGT",
        }
    }

    /// Lower-case key used on the command line and in configuration.
    pub fn key(self) -> &'static str {
        match self {
            Source::Boe => "boe",
            Source::Bocm => "bocm",
            Source::Boa => "boa",
            Source::Bopv => "bopv",
            Source::Boja => "boja",
            Source::Bopz => "bopz",
            Source::Bopgr => "bopgr",
            Source::Dgt => "dgt",
        }
    }

    pub fn default_collection(self) -> &'static str {
        match self {
            Source::Boe => "boletin_boe",
            Source::Bocm => "boletin_bocm",
            Source::Boa => "boletin_boa",
            Source::Bopv => "boletin_bopv",
            Source::Boja => "boletin_boja",
            Source::Bopz => "boletin_bopz",
            Source::Bopgr => "boletin_bopgr",
            Source::Dgt => "boletin_dgt",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What `download_document` works from: a URL to fetch, or an in-memory
/// fragment of a bulk day response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentRef {
    Url(String),
    Fragment(String),
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentRef::Url(url) => f.write_str(url),
            DocumentRef::Fragment(text) => write!(f, "fragment {}", truncate_for_log(text, 80)),
        }
    }
}

/// A discovered reference plus the listing-level fields known for it.
#[derive(Debug, Clone)]
pub struct Pending {
    pub reference: DocumentRef,
    pub summary: DispositionSummary,
}

impl Pending {
    pub fn new(reference: DocumentRef, summary: DispositionSummary) -> Self {
        Self { reference, summary }
    }
}

impl From<DocumentRef> for Pending {
    fn from(reference: DocumentRef) -> Self {
        Self::new(reference, DispositionSummary::default())
    }
}

#[allow(async_fn_in_trait)]
pub trait Scraper {
    fn source(&self) -> Source;

    /// Every disposition published on `day`. A day without content is `Ok(vec![])`.
    async fn download_day(&self, day: NaiveDate) -> Result<Vec<MetadataDocument>, EtlError>;

    /// Extract a single document.
    ///
    /// # Errors
    ///
    /// [`EtlError::Scrape`] when required fields cannot be located,
    /// [`EtlError::Skipped`] when the document is deliberately not indexed, and
    /// fetch errors from the HTTP layer.
    async fn download_document(&self, reference: &DocumentRef) -> Result<MetadataDocument, EtlError>;

    /// Extract a document found in a day listing and back-fill the listing
    /// fields. Sources whose pages carry no publication date override this to
    /// take it from `summary`.
    async fn download_listed(
        &self,
        reference: &DocumentRef,
        summary: &DispositionSummary,
    ) -> Result<MetadataDocument, EtlError> {
        let mut document = self.download_document(reference).await?;
        document.apply_summary(summary.clone());
        Ok(document)
    }

    /// Concatenation of [`Scraper::download_day`] over `[start, end]` in
    /// chronological order. The first error aborts the range.
    async fn download_days(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<MetadataDocument>, EtlError> {
        let mut documents = Vec::new();
        for day in days_inclusive(start, end) {
            documents.extend(self.download_day(day).await?);
        }
        info!(
            source = %self.source(),
            %start,
            %end,
            count = documents.len(),
            "Downloaded date range"
        );
        Ok(documents)
    }
}

/// Run a day's discovery call. Document-local failures are logged and the day
/// yields no references.
pub async fn discover<Fut>(source: Source, day: NaiveDate, discovery: Fut) -> Result<Vec<Pending>, EtlError>
where
    Fut: Future<Output = Result<Vec<Pending>, EtlError>>,
{
    match discovery.await {
        Ok(pending) => {
            info!(%source, %day, count = pending.len(), "Discovered dispositions");
            Ok(pending)
        }
        Err(e) if e.is_document_local() => {
            error!(%source, %day, error = %e, "Day discovery failed");
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

/// Download every pending reference in discovery order, back-filling the
/// listing fields. Skipped documents log at `info`, other document-local
/// failures at `error`; both are dropped.
#[instrument(level = "info", skip(scraper, pending), fields(source = %scraper.source(), total = pending.len()))]
pub async fn collect_documents<S>(
    scraper: &S,
    day: NaiveDate,
    pending: Vec<Pending>,
) -> Result<Vec<MetadataDocument>, EtlError>
where
    S: Scraper + ?Sized,
{
    let documents: Vec<Option<MetadataDocument>> = stream::iter(pending)
        .then(|item: Pending| async move {
            match scraper.download_listed(&item.reference, &item.summary).await {
                Ok(document) => Ok(Some(document)),
                Err(e @ EtlError::Skipped { .. }) => {
                    info!(%day, reference = %item.reference, reason = %e, "Document skipped");
                    Ok(None)
                }
                Err(e) if e.is_document_local() => {
                    error!(%day, reference = %item.reference, error = %e, "Document failed");
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        })
        .try_collect()
        .await?;

    let documents: Vec<MetadataDocument> = documents.into_iter().flatten().collect();
    info!(%day, count = documents.len(), "Collected documents");
    Ok(documents)
}

/// Static dispatch over the concrete scrapers.
#[derive(Debug)]
pub enum AnyScraper {
    Boe(boe::BoeScraper),
    Bocm(bocm::BocmScraper),
    Boa(boa::BoaScraper),
    Bopv(bopv::BopvScraper),
    Boja(boja::BojaScraper),
    Bopz(bopz::BopzScraper),
    Bopgr(bopgr::BopgrScraper),
    Dgt(dgt::DgtScraper),
}

impl AnyScraper {
    pub fn for_source(source: Source, ctx: &AppContext) -> Result<Self, EtlError> {
        let http = ctx.http.clone();
        Ok(match source {
            Source::Boe => Self::Boe(boe::BoeScraper::new(http)),
            Source::Bocm => Self::Bocm(bocm::BocmScraper::new(http)),
            Source::Boa => Self::Boa(boa::BoaScraper::new(http)),
            Source::Bopv => Self::Bopv(bopv::BopvScraper::new(http)),
            Source::Boja => Self::Boja(boja::BojaScraper::new(http)),
            Source::Bopz => Self::Bopz(bopz::BopzScraper::new(http)),
            Source::Bopgr => Self::Bopgr(bopgr::BopgrScraper::new(http, &ctx.config.bopgr)),
            Source::Dgt => Self::Dgt(dgt::DgtScraper::new(&ctx.config.http)?),
        })
    }
}

impl Scraper for AnyScraper {
    fn source(&self) -> Source {
        match self {
            Self::Boe(s) => s.source(),
            Self::Bocm(s) => s.source(),
            Self::Boa(s) => s.source(),
            Self::Bopv(s) => s.source(),
            Self::Boja(s) => s.source(),
            Self::Bopz(s) => s.source(),
            Self::Bopgr(s) => s.source(),
            Self::Dgt(s) => s.source(),
        }
    }

    async fn download_day(&self, day: NaiveDate) -> Result<Vec<MetadataDocument>, EtlError> {
        match self {
            Self::Boe(s) => s.download_day(day).await,
            Self::Bocm(s) => s.download_day(day).await,
            Self::Boa(s) => s.download_day(day).await,
            Self::Bopv(s) => s.download_day(day).await,
            Self::Boja(s) => s.download_day(day).await,
            Self::Bopz(s) => s.download_day(day).await,
            Self::Bopgr(s) => s.download_day(day).await,
            Self::Dgt(s) => s.download_day(day).await,
        }
    }

    async fn download_document(&self, reference: &DocumentRef) -> Result<MetadataDocument, EtlError> {
        match self {
            Self::Boe(s) => s.download_document(reference).await,
            Self::Bocm(s) => s.download_document(reference).await,
            Self::Boa(s) => s.download_document(reference).await,
            Self::Bopv(s) => s.download_document(reference).await,
            Self::Boja(s) => s.download_document(reference).await,
            Self::Bopz(s) => s.download_document(reference).await,
            Self::Bopgr(s) => s.download_document(reference).await,
            Self::Dgt(s) => s.download_document(reference).await,
        }
    }

    async fn download_listed(
        &self,
        reference: &DocumentRef,
        summary: &DispositionSummary,
    ) -> Result<MetadataDocument, EtlError> {
        match self {
            Self::Boe(s) => s.download_listed(reference, summary).await,
            Self::Bocm(s) => s.download_listed(reference, summary).await,
            Self::Boa(s) => s.download_listed(reference, summary).await,
            Self::Bopv(s) => s.download_listed(reference, summary).await,
            Self::Boja(s) => s.download_listed(reference, summary).await,
            Self::Bopz(s) => s.download_listed(reference, summary).await,
            Self::Bopgr(s) => s.download_listed(reference, summary).await,
            Self::Dgt(s) => s.download_listed(reference, summary).await,
        }
    }
}

/// Parse an HTML selector known at compile time.
pub(crate) fn selector(css: &'static str) -> scraper::Selector {
    scraper::Selector::parse(css).unwrap_or_else(|e| panic!("invalid selector {css}: {e}"))
}
