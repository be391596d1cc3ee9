//! # Boletín ETL
//!
//! Scrapes official gazettes (the BOE and several regional and provincial
//! bulletins, plus the DGT tax consultations), normalizes every disposition
//! into a [`models::MetadataDocument`], splits its text into chunks and loads
//! them into a vector store for retrieval.
//!
//! ## Usage
//!
//! ```sh
//! boletin_etl today --source boe
//! boletin_etl dates --source bopv 2024/01/01 2024/01/31
//! boletin_etl document --source boe https://www.boe.es/diario_boe/xml.php?id=BOE-A-2024-1
//! boletin_etl search "ayudas al alquiler" -k 5 --source boja
//! ```
//!
//! ## Architecture
//!
//! 1. **Discovery**: each source scraper finds the day's dispositions
//! 2. **Extraction**: every disposition is fetched and its metadata extracted;
//!    a broken document is logged and dropped without failing the day
//! 3. **ETL**: texts are split into chunks and loaded with bounded retries
//! 4. **Notification**: a summary email goes to the administrator

use chrono::{Local, NaiveDate};
use clap::Parser;
use std::error::Error;
use tracing::{error, info, instrument};
use tracing_subscriber::{fmt as tfmt, EnvFilter};

mod cli;
mod config;
mod context;
mod error;
mod etl;
mod http;
mod models;
mod notify;
mod pdf;
mod retry;
mod rules;
mod scrapers;
mod splitter;
mod store;
mod utils;

use cli::{Cli, Command};
use context::AppContext;
use etl::{Etl, LoadReport};
use models::MetadataDocument;
use notify::{Message, Notifier};
use scrapers::{DocumentRef, Scraper, Source};
use store::VectorStore;
use utils::truncate_for_log;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    let args = Cli::parse();
    info!(command = ?args.command, "boletin_etl starting up");

    let config = config::load_config(args.config.as_deref()).await?;
    let ctx = AppContext::new(config)?;

    match args.command {
        Command::Today { source } => {
            let day = Local::now().date_naive();
            let (report, store) = load_days(&ctx, source, day, day).await?;
            notify(&ctx, Message::daily(source, day, report.documents, store)).await;
        }
        Command::Dates { source, start, end } => {
            if end < start {
                return Err(format!("end date {end} is before start date {start}").into());
            }
            let (report, store) = load_days(&ctx, source, start, end).await?;
            notify(&ctx, Message::range(source, start, end, report.documents, store)).await;
        }
        Command::Document { source, urls } => {
            load_documents(&ctx, source, urls).await?;
        }
        Command::Search { query, k, source } => {
            let k = k.unwrap_or(ctx.config.top_k_results);
            search(&ctx, source, &query, k).await?;
        }
    }

    let elapsed = start_time.elapsed();
    info!(?elapsed, secs = elapsed.as_secs(), "Execution complete");
    Ok(())
}

/// Scrape `[start, end]` and load the result. Returns the report and the store kind used.
#[instrument(level = "info", skip(ctx))]
async fn load_days(
    ctx: &AppContext,
    source: Source,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<(LoadReport, &'static str), Box<dyn Error>> {
    let scraper = ctx.scraper(source)?;
    let store = ctx.store(source)?;
    let docs = scraper.download_days(start, end).await?;
    let report = Etl::new(&ctx.config, &store).run(docs).await?;
    Ok((report, store.kind()))
}

#[instrument(level = "info", skip(ctx, urls), fields(count = urls.len()))]
async fn load_documents(ctx: &AppContext, source: Source, urls: Vec<String>) -> Result<(), Box<dyn Error>> {
    let scraper = ctx.scraper(source)?;
    let store = ctx.store(source)?;

    let mut docs: Vec<MetadataDocument> = Vec::with_capacity(urls.len());
    for url in urls {
        let reference = DocumentRef::Url(url);
        match scraper.download_document(&reference).await {
            Ok(doc) => docs.push(doc),
            Err(e) if e.is_document_local() => {
                error!(%reference, error = %e, "Document failed");
            }
            Err(e) => return Err(e.into()),
        }
    }

    let report = Etl::new(&ctx.config, &store).run(docs).await?;
    info!(documents = report.documents, chunks = report.chunks, "Documents loaded");
    Ok(())
}

async fn search(ctx: &AppContext, source: Source, query: &str, k: usize) -> Result<(), Box<dyn Error>> {
    let store = ctx.store(source)?;
    let hits = store.similarity_search_with_score(query, k).await?;
    info!(count = hits.len(), "Search complete");

    for (rank, hit) in hits.iter().enumerate() {
        let field = |key: &str| {
            hit.metadata
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        println!(
            "{}. [{:.4}] {} {}\n   {}\n",
            rank + 1,
            hit.score,
            field("identificador"),
            field("titulo"),
            truncate_for_log(&hit.content.replace('\n', " "), 300)
        );
    }
    Ok(())
}

async fn notify(ctx: &AppContext, message: Message) {
    match Notifier::new(&ctx.config.email) {
        Ok(notifier) => {
            notifier.send(&message).await;
        }
        Err(e) => error!(error = %e, "Notification skipped"),
    }
}
