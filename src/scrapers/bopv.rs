//! BOPV (Boletín Oficial del País Vasco) scraper.
//!
//! Each month has a calendar page (`datos/MMYYYY.shtml`) embedding two
//! parallel JavaScript arrays: `diasHabilitados` (published days as
//! `YYYYMMDD`) and `enlaces` (summary page per day, sometimes a nested list).
//! A day missing from `diasHabilitados` published nothing.
//!
//! A document reached from a day summary takes its dates from that day. One
//! fetched by URL alone reads the bulletin header (`N.º 10, lunes 15 de enero
//! de 2024`), which must agree with the `YYYY/MM` of its URL.

use super::{collect_documents, discover, selector, DocumentRef, Pending, Scraper, Source};
use crate::error::EtlError;
use crate::http::HttpClient;
use crate::models::{DispositionSummary, MetadataDocument, SourceDetails};
use crate::rules::sections::is_bopv_section;
use crate::rules::text::{clean_text, element_text_stripped, marked_date};
use crate::utils::{resolve_url, url_dir};
use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html};
use serde_json::Value;
use tracing::{info, instrument, warn};

const BASE_URL: &str = "https://www.euskadi.eus/web01-bopv/es/bopv2/datos/";

static ENABLED_DAYS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"var diasHabilitados = (\[.*?\]);").expect("diasHabilitados regex"));
static LINKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"var enlaces = (\[.*?\]);").expect("enlaces regex"));
static BODY_PARAGRAPH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"BOPV(Detalle|Titulo|FirmaLugFec|FirmaPuesto|FirmaNombre)").expect("body class regex"));
static BODY_EXTRA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"BOPV(Titulo|FirmaLugFec|FirmaPuesto|FirmaNombre)").expect("extra class regex"));
static BULLETIN_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bN\.?\s*[º°]\s*\d+").expect("bulletin number regex"));
static URL_MONTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/(\d{4})/(\d{2})/[^/]+$").expect("url month regex"));

#[derive(Debug, Clone)]
pub struct BopvScraper {
    http: HttpClient,
    base_url: String,
}

/// Parse a JavaScript array literal of strings (single or double quoted).
fn js_array(literal: &str) -> Result<Vec<Value>, EtlError> {
    match serde_json::from_str::<Value>(&literal.replace('\'', "\""))? {
        Value::Array(items) => Ok(items),
        _ => Ok(Vec::new()),
    }
}

/// Summary page name for `day` from the calendar script, if the day was published.
pub fn summary_link(calendar: &str, day: NaiveDate) -> Result<Option<String>, EtlError> {
    let (Some(days), Some(links)) = (ENABLED_DAYS.captures(calendar), LINKS.captures(calendar)) else {
        return Ok(None);
    };
    let days = js_array(&days[1])?;
    let links = js_array(&links[1])?;

    let wanted = day.format("%Y%m%d").to_string();
    let Some(index) = days.iter().position(|d| d.as_str() == Some(wanted.as_str())) else {
        return Ok(None);
    };

    let link = match links.get(index) {
        Some(Value::String(link)) => Some(link.clone()),
        Some(Value::Array(nested)) => nested.first().and_then(Value::as_str).map(str::to_string),
        _ => None,
    };
    Ok(link)
}

/// `2024/01/2400001a` out of `.../datos/2024/01/2400001a.shtml`.
fn identifier_from_url(url: &str) -> String {
    let stem = url.rsplit('.').nth(1).unwrap_or(url);
    let mut parts: Vec<&str> = stem.rsplit('/').take(3).collect();
    parts.reverse();
    parts.join("/")
}

/// Publication date from the bulletin header of a document page. Dates that
/// contradict the `YYYY/MM` of the URL are discarded.
fn bulletin_date(url: &str, document: &Html) -> Option<NaiveDate> {
    let date = marked_date(document.root_element(), &BULLETIN_NUMBER, Some("colCentralinterior"))?;
    match URL_MONTH.captures(url) {
        Some(caps) if caps[1] != date.year().to_string() || caps[2] != format!("{:02}", date.month()) => {
            warn!(url, %date, "Bulletin date does not match the document URL");
            None
        }
        _ => Some(date),
    }
}

fn has_class(element: ElementRef<'_>, pattern: &Regex) -> bool {
    element.value().classes().any(|class| pattern.is_match(class))
}

impl BopvScraper {
    pub fn new(http: HttpClient) -> Self {
        Self::with_base_url(http, BASE_URL)
    }

    pub fn with_base_url(http: HttpClient, base_url: &str) -> Self {
        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self { http, base_url }
    }

    /// Summary page URL for `day`, `None` when the calendar does not list it.
    #[instrument(level = "info", skip(self))]
    async fn summary_url(&self, day: NaiveDate) -> Result<Option<String>, EtlError> {
        let calendar_url = format!("{}{}.shtml", self.base_url, day.format("%m%Y"));
        let calendar = self.http.get_text(&calendar_url, &[]).await?;
        Ok(summary_link(&calendar, day)?
            .map(|link| format!("{}{}/{}", self.base_url, day.format("%Y/%m"), link)))
    }

    fn list_summary(&self, summary_url: &str, html: &str, day: NaiveDate) -> Result<Vec<Pending>, EtlError> {
        let document = Html::parse_document(html);
        let title_sel = selector("p.BOPVSumarioTitulo");
        let link_sel = selector("a");

        let mut pending = Vec::new();
        for block in document.select(&selector("div.txtBloque")) {
            let title = block.select(&title_sel).next();
            let Some(href) = title
                .and_then(|t| t.select(&link_sel).next())
                .and_then(|a| a.value().attr("href"))
            else {
                warn!(summary_url, block = %element_text_stripped(block, " "), "Summary block without title link");
                continue;
            };
            let url_html = format!("{}{}", url_dir(summary_url), href);
            pending.push(Pending::new(
                DocumentRef::Url(url_html.clone()),
                DispositionSummary {
                    titulo: title.map(|t| t.text().collect::<String>().trim().to_string()),
                    url_html: Some(url_html),
                    url_boletin: Some(summary_url.to_string()),
                    fecha_publicacion: Some(day),
                    fecha_disposicion: Some(day),
                },
            ));
        }
        Ok(pending)
    }

    #[instrument(level = "info", skip_all, fields(reference = %reference))]
    async fn fetch_document(
        &self,
        reference: &DocumentRef,
        listed: Option<NaiveDate>,
    ) -> Result<MetadataDocument, EtlError> {
        let DocumentRef::Url(url) = reference else {
            return Err(EtlError::scrape(reference.to_string(), "BOPV documents are fetched by URL"));
        };
        let html = self.http.get_text(url, &[]).await?;
        let document = self.parse_document(url, &html, listed)?;
        info!(identificador = %document.identificador, "Scraped BOPV document");
        Ok(document)
    }

    /// `listed` is the day of the summary the document came from, if any.
    fn parse_document(&self, url: &str, html: &str, listed: Option<NaiveDate>) -> Result<MetadataDocument, EtlError> {
        let document = Html::parse_document(html);
        let seccion = document
            .select(&selector("h4.BOPVSeccion"))
            .next()
            .map(|h| element_text_stripped(h, ""))
            .ok_or_else(|| EtlError::scrape(url, "missing h4.BOPVSeccion"))?;
        if !is_bopv_section(&seccion) {
            return Err(EtlError::skipped(url, format!("section {seccion}")));
        }

        let organismo = document
            .select(&selector("h5.BOPVOrganismo"))
            .next()
            .map(|h| element_text_stripped(h, ""))
            .ok_or_else(|| EtlError::scrape(url, "missing h5.BOPVOrganismo"))?;
        let content = document
            .select(&selector("div.colCentralinterior"))
            .next()
            .ok_or_else(|| EtlError::scrape(url, "missing div.colCentralinterior"))?;
        let pdf_href = document
            .select(&selector("li.formatoPdf a"))
            .next()
            .and_then(|a| a.value().attr("href"))
            .ok_or_else(|| EtlError::scrape(url, "missing PDF link"))?;

        let paragraph_sel = selector("p");
        let extra_sel = selector("h5, div");
        let paragraphs = content
            .select(&paragraph_sel)
            .filter(|p| has_class(*p, &BODY_PARAGRAPH));
        let extras = content
            .select(&extra_sel)
            .filter(|e| has_class(*e, &BODY_EXTRA));
        let text = paragraphs
            .chain(extras)
            .map(|e| element_text_stripped(e, ""))
            .collect::<Vec<_>>()
            .join("\n");
        let fecha = listed
            .or_else(|| bulletin_date(url, &document))
            .ok_or_else(|| EtlError::scrape(url, "no bulletin date"))?;

        MetadataDocument::builder(Source::Bopv, identifier_from_url(url), SourceDetails::Bopv {
            tipologia: seccion,
        })
        .departamento(organismo)
        .fecha_publicacion(Some(fecha))
        .fecha_disposicion(Some(fecha))
        .url_html(url)
        .url_pdf(resolve_url(url_dir(url), pdf_href))
        .build(&clean_text(&text))
    }
}

impl Scraper for BopvScraper {
    fn source(&self) -> Source {
        Source::Bopv
    }

    #[instrument(level = "info", skip(self))]
    async fn download_day(&self, day: NaiveDate) -> Result<Vec<MetadataDocument>, EtlError> {
        let pending = discover(Source::Bopv, day, async {
            let Some(summary_url) = self.summary_url(day).await? else {
                info!(%day, "No BOPV bulletin published");
                return Ok(Vec::new());
            };
            let html = self.http.get_text(&summary_url, &[]).await?;
            self.list_summary(&summary_url, &html, day)
        })
        .await?;
        collect_documents(self, day, pending).await
    }

    async fn download_document(&self, reference: &DocumentRef) -> Result<MetadataDocument, EtlError> {
        self.fetch_document(reference, None).await
    }

    async fn download_listed(
        &self,
        reference: &DocumentRef,
        summary: &DispositionSummary,
    ) -> Result<MetadataDocument, EtlError> {
        let mut document = self.fetch_document(reference, summary.fecha_publicacion).await?;
        document.apply_summary(summary.clone());
        Ok(document)
    }
}
