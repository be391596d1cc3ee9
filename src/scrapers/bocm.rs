//! BOCM (Boletín Oficial de la Comunidad de Madrid) scraper.
//!
//! There is no dated URL for a bulletin. Posting the date to `search-day-month`
//! answers with a `Link` header naming the day's bulletin, which is rewritten
//! into its complete summary:
//!
//! ```text
//! https://www.bocm.es/boletin/bocm-20240126-22
//!   -> https://www.bocm.es/boletin-completo/BOCM-20240126/22
//! ```
//!
//! A `Link` that still points at `search-day-month` means nothing was published.

use super::{collect_documents, discover, selector, DocumentRef, Pending, Scraper, Source};
use crate::error::EtlError;
use crate::http::HttpClient;
use crate::models::{MetadataDocument, SourceDetails};
use crate::rules::sections::{classify_bocm_headers, origen_legislativo, BOCM_SECTIONS};
use crate::rules::text::element_text;
use crate::utils::parse_date;
use chrono::NaiveDate;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, info, instrument};

const BASE_URL: &str = "https://www.bocm.es";

static CVE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^BOCM-\d{8}-\d{1,3}$").expect("cve regex"));
static NUMBERED_PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d)-(\d+)").expect("numbered path regex"));

#[derive(Debug, Clone)]
pub struct BocmScraper {
    http: HttpClient,
    base_url: String,
}

/// Turn the `Link` target of a bulletin into its complete summary URL.
pub fn complete_summary_url(link: &str) -> String {
    let link = link.replace("boletin", "boletin-completo").replace("/bocm", "/BOCM");
    NUMBERED_PATH.replace_all(&link, "${1}/${2}").into_owned()
}

/// First URL of a `Link` header value.
fn link_target(header: &str) -> Option<String> {
    let target = header.split(';').next()?.trim().trim_start_matches('<').trim_end_matches('>');
    (!target.is_empty()).then(|| target.to_string())
}

impl BocmScraper {
    pub fn new(http: HttpClient) -> Self {
        Self::with_base_url(http, BASE_URL)
    }

    pub fn with_base_url(http: HttpClient, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Complete summary URL of the day's bulletin, `None` when nothing was published.
    #[instrument(level = "info", skip(self))]
    async fn summary_url(&self, day: NaiveDate) -> Result<Option<String>, EtlError> {
        let search_url = format!("{}/search-day-month", self.base_url);
        let date = day.format("%d/%m/%Y").to_string();
        let response = self
            .http
            .post_form(&search_url, &[("field_date[date]", date.as_str())])
            .await?;

        let link = response
            .headers()
            .get("link")
            .and_then(|v| v.to_str().ok())
            .and_then(link_target)
            .ok_or_else(|| EtlError::scrape(&search_url, "response has no Link header"))?;

        if link.contains("search-day-month") {
            info!(%day, "No BOCM bulletin published");
            return Ok(None);
        }
        Ok(Some(complete_summary_url(&link)))
    }

    /// Links of the summary restricted to the indexed sections, in page order.
    fn filter_links(&self, html: &str) -> Result<Vec<String>, EtlError> {
        let document = Html::parse_document(html);
        let mut links = Vec::new();
        for filter in BOCM_SECTIONS {
            let found = self.section_links(&document, filter)?;
            debug!(section = filter, count = found.len(), "BOCM section links");
            links.extend(found);
        }
        Ok(links
            .into_iter()
            .filter(|url| !url.contains("boletin"))
            .unique()
            .collect())
    }

    fn section_links(&self, document: &Html, filter: &str) -> Result<Vec<String>, EtlError> {
        let (section, subsection) = filter.split_once('-').unwrap_or((filter, ""));
        let container_css = format!(r#"div[id*="secciones-seccion_{section}"]"#);
        let container_sel = Selector::parse(&container_css)
            .map_err(|e| EtlError::scrape(&container_css, e.to_string()))?;
        let Some(container) = document.select(&container_sel).next() else {
            return Ok(Vec::new());
        };

        let link_sel = selector(r#"a[href*="bocm-"]"#);
        let absolute = |href: &str| format!("{}{}", self.base_url, href);

        if subsection.is_empty() {
            return Ok(container
                .select(&link_sel)
                .filter_map(|a| a.value().attr("href"))
                .map(&absolute)
                .collect());
        }

        let (header_sel, content_sel) = if section == "1" {
            (selector(".view-grouping-header h3"), selector(".view-grouping-content"))
        } else {
            (selector(".view-content h3"), selector(".view-content"))
        };
        let wanted = format!("{subsection})");

        let mut links = Vec::new();
        for group in container.select(&selector(".view-grouping")) {
            let title = group.select(&header_sel).next().map(element_text).unwrap_or_default();
            if !title.contains(&wanted) {
                continue;
            }
            for content in group.select(&content_sel) {
                links.extend(
                    content
                        .select(&link_sel)
                        .filter_map(|a| a.value().attr("href"))
                        .map(&absolute),
                );
            }
        }
        Ok(links)
    }

    fn parse_document(&self, url: &str, html: &str) -> Result<MetadataDocument, EtlError> {
        let document = Html::parse_document(html);
        let meta = |css: &'static str| {
            document
                .select(&selector(css))
                .next()
                .and_then(|m| m.value().attr("content"))
                .map(|c| c.trim().to_string())
        };

        let cve = meta(r#"meta[name="TituloGSA"]"#)
            .ok_or_else(|| EtlError::scrape(url, "missing TituloGSA meta"))?;
        if !CVE.is_match(&cve) {
            return Err(EtlError::scrape(url, format!("{cve} is not a valid CVE")));
        }
        let fecha_publicacion = cve
            .split('-')
            .nth(1)
            .and_then(parse_date)
            .ok_or_else(|| EtlError::scrape(url, format!("{cve} carries no valid date")))?;
        let url_html = meta(r#"meta[property="og:url"]"#)
            .ok_or_else(|| EtlError::scrape(url, "missing og:url meta"))?;
        let description = meta(r#"meta[name="description"]"#).unwrap_or_default();

        let numero_oficial = document
            .select(&selector(".cabecera_popup h1 strong"))
            .next()
            .map(element_text)
            .and_then(|t| {
                let part = t.split('-').nth(1)?.trim().to_string();
                part.split(' ').nth(1).map(|n| n.trim().to_string())
            })
            .ok_or_else(|| EtlError::scrape(url, "missing bulletin number in .cabecera_popup"))?;

        let header_fields: Vec<Vec<String>> = document
            .select(&selector("#titulo_cabecera h2"))
            .map(|h| element_text(h).split(':').map(|s| s.trim().to_string()).collect())
            .collect();
        if header_fields.len() < 3 {
            return Err(EtlError::scrape(url, "incomplete #titulo_cabecera"));
        }
        let seccion_full = header_fields[0].get(1).cloned().unwrap_or_default();
        let paginas = header_fields[2].get(1).cloned().unwrap_or_default();
        let url_pdf = document
            .select(&selector("#titulo_cabecera a"))
            .next()
            .and_then(|a| a.value().attr("href"))
            .ok_or_else(|| EtlError::scrape(url, "missing PDF link"))?
            .to_string();

        let paras: Vec<String> = document
            .select(&selector("#cabeceras p"))
            .take(3)
            .map(|p| element_text(p).trim().to_uppercase())
            .collect();
        let headers = classify_bocm_headers(&paras, &description, &cve);

        let text = document
            .select(&selector("#main"))
            .next()
            .map(element_text)
            .ok_or_else(|| EtlError::scrape(url, "missing #main"))?;

        let departamento = if headers.organo.is_empty() {
            headers.anunciante.clone()
        } else {
            headers.organo.clone()
        };
        let details = SourceDetails::Bocm {
            numero_oficial,
            origen_legislativo: origen_legislativo(&headers.seccion).to_string(),
            seccion: headers.seccion,
            seccion_full,
            subseccion: headers.subseccion,
            apartado: headers.apartado,
            rango: headers.rango,
            anunciante: headers.anunciante,
            paginas,
        };

        MetadataDocument::builder(Source::Bocm, cve.clone(), details)
            .titulo(cve)
            .departamento(departamento)
            .fecha_publicacion(Some(fecha_publicacion))
            .fecha_disposicion(Some(fecha_publicacion))
            .url_html(url_html)
            .url_pdf(url_pdf)
            .build(&text)
    }
}

impl Scraper for BocmScraper {
    fn source(&self) -> Source {
        Source::Bocm
    }

    #[instrument(level = "info", skip(self))]
    async fn download_day(&self, day: NaiveDate) -> Result<Vec<MetadataDocument>, EtlError> {
        let pending = discover(Source::Bocm, day, async {
            let Some(summary) = self.summary_url(day).await? else {
                return Ok(Vec::new());
            };
            info!(%summary, "BOCM summary for day");
            let html = self.http.get_text(&summary, &[]).await?;
            let links = self.filter_links(&html)?;
            Ok(links
                .into_iter()
                .map(|url| Pending::from(DocumentRef::Url(url)))
                .collect())
        })
        .await?;
        collect_documents(self, day, pending).await
    }

    #[instrument(level = "info", skip_all, fields(reference = %reference))]
    async fn download_document(&self, reference: &DocumentRef) -> Result<MetadataDocument, EtlError> {
        let (url, html) = match reference {
            DocumentRef::Url(url) => (url.as_str(), self.http.get_text(url, &[]).await?),
            DocumentRef::Fragment(html) => ("fragment", html.clone()),
        };
        let document = self.parse_document(url, &html)?;
        info!(identificador = %document.identificador, "Scraped BOCM document");
        Ok(document)
    }
}
