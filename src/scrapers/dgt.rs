//! DGT (Dirección General de Tributos) binding consultations scraper.
//!
//! The PETETE search form is posted once per result tab with the day as both
//! date bounds. A tab without results answers with a sentinel sentence;
//! otherwise `span#total_pages` gives the page count and every
//! `td[id^=doc_]` cell carries a document id.
//!
//! The host serves a certificate chain that does not validate, so this
//! scraper builds its own client with verification disabled and the AJAX
//! headers the portal expects.

use super::{collect_documents, discover, selector, DocumentRef, Pending, Scraper, Source};
use crate::config::HttpConfig;
use crate::error::EtlError;
use crate::http::HttpClient;
use crate::models::{DispositionSummary, MetadataDocument, SourceDetails};
use crate::rules::text::{element_text, element_text_stripped};
use crate::utils::parse_date;
use chrono::NaiveDate;
use scraper::{ElementRef, Html, Node};
use tracing::{debug, info, instrument};

const BASE_URL: &str = "https://petete.tributos.hacienda.gob.es/consultas";
const REFERER: &str = "https://petete.tributos.hacienda.gob.es/consultas";
const NO_RESULTS: &str = "La consulta realizada no devuelve resultados";
const COMPLETE_ANSWER: &str = "Contestación completa";
const TABS: [&str; 2] = ["1", "2"];

/// Classes whose root elements make up the consultation text, in order.
const TEXT_SECTIONS: [(&str, &str); 4] = [
    ("NORMATIVA", ".NORMATIVA"),
    ("DESCRIPCION-HECHOS", ".DESCRIPCION-HECHOS"),
    ("CUESTION-PLANTEADA", ".CUESTION-PLANTEADA"),
    ("CONTESTACION-COMPL", ".CONTESTACION-COMPL"),
];

/// Fixed fields of the search form.
const SEARCH_FORM: [(&str, &str); 23] = [
    ("type1", "on"),
    ("type2", "on"),
    ("NMCMP_1", "NUM-CONSULTA"),
    ("VLCMP_1", ""),
    ("OPCMP_1", ".Y"),
    ("NMCMP_2", "FECHA-SALIDA"),
    ("OPCMP_2", ".Y"),
    ("NMCMP_3", "NORMATIVA"),
    ("VLCMP_3", ""),
    ("OPCMP_3", ".Y"),
    ("NMCMP_4", "CUESTION-PLANTEADA"),
    ("VLCMP_4", ""),
    ("OPCMP_4", ".Y"),
    ("NMCMP_5", "DESCRIPCION-HECHOS"),
    ("VLCMP_5", ""),
    ("OPCMP_5", ".Y"),
    ("NMCMP_6", "FreeText"),
    ("VLCMP_6", ""),
    ("OPCMP_6", ".Y"),
    ("NMCMP_7", "CRITERIO"),
    ("cmpOrder", "NUM-CONSULTA"),
    ("dirOrder", "0"),
    ("auto", ""),
];

#[derive(Debug, Clone)]
pub struct DgtScraper {
    http: HttpClient,
    base_url: String,
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage {
    pub total_pages: usize,
    pub doc_ids: Vec<String>,
}

/// `None` when the tab has no results.
pub fn parse_search_page(html: &str) -> Result<Option<SearchPage>, EtlError> {
    if html.contains(NO_RESULTS) {
        return Ok(None);
    }
    let document = Html::parse_document(html);
    let total_pages = document
        .select(&selector("span#total_pages"))
        .next()
        .and_then(|s| element_text(s).trim().parse::<usize>().ok())
        .ok_or_else(|| EtlError::scrape("DGT search", "missing span#total_pages"))?;
    let doc_ids = document
        .select(&selector(r#"td[id^="doc_"]"#))
        .filter_map(|td| td.value().id())
        .filter_map(|id| id.split('_').nth(1))
        .map(str::to_string)
        .collect();
    Ok(Some(SearchPage { total_pages, doc_ids }))
}

fn has_class(element: ElementRef<'_>, class: &str) -> bool {
    element.value().classes().any(|c| c == class)
}

/// Text of every element of each section class that is not nested in another
/// element of the same class.
pub fn consultation_text(document: &Html) -> String {
    let mut text = String::new();
    for (class, css) in TEXT_SECTIONS {
        for element in document.select(&selector(css)) {
            let nested = element
                .ancestors()
                .filter_map(ElementRef::wrap)
                .any(|ancestor| has_class(ancestor, class));
            if !nested {
                text.push_str(&element_text_stripped(element, "\n"));
                text.push_str("\n\n");
            }
        }
    }
    text
}

/// `tr.<class> p.<class>` values, concatenated.
fn row_value(document: &Html, class: &str) -> Option<String> {
    let row_sel = selector_for(&format!("tr.{class}"))?;
    let value_sel = selector_for(&format!("p.{class}"))?;
    let row = document.select(&row_sel).next()?;
    Some(
        row.select(&value_sel)
            .map(|p| element_text_stripped(p, "\n"))
            .collect::<String>(),
    )
}

fn selector_for(css: &str) -> Option<scraper::Selector> {
    scraper::Selector::parse(css).ok()
}

/// Last child of `div.doc_header`: the consultation kind.
fn header_kind(document: &Html) -> String {
    let Some(header) = document.select(&selector("div.doc_header")).next() else {
        return String::new();
    };
    let Some(last) = header.last_child() else {
        return String::new();
    };
    match last.value() {
        Node::Text(text) => text.trim().to_string(),
        Node::Element(_) => ElementRef::wrap(last)
            .map(|e| element_text(e).trim().to_string())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

fn doc_param(url: &str) -> Option<&str> {
    url.split_once("doc=")
        .map(|(_, rest)| rest.split('&').next().unwrap_or(rest))
        .filter(|id| !id.is_empty())
}

impl DgtScraper {
    pub fn new(config: &HttpConfig) -> Result<Self, EtlError> {
        Self::with_base_url(config, BASE_URL)
    }

    pub fn with_base_url(config: &HttpConfig, base_url: &str) -> Result<Self, EtlError> {
        let http = HttpClient::configured(config)
            .accept_invalid_certs(true)
            .header("referer", REFERER)
            .header("x-requested-with", "XMLHttpRequest")
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn document_url(&self, doc_id: &str, tab: &str) -> String {
        format!("{}/do/document?doc={}&tab={}", self.base_url, doc_id, tab)
    }

    async fn search(&self, date: &str, tab: &str, page: usize) -> Result<Option<SearchPage>, EtlError> {
        let range = format!("{date}..{date}");
        let page = page.to_string();
        let mut form: Vec<(&str, &str)> = SEARCH_FORM.to_vec();
        form.extend([
            ("VLCMP_2", range.as_str()),
            ("dateIni_2", date),
            ("dateEnd_2", date),
            ("tab", tab),
            ("page", page.as_str()),
        ]);
        let url = format!("{}/do/search", self.base_url);
        let html = self.http.post_form_text(&url, &form).await?;
        parse_search_page(&html)
    }

    /// Document URLs of every consultation answered on `day`, tab by tab.
    #[instrument(level = "info", skip(self))]
    async fn list_day(&self, day: NaiveDate) -> Result<Vec<String>, EtlError> {
        let date = day.format("%d/%m/%Y").to_string();
        let mut urls = Vec::new();
        for tab in TABS {
            let Some(first) = self.search(&date, tab, 1).await? else {
                debug!(%day, tab, "No DGT results in tab");
                continue;
            };
            let mut ids = first.doc_ids;
            for page in 2..=first.total_pages {
                if let Some(next) = self.search(&date, tab, page).await? {
                    ids.extend(next.doc_ids);
                }
            }
            debug!(%day, tab, pages = first.total_pages, count = ids.len(), "DGT tab listed");
            urls.extend(ids.iter().map(|id| self.document_url(id, tab)));
        }
        Ok(urls)
    }

    fn parse_document(&self, url: &str, html: &str) -> Result<MetadataDocument, EtlError> {
        let document = Html::parse_document(html);
        let text = consultation_text(&document);
        if !text.contains(COMPLETE_ANSWER) {
            return Err(EtlError::skipped(url, "consultation without a complete answer"));
        }

        let required = |class: &str| {
            row_value(&document, class)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| EtlError::scrape(url, format!("missing {class}")))
        };
        let numero_consulta = required("NUM-CONSULTA")?;
        let organo = required("ORGANO")?;
        let salida = required("FECHA-SALIDA")?;
        let fecha = parse_date(&salida)
            .ok_or_else(|| EtlError::scrape(url, format!("unparseable FECHA-SALIDA {salida}")))?;
        let normativa = row_value(&document, "NORMATIVA").unwrap_or_default();
        let identificador = doc_param(url).ok_or_else(|| EtlError::scrape(url, "no doc parameter"))?;

        MetadataDocument::builder(Source::Dgt, identificador, SourceDetails::Dgt {
            numero_consulta,
            organo: organo.clone(),
            normativa,
        })
        .source_type(header_kind(&document))
        .departamento(organo)
        .fecha_publicacion(Some(fecha))
        .fecha_disposicion(Some(fecha))
        .url_html(url)
        .build(&text)
    }
}

impl Scraper for DgtScraper {
    fn source(&self) -> Source {
        Source::Dgt
    }

    #[instrument(level = "info", skip(self))]
    async fn download_day(&self, day: NaiveDate) -> Result<Vec<MetadataDocument>, EtlError> {
        let pending = discover(Source::Dgt, day, async {
            let urls = self.list_day(day).await?;
            Ok(urls
                .into_iter()
                .map(|url| {
                    Pending::new(
                        DocumentRef::Url(url.clone()),
                        DispositionSummary {
                            url_html: Some(url),
                            ..Default::default()
                        },
                    )
                })
                .collect())
        })
        .await?;
        collect_documents(self, day, pending).await
    }

    #[instrument(level = "info", skip_all, fields(reference = %reference))]
    async fn download_document(&self, reference: &DocumentRef) -> Result<MetadataDocument, EtlError> {
        let DocumentRef::Url(url) = reference else {
            return Err(EtlError::scrape(reference.to_string(), "DGT consultations are fetched by URL"));
        };
        let html = self.http.get_text(url, &[]).await?;
        let document = self.parse_document(url, &html)?;
        info!(identificador = %document.identificador, "Scraped DGT consultation");
        Ok(document)
    }
}
