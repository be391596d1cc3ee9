//! BOJA (Boletín Oficial de la Junta de Andalucía) scraper.
//!
//! Discovery walks three levels:
//!
//! 1. the year page (`/eboja/YYYY`, `/boja/YYYY` before 2012) holds one
//!    `table.calendario_tabla` per month whose links are the day's bulletins;
//!    a link ending in `YYYYMMDD.html` is an index of the ordinary and
//!    extraordinary editions published that day
//! 2. each bulletin page lists its sections; only *Disposiciones Generales*
//!    and *Otras Disposiciones* are followed
//! 3. each section listing links the HTML version of every disposition
//!
//! Listed dispositions are dated by the bulletin day. A disposition fetched
//! by URL alone is dated by the `BOJA núm. N de dd/mm/yyyy` line of its page.

use super::{collect_documents, discover, selector, DocumentRef, Pending, Scraper, Source};
use crate::error::EtlError;
use crate::http::HttpClient;
use crate::models::{DispositionSummary, MetadataDocument, SourceDetails};
use crate::rules::sections::{boja_tipologia, is_boja_listing};
use crate::rules::text::{clean_text, element_text, marked_date, month_number};
use crate::utils::resolve_url;
use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html};
use tracing::{debug, info, instrument};

const BASE_URL: &str = "https://www.juntadeandalucia.es";

static MONTH_SUMMARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Boletines del mes de (\w+) de (\d{4})").expect("month summary regex"));
static EDITION_INDEX: Lazy<Regex> = Lazy::new(|| Regex::new(r".*/\d{8}\.html$").expect("edition index regex"));
static BULLETIN_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bBOJA\s+(núm|n\.?\s*º)").expect("bulletin number regex"));

#[derive(Debug, Clone)]
pub struct BojaScraper {
    http: HttpClient,
    base_url: String,
}

/// Link of the bulletin published on `day` in a year calendar page.
pub fn calendar_link(html: &str, page_url: &str, day: NaiveDate) -> Option<String> {
    let document = Html::parse_document(html);
    let link_sel = selector("a");
    for table in document.select(&selector("table.calendario_tabla")) {
        let summary = table.value().attr("summary").unwrap_or_default();
        let Some(caps) = MONTH_SUMMARY.captures(summary) else {
            continue;
        };
        let month = month_number(&caps[1]);
        let year = caps[2].parse::<i32>().ok();
        if month != Some(day.month()) || year != Some(day.year()) {
            continue;
        }

        for link in table.select(&link_sel) {
            let Ok(number) = element_text(link).trim().parse::<u32>() else {
                continue;
            };
            if number == day.day() {
                if let Some(href) = link.value().attr("href") {
                    return Some(resolve_url(page_url, href));
                }
            }
        }
    }
    None
}

/// Bulletin URLs listed by an edition index page.
fn edition_links(html: &str, page_url: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    document
        .select(&selector("ul.mt-4.pl-3 a[href]"))
        .filter_map(|a| a.value().attr("href"))
        .map(|href| resolve_url(page_url, href))
        .collect()
}

/// Section listing URLs of a bulletin restricted to the indexed sections.
pub fn section_links(html: &str, page_url: &str) -> Result<Vec<String>, EtlError> {
    let document = Html::parse_document(html);
    let root = document
        .select(&selector("ol.listado_ordenado_boja.raiz"))
        .next()
        .or_else(|| {
            document
                .select(&selector(".listado_ordenado_boja, .listado_ordenado"))
                .find(|e| matches!(e.value().name(), "ol" | "ul"))
        })
        .ok_or_else(|| EtlError::scrape(page_url, "no section listing in bulletin"))?;

    Ok(root
        .select(&selector("a"))
        .filter(|a| is_boja_listing(&element_text(*a)))
        .filter_map(|a| a.value().attr("href"))
        .map(|href| resolve_url(page_url, href))
        .collect())
}

/// Disposition links of a section listing, HTML versions first.
fn disposition_links(html: &str, page_url: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let html_version_sel = selector(r#"a.item_html[title*="Versión HTML CVE"]"#);
    let detail_sel = selector(r#"a[title="Ver disposición"]"#);
    document
        .select(&html_version_sel)
        .chain(document.select(&detail_sel))
        .filter_map(|a| a.value().attr("href"))
        .map(|href| resolve_url(page_url, href))
        .collect()
}

fn is_alert(paragraph: ElementRef<'_>) -> bool {
    paragraph
        .parent()
        .and_then(ElementRef::wrap)
        .map(|parent| parent.value().classes().eq(["alerta"]))
        .unwrap_or(false)
}

fn first_text(scope: ElementRef<'_>, css: &'static str) -> Option<String> {
    scope
        .select(&selector(css))
        .next()
        .map(|e| element_text(e).trim().to_string())
}

impl BojaScraper {
    pub fn new(http: HttpClient) -> Self {
        Self::with_base_url(http, BASE_URL)
    }

    pub fn with_base_url(http: HttpClient, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Bulletins published on `day`: one, or several when the day has an edition index.
    #[instrument(level = "info", skip(self))]
    async fn bulletins(&self, day: NaiveDate) -> Result<Vec<String>, EtlError> {
        let collection = if day.year() >= 2012 { "eboja" } else { "boja" };
        let year_url = format!("{}/{}/{}", self.base_url, collection, day.year());
        let calendar = self.http.get_text(&year_url, &[]).await?;

        let Some(link) = calendar_link(&calendar, &year_url, day) else {
            return Ok(Vec::new());
        };
        if !EDITION_INDEX.is_match(&link) {
            return Ok(vec![link]);
        }
        let index = self.http.get_text(&link, &[]).await?;
        let editions = edition_links(&index, &link);
        debug!(%link, count = editions.len(), "BOJA edition index");
        Ok(editions)
    }

    async fn dispositions(&self, bulletin: &str, day: NaiveDate) -> Result<Vec<Pending>, EtlError> {
        let html = self.http.get_text(bulletin, &[]).await?;
        let mut pending = Vec::new();
        for listing in section_links(&html, bulletin)? {
            let listing_html = self.http.get_text(&listing, &[]).await?;
            pending.extend(disposition_links(&listing_html, &listing).into_iter().map(|url| {
                Pending::new(
                    DocumentRef::Url(url.clone()),
                    DispositionSummary {
                        url_html: Some(url),
                        url_boletin: Some(bulletin.to_string()),
                        fecha_publicacion: Some(day),
                        fecha_disposicion: Some(day),
                        ..Default::default()
                    },
                )
            }));
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
            return Err(EtlError::scrape(reference.to_string(), "BOJA documents are fetched by URL"));
        };
        let html = self.http.get_text(url, &[]).await?;
        let document = self.parse_document(url, &html, listed)?;
        info!(identificador = %document.identificador, "Scraped BOJA document");
        Ok(document)
    }

    /// `listed` is the bulletin day the document was discovered on, if any.
    fn parse_document(&self, url: &str, html: &str, listed: Option<NaiveDate>) -> Result<MetadataDocument, EtlError> {
        let document = Html::parse_document(html);
        let cuerpo = document
            .select(&selector("#cuerpo"))
            .next()
            .ok_or_else(|| EtlError::scrape(url, "missing #cuerpo"))?;
        let cabecera = document
            .select(&selector(".cabecera_detalle_disposicion"))
            .next()
            .ok_or_else(|| EtlError::scrape(url, "missing .cabecera_detalle_disposicion"))?;

        let titulo = first_text(cabecera, "div.item p")
            .or_else(|| first_text(cabecera, "h4"))
            .unwrap_or_default();
        let tipo = first_text(cabecera, "h2").unwrap_or_default();
        let organo = first_text(cabecera, "h5")
            .or_else(|| first_text(cabecera, "h3"))
            .unwrap_or_default();
        let url_pdf = document
            .select(&selector("a.item_pdf_disposicion"))
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(|href| resolve_url(url, href))
            .ok_or_else(|| EtlError::scrape(url, "missing PDF link"))?;

        let text: String = cuerpo
            .select(&selector("p"))
            .filter(|p| !is_alert(*p))
            .map(|p| element_text(p) + "\n")
            .collect();

        let fecha = listed
            .or_else(|| marked_date(document.root_element(), &BULLETIN_NUMBER, Some("boja_disposicion")))
            .ok_or_else(|| EtlError::scrape(url, "no bulletin date"))?;

        let mut segments: Vec<&str> = url.rsplit('/').take(3).collect();
        segments.reverse();
        let identificador = segments.join("/");
        MetadataDocument::builder(Source::Boja, identificador, SourceDetails::Boja {
            tipologia: boja_tipologia(&tipo),
        })
        .titulo(titulo)
        .departamento(clean_text(&organo))
        .fecha_publicacion(Some(fecha))
        .fecha_disposicion(Some(fecha))
        .url_pdf(url_pdf)
        .url_html(url)
        .build(clean_text(&text).trim())
    }
}

impl Scraper for BojaScraper {
    fn source(&self) -> Source {
        Source::Boja
    }

    #[instrument(level = "info", skip(self))]
    async fn download_day(&self, day: NaiveDate) -> Result<Vec<MetadataDocument>, EtlError> {
        let pending = discover(Source::Boja, day, async {
            let bulletins = self.bulletins(day).await?;
            if bulletins.is_empty() {
                info!(%day, "No BOJA bulletin published");
            }
            let mut pending = Vec::new();
            for bulletin in &bulletins {
                pending.extend(self.dispositions(bulletin, day).await?);
            }
            Ok(pending)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn calendar(bulletin_href: &str) -> String {
        format!(
            r#"<html><body>
            <table class="calendario_tabla" summary="Boletines del mes de Diciembre de 2023">
                <tr><td><a href="/eboja/2023/250/index.html">29</a></td></tr>
            </table>
            <table class="calendario_tabla" summary="Boletines del mes de Enero de 2024">
                <tr><td>1</td><td><a href="{bulletin_href}">2</a></td><td><a href="/eboja/2024/2/index.html">3</a></td></tr>
            </table>
            </body></html>"#
        )
    }

    const BULLETIN: &str = r#"<html><body>
        <ol class="listado_ordenado_boja raiz">
            <li><a href="/eboja/2024/1/s1.html">1. Disposiciones generales</a></li>
            <li><a href="/eboja/2024/1/s2.html">2. Autoridades y personal</a></li>
            <li><a href="/eboja/2024/1/s3.html">3. Otras disposiciones</a></li>
        </ol>
    </body></html>"#;

    const LISTING_GENERAL: &str = r#"<html><body>
        <a class="item_html" title="Versión HTML CVE BOJA-b-24-00001-0001" href="/eboja/2024/1/1">HTML</a>
    </body></html>"#;

    const LISTING_OTHER: &str = r#"<html><body>
        <a title="Ver disposición" href="/eboja/2024/1/2">Ver</a>
    </body></html>"#;

    const BULLETIN_LINE: &str = r#"<p class="numero_boletin">BOJA núm. 1 de 02/01/2024</p>"#;

    const DOCUMENT: &str = r#"<html><body>
        <p class="numero_boletin">BOJA núm. 1 de 02/01/2024</p>
        <div class="punteado_izquierda cabecera_detalle_disposicion">
            <h2>1. Disposiciones generales</h2>
            <h3>Consejería de Economía,&nbsp;Hacienda y Fondos Europeos</h3>
            <div class="item"><p> Decreto 1/2024, de 2 de enero, por el que se regula el registro. </p></div>
        </div>
        <div id="cuerpo" class="grid_11 contenidos_nivel3 boja_disposicion">
            <p>El Estatuto de Autonomía establece</p>
            <p>Publicado en el BOJA núm. 200, de 18/10/2023</p>
            <div class="alerta"><p>Esta disposición ha sido corregida.</p></div>
            <p>DISPONGO</p>
            <a class="item_pdf_disposicion" href="/eboja/2024/1/BOJA24-001-00010-1-01_00001.pdf">PDF</a>
        </div>
    </body></html>"#;

    fn scraper(server: &MockServer) -> BojaScraper {
        let http = HttpClient::builder()
            .retry_policy(RetryPolicy::fixed(1, Duration::from_millis(1)))
            .build()
            .unwrap();
        BojaScraper::with_base_url(http, &server.uri())
    }

    async fn mount(server: &MockServer, at: &str, body: String) {
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[test]
    fn test_calendar_link_matches_month_and_day() {
        let html = calendar("/eboja/2024/1/index.html");
        let page = "https://www.juntadeandalucia.es/eboja/2024";
        let day = |m, d| NaiveDate::from_ymd_opt(2024, m, d).unwrap();
        assert_eq!(
            calendar_link(&html, page, day(1, 2)).as_deref(),
            Some("https://www.juntadeandalucia.es/eboja/2024/1/index.html")
        );
        assert_eq!(calendar_link(&html, page, day(1, 1)), None);
        assert_eq!(calendar_link(&html, page, day(2, 2)), None);
    }

    #[test]
    fn test_section_links_fall_back_to_plain_listing() {
        let html = r#"<ul class="listado_ordenado">
            <li><a href="s1.html">Disposiciones Generales</a></li>
            <li><a href="s5.html">Anuncios</a></li>
        </ul>"#;
        let links = section_links(html, "https://www.juntadeandalucia.es/boja/2010/3/").unwrap();
        assert_eq!(links, vec!["https://www.juntadeandalucia.es/boja/2010/3/s1.html"]);

        assert!(section_links("<p>vacío</p>", "https://x.es/").is_err());
    }

    #[tokio::test]
    async fn test_day_with_extraordinary_edition() {
        let server = MockServer::start().await;
        let uri = server.uri();
        mount(&server, "/eboja/2024", calendar("/eboja/2024/20240102.html")).await;
        mount(
            &server,
            "/eboja/2024/20240102.html",
            format!(r#"<ul class="mt-4 pl-3"><li><a href="{uri}/eboja/2024/1/index.html">BOJA número 1</a></li></ul>"#),
        )
        .await;
        mount(&server, "/eboja/2024/1/index.html", BULLETIN.to_string()).await;
        mount(&server, "/eboja/2024/1/s1.html", LISTING_GENERAL.to_string()).await;
        mount(&server, "/eboja/2024/1/s3.html", LISTING_OTHER.to_string()).await;
        mount(&server, "/eboja/2024/1/1", DOCUMENT.to_string()).await;
        mount(&server, "/eboja/2024/1/2", "<html><body>roto</body></html>".to_string()).await;

        let day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let docs = scraper(&server).download_day(day).await.unwrap();
        assert_eq!(docs.len(), 1);

        let doc = &docs[0];
        assert_eq!(doc.identificador, "2024/1/1");
        assert_eq!(doc.titulo, "Decreto 1/2024, de 2 de enero, por el que se regula el registro.");
        assert_eq!(doc.departamento, "Consejería de Economía, Hacienda y Fondos Europeos");
        assert_eq!(doc.url_boletin.as_deref(), Some(format!("{uri}/eboja/2024/1/index.html").as_str()));
        assert_eq!(
            doc.url_pdf.as_deref(),
            Some(format!("{uri}/eboja/2024/1/BOJA24-001-00010-1-01_00001.pdf").as_str())
        );
        assert_eq!(
            doc.scratch.read().unwrap(),
            "El Estatuto de Autonomía establece Publicado en el BOJA núm. 200, de 18/10/2023 DISPONGO"
        );
        assert_eq!(doc.metadata().unwrap()["tipologia"], "Disposiciones generales");
        assert_eq!(doc.fecha_publicacion, day);
    }

    #[tokio::test]
    async fn test_document_by_url_takes_bulletin_date() {
        let server = MockServer::start().await;
        mount(&server, "/eboja/2024/1/1", DOCUMENT.to_string()).await;
        mount(&server, "/eboja/2024/1/3", DOCUMENT.replace(BULLETIN_LINE, "")).await;

        let doc = scraper(&server)
            .download_document(&DocumentRef::Url(format!("{}/eboja/2024/1/1", server.uri())))
            .await
            .unwrap();
        assert_eq!(doc.fecha_publicacion, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(doc.fecha_disposicion, NaiveDate::from_ymd_opt(2024, 1, 2));

        let err = scraper(&server)
            .download_document(&DocumentRef::Url(format!("{}/eboja/2024/1/3", server.uri())))
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::Scrape { .. }));
    }

    #[tokio::test]
    async fn test_day_without_bulletin() {
        let server = MockServer::start().await;
        mount(&server, "/eboja/2024", calendar("/eboja/2024/1/index.html")).await;

        let day = NaiveDate::from_ymd_opt(2024, 1, 6).unwrap();
        assert!(scraper(&server).download_day(day).await.unwrap().is_empty());
    }
}
