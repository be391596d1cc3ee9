//! BOPZ (Boletín Oficial de la Provincia de Zaragoza) scraper.
//!
//! The edict search form is posted with the publication date as both bounds,
//! restricted to the Zaragoza city council. Each `div.row.listadoEdictos` row
//! whose attachment is a bulletin PDF becomes a [`DocumentRef::Fragment`]
//! holding the row HTML; the text comes from the attached PDF.

use super::{collect_documents, discover, selector, DocumentRef, Pending, Scraper, Source};
use crate::error::EtlError;
use crate::http::HttpClient;
use crate::models::{MetadataDocument, SourceDetails};
use crate::pdf;
use crate::rules::text::{clean_pdf_text, element_text};
use crate::utils::parse_date;
use chrono::NaiveDate;
use scraper::{ElementRef, Html, Node};
use tracing::{info, instrument};

const BASE_URL: &str = "http://bop.dpz.es/BOPZ";
const SEARCH_PATH: &str = "portalBuscarEdictos.do";
const BULLETIN_ATTACHMENT: &str = "UploadServlet?ruta=Boletines";

/// Fixed fields of the edict search form.
const SEARCH_FORM: [(&str, &str); 25] = [
    ("numPag", ""),
    ("idProcedente", "8610"),
    ("idPortador", ""),
    ("hProcedente", " AYUNTAMIENTO DE ZARAGOZA"),
    ("hPortador", ""),
    ("idPagadora", "8610"),
    ("hPagadora", " AYUNTAMIENTO DE ZARAGOZA"),
    ("primeraVez", "N"),
    ("ficheroDoc", "N"),
    ("numRegistroInf", ""),
    ("numRegistroSup", ""),
    ("esPortalSN", "S"),
    ("numBoletinInf", ""),
    ("numRegistroNumInf", ""),
    ("numRegistroAnyoInf", ""),
    ("numRegistroNumSup", ""),
    ("numRegistroAnyoSup", ""),
    ("numBoletinAuxInf", ""),
    ("anyoBoletinInf", ""),
    ("numBoletinSup", ""),
    ("anyoBoletinSup", ""),
    ("procedente", " AYUNTAMIENTO DE ZARAGOZA"),
    ("tematica", ""),
    ("titulo", ""),
    ("contenido", ""),
];

#[derive(Debug, Clone)]
pub struct BopzScraper {
    http: HttpClient,
    base_url: String,
}

/// Fields read from one listing row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdictRow {
    pub url_pdf: String,
    pub registro: Option<String>,
    pub publicador: Option<String>,
    pub materia: Option<String>,
    pub fecha_publicacion: Option<NaiveDate>,
}

fn attachment_href(row: ElementRef<'_>) -> Option<&str> {
    row.select(&selector("a.adjunto"))
        .next()
        .and_then(|a| a.value().attr("href"))
}

fn is_bulletin_pdf(href: &str) -> bool {
    href.contains(BULLETIN_ATTACHMENT) && href.ends_with(".pdf")
}

/// Text right after the `span` whose text contains `label`.
fn labelled_value(row: ElementRef<'_>, label: &str) -> Option<String> {
    let span = row
        .select(&selector("span"))
        .find(|s| element_text(*s).contains(label))?;
    let sibling = span.next_sibling()?;
    let value = match sibling.value() {
        Node::Text(text) => text.trim().to_string(),
        Node::Element(_) => ElementRef::wrap(sibling).map(element_text)?.trim().to_string(),
        _ => return None,
    };
    (!value.is_empty()).then_some(value)
}

/// HTML of every listing row pointing at a bulletin PDF.
pub fn listing_rows(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    document
        .select(&selector("div.row.listadoEdictos"))
        .filter(|row| attachment_href(*row).is_some_and(is_bulletin_pdf))
        .map(|row| row.html())
        .collect()
}

impl BopzScraper {
    pub fn new(http: HttpClient) -> Self {
        Self::with_base_url(http, BASE_URL)
    }

    pub fn with_base_url(http: HttpClient, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Read a listing row. Attachment links are relative to the portal root.
    pub fn parse_row(&self, fragment: &str) -> Result<EdictRow, EtlError> {
        let html = Html::parse_fragment(fragment);
        let row = html
            .select(&selector("div.row.listadoEdictos"))
            .next()
            .unwrap_or_else(|| html.root_element());
        let href = attachment_href(row)
            .filter(|href| is_bulletin_pdf(href))
            .ok_or_else(|| EtlError::scrape("BOPZ listing row", "row has no bulletin PDF"))?;
        let path = href.strip_prefix('.').unwrap_or(href).trim_start_matches('/');

        Ok(EdictRow {
            url_pdf: format!("{}/{}", self.base_url, path),
            registro: labelled_value(row, "Nº. Reg:"),
            publicador: labelled_value(row, "Publicador:"),
            materia: labelled_value(row, "Materia"),
            fecha_publicacion: labelled_value(row, "Fecha Pub:").and_then(|d| parse_date(&d)),
        })
    }

    #[instrument(level = "info", skip(self))]
    async fn search_day(&self, day: NaiveDate) -> Result<Vec<String>, EtlError> {
        let date = day.format("%d/%m/%Y").to_string();
        let mut form: Vec<(&str, &str)> = SEARCH_FORM.to_vec();
        form.push(("fechaPubInf", date.as_str()));
        form.push(("fechaPubSup", date.as_str()));

        let url = format!("{}/{}", self.base_url, SEARCH_PATH);
        let html = self.http.post_form_text(&url, &form).await?;
        Ok(listing_rows(&html))
    }
}

impl Scraper for BopzScraper {
    fn source(&self) -> Source {
        Source::Bopz
    }

    #[instrument(level = "info", skip(self))]
    async fn download_day(&self, day: NaiveDate) -> Result<Vec<MetadataDocument>, EtlError> {
        let pending = discover(Source::Bopz, day, async {
            let rows = self.search_day(day).await?;
            Ok(rows
                .into_iter()
                .map(|row| Pending::from(DocumentRef::Fragment(row)))
                .collect())
        })
        .await?;
        collect_documents(self, day, pending).await
    }

    #[instrument(level = "info", skip_all, fields(reference = %reference))]
    async fn download_document(&self, reference: &DocumentRef) -> Result<MetadataDocument, EtlError> {
        let DocumentRef::Fragment(fragment) = reference else {
            return Err(EtlError::scrape(
                reference.to_string(),
                "BOPZ documents are listing rows, not URLs",
            ));
        };
        let row = self.parse_row(fragment)?;
        let Some(fecha) = row.fecha_publicacion else {
            return Err(EtlError::scrape(row.url_pdf, "row has no Fecha Pub"));
        };
        let bytes = self.http.get_bytes(&row.url_pdf).await?;
        let text = clean_pdf_text(&pdf::extract_text(&row.url_pdf, bytes).await?);

        let registro = row.registro.unwrap_or_default();
        let numero_oficial = registro.split('/').next().unwrap_or_default().to_string();
        let titulo = format!("BOPZ-{}", registro.replace('/', "-"));
        let document = MetadataDocument::builder(Source::Bopz, registro, SourceDetails::Bopz {
            numero_oficial,
            materia: row.materia.into_iter().collect(),
        })
        .titulo(titulo)
        .departamento(row.publicador.unwrap_or_default())
        .fecha_publicacion(Some(fecha))
        .fecha_disposicion(Some(fecha))
        .url_pdf(row.url_pdf)
        .build(&text)?;
        info!(identificador = %document.identificador, "Scraped BOPZ document");
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LISTING: &str = r#"<html><body>
        <div class="row listadoEdictos">
            <span class="negrita">Nº. Reg:</span> 6523/2024
            <span class="negrita">Publicador:</span> AYUNTAMIENTO DE ZARAGOZA
            <span class="negrita">Materia</span> Urbanismo
            <span class="negrita">Fecha Pub:</span> 15/07/2024
            <a class="adjunto" href="./UploadServlet?ruta=Boletines/2024/159/Edictos/bop_6523_2024.pdf">PDF</a>
        </div>
        <div class="row listadoEdictos">
            <span class="negrita">Nº. Reg:</span> 6524/2024
            <a class="adjunto" href="./UploadServlet?ruta=Anexos/2024/anexo.doc">DOC</a>
        </div>
    </body></html>"#;

    fn scraper(base: &str) -> BopzScraper {
        let http = HttpClient::builder()
            .retry_policy(RetryPolicy::fixed(1, Duration::from_millis(1)))
            .build()
            .unwrap();
        BopzScraper::with_base_url(http, base)
    }

    #[test]
    fn test_listing_keeps_bulletin_pdfs() {
        let rows = listing_rows(LISTING);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].contains("6523/2024"));
    }

    #[test]
    fn test_parse_row_fields() {
        let rows = listing_rows(LISTING);
        let row = scraper("http://bop.dpz.es/BOPZ").parse_row(&rows[0]).unwrap();
        assert_eq!(
            row.url_pdf,
            "http://bop.dpz.es/BOPZ/UploadServlet?ruta=Boletines/2024/159/Edictos/bop_6523_2024.pdf"
        );
        assert_eq!(row.registro.as_deref(), Some("6523/2024"));
        assert_eq!(row.publicador.as_deref(), Some("AYUNTAMIENTO DE ZARAGOZA"));
        assert_eq!(row.materia.as_deref(), Some("Urbanismo"));
        assert_eq!(row.fecha_publicacion, NaiveDate::from_ymd_opt(2024, 7, 15));
    }

    #[tokio::test]
    async fn test_url_reference_is_rejected() {
        let err = scraper("http://bop.dpz.es/BOPZ")
            .download_document(&DocumentRef::Url("http://bop.dpz.es/BOPZ/x.pdf".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::Scrape { .. }));
    }

    #[tokio::test]
    async fn test_row_without_publication_date_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not a pdf".to_vec()))
            .expect(0)
            .mount(&server)
            .await;

        let row = listing_rows(LISTING)[0].replace("Fecha Pub:", "Fecha Alta:");
        let err = scraper(&format!("{}/BOPZ", server.uri()))
            .download_document(&DocumentRef::Fragment(row))
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::Scrape { ref reason, .. } if reason == "row has no Fecha Pub"));
    }

    #[tokio::test]
    async fn test_day_drops_unreadable_pdf() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/BOPZ/portalBuscarEdictos.do"))
            .and(body_string_contains("fechaPubInf=15%2F07%2F2024"))
            .and(body_string_contains("idProcedente=8610"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LISTING))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/BOPZ/UploadServlet"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not a pdf".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let day = NaiveDate::from_ymd_opt(2024, 7, 15).unwrap();
        let docs = scraper(&format!("{}/BOPZ", server.uri()))
            .download_day(day)
            .await
            .unwrap();
        assert!(docs.is_empty());
    }
}
