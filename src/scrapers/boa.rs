//! BOA (Boletín Oficial de Aragón) scraper.
//!
//! The BRSCGI search endpoint answers a day query with a JSON array holding
//! every disposition, text included. Each array element becomes an in-memory
//! [`DocumentRef::Fragment`]; no per-document request is made.
//!
//! Records carry their publication date in `FechaPublicacion`. Day records
//! without it are stamped with the queried day before they become fragments.

use super::{collect_documents, discover, DocumentRef, Pending, Scraper, Source};
use crate::error::EtlError;
use crate::http::HttpClient;
use crate::models::{DispositionSummary, MetadataDocument, SourceDetails};
use crate::rules::text::html_to_text;
use crate::utils::parse_date;
use chrono::NaiveDate;
use serde_json::Value;
use tracing::{info, instrument};

const BASE_URL: &str = "https://www.boa.aragon.es/cgi-bin/EBOA/BRSCGI";
const NO_RESULTS: &str = "No se han recuperado documentos";
const SECTIONS: &str = "BOA+o+Disposiciones+o+Justicia+o+Anuncios";
const PUBLICATION_FIELD: &str = "FechaPublicacion";

#[derive(Debug, Clone)]
pub struct BoaScraper {
    http: HttpClient,
    base_url: String,
}

/// Links arrive wrapped as `` `url´`...``; keep the URL.
fn unwrap_link(raw: &str) -> String {
    let head = raw.split("´`").next().unwrap_or_default();
    head.chars().skip(1).collect::<String>().trim().to_string()
}

fn field(record: &Value, name: &str) -> String {
    match record.get(name) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

impl BoaScraper {
    pub fn new(http: HttpClient) -> Self {
        Self::with_base_url(http, BASE_URL)
    }

    pub fn with_base_url(http: HttpClient, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.to_string(),
        }
    }

    /// Raw JSON records published on `day`.
    #[instrument(level = "info", skip(self))]
    async fn search_day(&self, day: NaiveDate) -> Result<Vec<Value>, EtlError> {
        let publication = day.format("%Y%m%d").to_string();
        let sections = urlencoding::encode(SECTIONS);
        let query = [
            ("CMD", "VERLST"),
            ("BASE", "BZHT"),
            ("DOCS", "1-250"),
            ("SEC", "OPENDATABOAJSONAPP"),
            ("OUTPUTMODE", "JSON"),
            ("SEPARADOR", ""),
            ("PUBL-C", publication.as_str()),
            ("SECC-C", &*sections),
        ];
        let body = self.http.get_text(&self.base_url, &query).await?;
        if body.contains(NO_RESULTS) {
            info!(%day, "No BOA content for this day");
            return Ok(Vec::new());
        }

        match serde_json::from_str::<Value>(&body)? {
            Value::Array(records) => Ok(records),
            other => Err(EtlError::scrape(
                &self.base_url,
                format!("expected a JSON array, got {}", kind(&other)),
            )),
        }
    }

    fn parse_record(&self, record: &Value) -> Result<MetadataDocument, EtlError> {
        let identificador = field(record, "DOCN");
        let reference = if identificador.is_empty() {
            "BOA record".to_string()
        } else {
            format!("BOA {identificador}")
        };
        let required = |name: &str, value: String| {
            if value.is_empty() {
                Err(EtlError::scrape(&reference, format!("missing {name}")))
            } else {
                Ok(value)
            }
        };

        let content = required("Texto", field(record, "Texto"))?;
        let numero_boletin = required("Numeroboletin", field(record, "Numeroboletin"))?;
        let identificador = required("DOCN", identificador)?;
        let departamento = required("Emisor", field(record, "Emisor"))?;
        let url_pdf = required("UrlPdf", unwrap_link(&field(record, "UrlPdf")))?;
        let seccion = required("Seccion", field(record, "Seccion"))?;
        let titulo = required("Titulo", field(record, "Titulo"))?;
        let published = [PUBLICATION_FIELD, "Fechapublicacion"]
            .iter()
            .map(|name| field(record, name))
            .find(|value| !value.is_empty())
            .and_then(|value| parse_date(&value))
            .ok_or_else(|| EtlError::scrape(&reference, format!("missing {PUBLICATION_FIELD}")))?;

        let details = SourceDetails::Boa {
            numero_boletin,
            seccion,
            subseccion: field(record, "Subseccion"),
            rango: field(record, "Rango"),
            codigo_materia: field(record, "CodigoMateria"),
        };

        MetadataDocument::builder(Source::Boa, identificador, details)
            .titulo(titulo)
            .departamento(departamento)
            .fecha_publicacion(Some(published))
            .fecha_disposicion(parse_date(&field(record, "Fechadisposicion")))
            .url_pdf(url_pdf)
            .url_boletin(unwrap_link(&field(record, "UrlBCOM")))
            .build(&html_to_text(&content))
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl Scraper for BoaScraper {
    fn source(&self) -> Source {
        Source::Boa
    }

    #[instrument(level = "info", skip(self))]
    async fn download_day(&self, day: NaiveDate) -> Result<Vec<MetadataDocument>, EtlError> {
        let pending = discover(Source::Boa, day, async {
            let records = self.search_day(day).await?;
            let publication = day.format("%Y%m%d").to_string();
            records
                .into_iter()
                .map(|mut record| -> Result<Pending, EtlError> {
                    if field(&record, PUBLICATION_FIELD).is_empty() {
                        if let Value::Object(map) = &mut record {
                            map.insert(PUBLICATION_FIELD.to_string(), Value::String(publication.clone()));
                        }
                    }
                    Ok(Pending::new(
                        DocumentRef::Fragment(serde_json::to_string(&record)?),
                        DispositionSummary {
                            fecha_publicacion: Some(day),
                            ..Default::default()
                        },
                    ))
                })
                .collect()
        })
        .await?;
        collect_documents(self, day, pending).await
    }

    #[instrument(level = "info", skip_all, fields(reference = %reference))]
    async fn download_document(&self, reference: &DocumentRef) -> Result<MetadataDocument, EtlError> {
        let record: Value = match reference {
            DocumentRef::Fragment(json) => serde_json::from_str(json)?,
            DocumentRef::Url(url) => {
                let body = self.http.get_text(url, &[]).await?;
                match serde_json::from_str::<Value>(&body)? {
                    Value::Array(mut records) if !records.is_empty() => records.swap_remove(0),
                    Value::Object(map) => Value::Object(map),
                    _ => return Err(EtlError::scrape(url, "no BOA record in response")),
                }
            }
        };
        let document = self.parse_record(&record)?;
        info!(identificador = %document.identificador, "Scraped BOA document");
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(docn: &str, emisor: &str) -> Value {
        json!({
            "Texto": "<p>ORDEN de 2 de enero de 2024.</p><p>Se convoca&nbsp;la ayuda.</p>",
            "Numeroboletin": "3",
            "DOCN": docn,
            "Emisor": emisor,
            "UrlPdf": "`https://www.boa.aragon.es/cgi-bin/EBOA/BRSCGI?CMD=VEROBJ&MLKOB=1311´`PDF",
            "Seccion": "III. Otras Disposiciones y Acuerdos",
            "Titulo": "ORDEN AGM/1/2024 por la que se convocan ayudas.",
            "UrlBCOM": "`https://www.boa.aragon.es/cgi-bin/EBOA/BRSCGI?CMD=VERLST&BOLE=3´`Boletín",
            "Subseccion": "",
            "CodigoMateria": "17",
            "Rango": "ORDEN",
            "Fechadisposicion": "20240102"
        })
    }

    fn scraper(server: &MockServer) -> BoaScraper {
        let http = HttpClient::builder()
            .retry_policy(RetryPolicy::fixed(1, Duration::from_millis(1)))
            .build()
            .unwrap();
        BoaScraper::with_base_url(http, &format!("{}/cgi-bin/EBOA/BRSCGI", server.uri()))
    }

    #[test]
    fn test_unwrap_link() {
        assert_eq!(
            unwrap_link("`https://www.boa.aragon.es/x.pdf´`PDF"),
            "https://www.boa.aragon.es/x.pdf"
        );
        assert_eq!(unwrap_link(""), "");
    }

    #[tokio::test]
    async fn test_sentinel_day_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/EBOA/BRSCGI"))
            .and(query_param("PUBL-C", "20240106"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body><span class="titulo">No se han recuperado documentos</span></body></html>"#,
            ))
            .mount(&server)
            .await;

        let day = NaiveDate::from_ymd_opt(2024, 1, 6).unwrap();
        assert!(scraper(&server).download_day(day).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_day_keeps_valid_records() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/EBOA/BRSCGI"))
            .and(query_param("CMD", "VERLST"))
            .and(query_param("OUTPUTMODE", "JSON"))
            .and(query_param("PUBL-C", "20240104"))
            .and(query_param("SECC-C", "BOA%2Bo%2BDisposiciones%2Bo%2BJusticia%2Bo%2BAnuncios"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([record("1311", "DEPARTAMENTO DE AGRICULTURA"), record("1312", "")])),
            )
            .mount(&server)
            .await;

        let day = NaiveDate::from_ymd_opt(2024, 1, 4).unwrap();
        let docs = scraper(&server).download_day(day).await.unwrap();
        assert_eq!(docs.len(), 1);

        let doc = &docs[0];
        assert_eq!(doc.identificador, "1311");
        assert_eq!(doc.departamento, "DEPARTAMENTO DE AGRICULTURA");
        assert_eq!(
            doc.url_pdf.as_deref(),
            Some("https://www.boa.aragon.es/cgi-bin/EBOA/BRSCGI?CMD=VEROBJ&MLKOB=1311")
        );
        assert_eq!(
            doc.scratch.read().unwrap(),
            "ORDEN de 2 de enero de 2024.Se convoca\u{a0}la ayuda."
        );

        let meta = doc.metadata().unwrap();
        assert_eq!(meta["fecha_publicacion"], "2024-01-04");
        assert_eq!(meta["fecha_disposicion"], "2024-01-02");
        assert_eq!(meta["numero_boletin"], "3");
        assert_eq!(meta["codigo_materia"], "17");
        assert_eq!(meta["dia"], "04");
    }

    #[tokio::test]
    async fn test_document_by_url_reads_publication_date() {
        let server = MockServer::start().await;
        let mut dated = record("1314", "DEPARTAMENTO DE HACIENDA");
        dated["FechaPublicacion"] = json!("20240105");
        Mock::given(method("GET"))
            .and(path("/boa/1314"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([dated])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/boa/1315"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([record("1315", "DEPARTAMENTO DE HACIENDA")])))
            .mount(&server)
            .await;

        let doc = scraper(&server)
            .download_document(&DocumentRef::Url(format!("{}/boa/1314", server.uri())))
            .await
            .unwrap();
        assert_eq!(doc.fecha_publicacion, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        assert_eq!(doc.metadata().unwrap()["anio"], "2024");

        let err = scraper(&server)
            .download_document(&DocumentRef::Url(format!("{}/boa/1315", server.uri())))
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::Scrape { ref reason, .. } if reason == "missing FechaPublicacion"));
    }

    #[tokio::test]
    async fn test_missing_required_field() {
        let server = MockServer::start().await;
        let mut broken = record("1313", "EMISOR");
        broken["Titulo"] = json!("");
        let err = scraper(&server)
            .download_document(&DocumentRef::Fragment(broken.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::Scrape { ref reason, .. } if reason == "missing Titulo"));
    }
}
