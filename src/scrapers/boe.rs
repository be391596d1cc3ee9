//! BOE (Boletín Oficial del Estado) scraper.
//!
//! The day index is an XML summary at `xml.php?id=BOE-S-YYYYMMDD`. Only
//! section `1` (general provisions) and `T` (Constitutional Court) are indexed.
//! Each disposition is another XML document with a fixed layout:
//!
//! ```text
//! documento
//! ├── metadatos   identificador, titulo, departamento, rango, fechas, url_pdf, url_eli
//! ├── analisis    materias, alertas, notas, referencias (anteriores / posteriores)
//! └── texto       body as HTML paragraphs
//! ```
//!
//! When `url_eli` is present the consolidated text of the ELI page replaces
//! `texto`.

use super::{collect_documents, discover, selector, DocumentRef, Pending, Scraper, Source};
use crate::error::EtlError;
use crate::http::HttpClient;
use crate::models::{DispositionSummary, MetadataDocument, Referencia, SourceDetails};
use crate::rules::text::element_text;
use crate::utils::{parse_date, resolve_url};
use chrono::NaiveDate;
use quick_xml::events::Event;
use quick_xml::Reader;
use scraper::{ElementRef, Html};
use tracing::{debug, info, instrument};

const BASE_URL: &str = "https://www.boe.es";
const INDEXED_SECTIONS: [&str; 2] = ["1", "T"];

#[derive(Debug, Clone)]
pub struct BoeScraper {
    http: HttpClient,
    base_url: String,
}

impl BoeScraper {
    pub fn new(http: HttpClient) -> Self {
        Self::with_base_url(http, BASE_URL)
    }

    pub fn with_base_url(http: HttpClient, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn xml_url(&self, id: &str) -> String {
        format!("{}/diario_boe/xml.php?id={id}", self.base_url)
    }

    /// Document ids listed under the indexed sections of the day summary.
    #[instrument(level = "info", skip(self))]
    async fn list_day(&self, day_url: &str) -> Result<Vec<String>, EtlError> {
        let xml = self.http.get_text(day_url, &[]).await?;
        let root = XmlNode::parse(&xml).map_err(|reason| EtlError::scrape(day_url, reason))?;
        if root.name == "error" {
            info!(%day_url, "No BOE summary for this day");
            return Ok(Vec::new());
        }

        let ids: Vec<String> = root
            .descendants("seccion")
            .into_iter()
            .filter(|s| s.attr("num").is_some_and(|n| INDEXED_SECTIONS.contains(&n)))
            .flat_map(|s| s.descendants("urlXml"))
            .filter_map(|u| u.text().rsplit("?id=").next().map(|id| id.trim().to_string()))
            .filter(|id| !id.is_empty())
            .collect();
        debug!(count = ids.len(), "Listed BOE documents");
        Ok(ids)
    }

    /// Consolidated text of an ELI page without its bookmarks block.
    async fn download_eli_text(&self, url: &str) -> Result<String, EtlError> {
        info!(%url, "Fetching consolidated ELI text");
        let html = self.http.get_text(url, &[]).await?;
        let document = Html::parse_document(&html);
        let container = document
            .select(&selector("div#textoxslt"))
            .next()
            .ok_or_else(|| EtlError::scrape(url, "missing div#textoxslt"))?;

        let text: String = container
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|el| {
                !(el.value().name() == "div" && el.value().classes().any(|c| c == "marcadores"))
            })
            .map(element_text)
            .collect::<Vec<_>>()
            .join("\n");
        Ok(text)
    }

    async fn parse_document(&self, url: &str, xml: &str) -> Result<MetadataDocument, EtlError> {
        let root = XmlNode::parse(xml).map_err(|reason| EtlError::scrape(url, reason))?;
        if root.name != "documento" {
            return Err(EtlError::scrape(url, format!("unexpected root <{}>", root.name)));
        }
        let meta = root
            .child("metadatos")
            .ok_or_else(|| EtlError::scrape(url, "missing documento > metadatos"))?;
        let analisis = root.child("analisis");

        let required = |name: &str| -> Result<String, EtlError> {
            meta.child_text(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| EtlError::scrape(url, format!("missing metadatos > {name}")))
        };
        let identificador = required("identificador")?;
        let titulo = required("titulo")?;
        let departamento = required("departamento")?;
        let url_pdf = required("url_pdf")?;
        let fecha_publicacion = parse_date(&required("fecha_publicacion")?)
            .ok_or_else(|| EtlError::scrape(url, "unparseable fecha_publicacion"))?;
        let optional = |name: &str| meta.child_text(name).unwrap_or_default();
        let analysed = |name: &str| analisis.and_then(|a| a.child_text(name)).unwrap_or_default();
        let listed = |group: &str, item: &str| -> Vec<String> {
            analisis
                .and_then(|a| a.child(group))
                .map(|g| g.children_named(item).map(|n| n.text().trim().to_string()).collect())
                .unwrap_or_default()
        };
        let references = |group: &str, item: &str| -> Vec<Referencia> {
            analisis
                .and_then(|a| a.child("referencias"))
                .and_then(|r| r.child(group))
                .map(|g| {
                    g.children_named(item)
                        .map(|r| Referencia {
                            id: r.attr("referencia").unwrap_or_default().to_string(),
                            palabra: r.child_text("palabra").unwrap_or_default(),
                            texto: r.child_text("texto").unwrap_or_default(),
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        let details = SourceDetails::Boe {
            numero_oficial: optional("numero_oficial"),
            rango: optional("rango"),
            origen_legislativo: optional("origen_legislativo"),
            observaciones: analysed("observaciones"),
            ambito_geografico: analysed("ambito_geografico"),
            modalidad: analysed("modalidad"),
            tipo: analysed("tipo"),
            materias: listed("materias", "materia"),
            alertas: listed("alertas", "alerta"),
            notas: listed("notas", "nota"),
            ref_posteriores: references("posteriores", "posterior"),
            ref_anteriores: references("anteriores", "anterior"),
        };

        let text = match meta.child_text("url_eli").filter(|u| !u.is_empty()) {
            Some(eli) => self.download_eli_text(&eli).await?,
            None => root
                .child("texto")
                .map(XmlNode::block_text)
                .ok_or_else(|| EtlError::scrape(url, "missing documento > texto"))?,
        };

        MetadataDocument::builder(Source::Boe, identificador.clone(), details)
            .titulo(titulo)
            .departamento(departamento)
            .fecha_publicacion(Some(fecha_publicacion))
            .fecha_disposicion(parse_date(&optional("fecha_disposicion")))
            .url_pdf(resolve_url(&self.base_url, &url_pdf))
            .url_html(format!("{}/diario_boe/txt.php?id={identificador}", self.base_url))
            .build(&text)
    }
}

impl Scraper for BoeScraper {
    fn source(&self) -> Source {
        Source::Boe
    }

    #[instrument(level = "info", skip(self))]
    async fn download_day(&self, day: NaiveDate) -> Result<Vec<MetadataDocument>, EtlError> {
        let day_url = self.xml_url(&format!("BOE-S-{}", day.format("%Y%m%d")));
        let pending = discover(Source::Boe, day, async {
            let ids = self.list_day(&day_url).await?;
            Ok(ids
                .into_iter()
                .map(|id| {
                    Pending::new(
                        DocumentRef::Url(self.xml_url(&id)),
                        DispositionSummary {
                            url_boletin: Some(day_url.clone()),
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
        let (url, xml) = match reference {
            DocumentRef::Url(url) => (url.as_str(), self.http.get_text(url, &[]).await?),
            DocumentRef::Fragment(xml) => ("fragment", xml.clone()),
        };
        let document = self.parse_document(url, &xml).await?;
        info!(identificador = %document.identificador, "Scraped BOE document");
        Ok(document)
    }
}

/// Minimal element tree over `quick-xml` events.
#[derive(Debug, Default, Clone)]
struct XmlNode {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<XmlChild>,
}

#[derive(Debug, Clone)]
enum XmlChild {
    Element(XmlNode),
    Text(String),
}

impl XmlNode {
    /// Parse `xml` and return its root element.
    fn parse(xml: &str) -> Result<XmlNode, String> {
        let mut reader = Reader::from_str(xml);
        let mut stack: Vec<XmlNode> = vec![XmlNode::default()];

        loop {
            let event = reader
                .read_event()
                .map_err(|e| format!("XML error at {}: {e}", reader.buffer_position()))?;
            match event {
                Event::Start(start) => stack.push(XmlNode::open(&start)),
                Event::Empty(start) => {
                    let node = XmlNode::open(&start);
                    push_child(&mut stack, XmlChild::Element(node));
                }
                Event::End(_) => {
                    if stack.len() < 2 {
                        return Err("unbalanced closing tag".to_string());
                    }
                    if let Some(node) = stack.pop() {
                        push_child(&mut stack, XmlChild::Element(node));
                    }
                }
                Event::Text(text) => {
                    push_text(&mut stack, &String::from_utf8_lossy(&text));
                }
                Event::CData(data) => {
                    push_text(&mut stack, &String::from_utf8_lossy(&data.into_inner()));
                }
                Event::GeneralRef(entity) => {
                    let name = String::from_utf8_lossy(&entity).into_owned();
                    let resolved = match entity.resolve_char_ref() {
                        Ok(Some(c)) => c.to_string(),
                        _ => quick_xml::escape::resolve_predefined_entity(&name)
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("&{name};")),
                    };
                    push_text(&mut stack, &resolved);
                }
                Event::Eof => break,
                _ => {}
            }
        }

        let document = stack.pop().unwrap_or_default();
        document
            .children
            .into_iter()
            .find_map(|c| match c {
                XmlChild::Element(node) => Some(node),
                XmlChild::Text(_) => None,
            })
            .ok_or_else(|| "document has no root element".to_string())
    }

    fn open(start: &quick_xml::events::BytesStart<'_>) -> XmlNode {
        let attrs = start
            .attributes()
            .flatten()
            .map(|a| {
                let raw = String::from_utf8_lossy(&a.value).into_owned();
                let value = quick_xml::escape::unescape(&raw)
                    .map(|v| v.into_owned())
                    .unwrap_or(raw);
                (String::from_utf8_lossy(a.key.as_ref()).into_owned(), value)
            })
            .collect();
        XmlNode {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            attrs,
            children: Vec::new(),
        }
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn elements(&self) -> impl Iterator<Item = &XmlNode> {
        self.children.iter().filter_map(|c| match c {
            XmlChild::Element(node) => Some(node),
            XmlChild::Text(_) => None,
        })
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.elements().filter(move |n| n.name == name)
    }

    fn child(&self, name: &str) -> Option<&XmlNode> {
        self.elements().find(|n| n.name == name)
    }

    fn child_text(&self, name: &str) -> Option<String> {
        self.child(name).map(|n| n.text().trim().to_string())
    }

    /// Every element called `name` below this node, in document order.
    fn descendants(&self, name: &str) -> Vec<&XmlNode> {
        let mut found = Vec::new();
        for node in self.elements() {
            if node.name == name {
                found.push(node);
            }
            found.extend(node.descendants(name));
        }
        found
    }

    /// Concatenated text of the whole subtree.
    fn text(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            match child {
                XmlChild::Text(text) => out.push_str(text),
                XmlChild::Element(node) => out.push_str(&node.text()),
            }
        }
        out
    }

    /// Text of each direct child element on its own line.
    fn block_text(&self) -> String {
        self.elements()
            .map(|n| n.text().trim().to_string())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn push_child(stack: &mut [XmlNode], child: XmlChild) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(child);
    }
}

fn push_text(stack: &mut [XmlNode], text: &str) {
    if let Some(parent) = stack.last_mut() {
        match parent.children.last_mut() {
            Some(XmlChild::Text(existing)) => existing.push_str(text),
            _ => parent.children.push(XmlChild::Text(text.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SUMARIO: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<sumario>
  <diario nbo="3">
    <seccion num="1" nombre="I. Disposiciones generales">
      <departamento nombre="JEFATURA DEL ESTADO">
        <epigrafe nombre="Leyes">
          <item id="BOE-A-2024-100">
            <urlXml>/diario_boe/xml.php?id=BOE-A-2024-100</urlXml>
          </item>
          <item id="BOE-A-2024-101">
            <urlXml>/diario_boe/xml.php?id=BOE-A-2024-101</urlXml>
          </item>
        </epigrafe>
      </departamento>
    </seccion>
    <seccion num="2A" nombre="II. Autoridades y personal">
      <departamento nombre="MINISTERIO">
        <item id="BOE-A-2024-200"><urlXml>/diario_boe/xml.php?id=BOE-A-2024-200</urlXml></item>
      </departamento>
    </seccion>
    <seccion num="T" nombre="Tribunal Constitucional">
      <item id="BOE-A-2024-300"><urlXml>/diario_boe/xml.php?id=BOE-A-2024-300</urlXml></item>
    </seccion>
  </diario>
</sumario>"#;

    fn documento(id: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<documento fecha_actualizacion="20240103120000">
  <metadatos>
    <identificador>{id}</identificador>
    <titulo>Ley 1/2024, de 2 de enero, de pesca &amp; acuicultura.</titulo>
    <departamento codigo="7723">Jefatura del Estado</departamento>
    <rango codigo="1300">Ley</rango>
    <numero_oficial>1/2024</numero_oficial>
    <fecha_disposicion>20240102</fecha_disposicion>
    <fecha_publicacion>20240103</fecha_publicacion>
    <origen_legislativo codigo="1">Estatal</origen_legislativo>
    <url_pdf>/boe/dias/2024/01/03/pdfs/{id}.pdf</url_pdf>
    <url_eli/>
  </metadatos>
  <analisis>
    <observaciones/>
    <ambito_geografico codigo="1">Estatal</ambito_geografico>
    <materias>
      <materia codigo="5801">Pesca marítima</materia>
      <materia codigo="145">Acuicultura</materia>
    </materias>
    <alertas><alerta codigo="1">Medio ambiente</alerta></alertas>
    <notas/>
    <referencias>
      <anteriores>
        <anterior referencia="BOE-A-2001-6882" orden="2020">
          <palabra>DEROGA</palabra>
          <texto>la Ley 3/2001, de 26 de marzo</texto>
        </anterior>
      </anteriores>
      <posteriores/>
    </referencias>
  </analisis>
  <texto>
    <p class="parrafo">Artículo 1. Objeto.</p>
    <p class="parrafo">Esta ley regula la pesca.</p>
  </texto>
</documento>"#
        )
    }

    fn scraper(server: &MockServer) -> BoeScraper {
        let http = HttpClient::builder()
            .retry_policy(RetryPolicy::fixed(1, Duration::from_millis(1)))
            .build()
            .unwrap();
        BoeScraper::with_base_url(http, &server.uri())
    }

    #[test]
    fn test_xml_tree_resolves_entities() {
        let root = XmlNode::parse(&documento("BOE-A-2024-1")).unwrap();
        let meta = root.child("metadatos").unwrap();
        assert_eq!(
            meta.child_text("titulo").unwrap(),
            "Ley 1/2024, de 2 de enero, de pesca & acuicultura."
        );
        assert_eq!(meta.child_text("url_eli").unwrap(), "");
        assert_eq!(root.descendants("materia").len(), 2);
    }

    #[tokio::test]
    async fn test_document_fields() {
        let server = MockServer::start().await;
        let doc = scraper(&server)
            .download_document(&DocumentRef::Fragment(documento("BOE-A-2024-100")))
            .await
            .unwrap();

        assert_eq!(doc.identificador, "BOE-A-2024-100");
        assert_eq!(doc.departamento, "Jefatura del Estado");
        assert_eq!(
            doc.url_pdf.as_deref(),
            Some(format!("{}/boe/dias/2024/01/03/pdfs/BOE-A-2024-100.pdf", server.uri()).as_str())
        );
        assert!(doc.url_html.as_deref().unwrap().ends_with("/diario_boe/txt.php?id=BOE-A-2024-100"));
        assert_eq!(doc.scratch.read().unwrap(), "Artículo 1. Objeto.\nEsta ley regula la pesca.");

        let meta = doc.metadata().unwrap();
        assert_eq!(meta["fecha_publicacion"], "2024-01-03");
        assert_eq!(meta["fecha_disposicion"], "2024-01-02");
        assert_eq!(meta["anio"], "2024");
        assert_eq!(meta["mes"], "01");
        assert_eq!(meta["dia"], "03");
        assert_eq!(meta["rango"], "Ley");
        assert_eq!(meta["materias"][1], "Acuicultura");
        assert_eq!(meta["alertas"][0], "Medio ambiente");
        assert_eq!(meta["ref_anteriores"][0]["id"], "BOE-A-2001-6882");
        assert_eq!(meta["ref_anteriores"][0]["palabra"], "DEROGA");
        assert!(meta["ref_posteriores"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_eli_text_replaces_body() {
        let server = MockServer::start().await;
        let eli = format!("{}/eli/es/l/2024/01/02/1", server.uri());
        let xml = documento("BOE-A-2024-1").replace("<url_eli/>", &format!("<url_eli>{eli}</url_eli>"));
        Mock::given(method("GET"))
            .and(path("/eli/es/l/2024/01/02/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body><div id="textoxslt"><div class="marcadores">Ir a</div><p>Texto consolidado.</p><p>Segundo.</p></div></body></html>"#,
            ))
            .mount(&server)
            .await;

        let doc = scraper(&server)
            .download_document(&DocumentRef::Fragment(xml))
            .await
            .unwrap();
        assert_eq!(doc.scratch.read().unwrap(), "Texto consolidado.\nSegundo.");
    }

    #[tokio::test]
    async fn test_missing_required_field_is_scrape_error() {
        let server = MockServer::start().await;
        let xml = documento("BOE-A-2024-1").replace("<departamento codigo=\"7723\">Jefatura del Estado</departamento>", "");
        let err = scraper(&server)
            .download_document(&DocumentRef::Fragment(xml))
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::Scrape { ref reason, .. } if reason.contains("departamento")));
    }

    #[tokio::test]
    async fn test_day_skips_broken_document_and_filters_sections() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/diario_boe/xml.php"))
            .and(query_param("id", "BOE-S-20240103"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SUMARIO))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/diario_boe/xml.php"))
            .and(query_param("id", "BOE-A-2024-100"))
            .respond_with(ResponseTemplate::new(200).set_body_string(documento("BOE-A-2024-100")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/diario_boe/xml.php"))
            .and(query_param("id", "BOE-A-2024-101"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<documento><analisis/></documento>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/diario_boe/xml.php"))
            .and(query_param("id", "BOE-A-2024-300"))
            .respond_with(ResponseTemplate::new(200).set_body_string(documento("BOE-A-2024-300")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/diario_boe/xml.php"))
            .and(query_param("id", "BOE-A-2024-200"))
            .respond_with(ResponseTemplate::new(200).set_body_string(documento("BOE-A-2024-200")))
            .expect(0)
            .mount(&server)
            .await;

        let day = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        let docs = scraper(&server).download_day(day).await.unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.identificador.as_str()).collect();
        assert_eq!(ids, vec!["BOE-A-2024-100", "BOE-A-2024-300"]);
        assert!(docs[0].url_boletin.as_deref().unwrap().ends_with("id=BOE-S-20240103"));
    }

    #[tokio::test]
    async fn test_day_without_summary_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/diario_boe/xml.php"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<?xml version=\"1.0\"?><error><descripcion>No se encontraron datos</descripcion></error>",
            ))
            .mount(&server)
            .await;

        let day = NaiveDate::from_ymd_opt(2024, 1, 7).unwrap();
        assert!(scraper(&server).download_day(day).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_day_fetch_failure_yields_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let day = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap();
        assert!(scraper(&server).download_day(day).await.unwrap().is_empty());
    }
}
