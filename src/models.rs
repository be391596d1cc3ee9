//! Data models for scraped dispositions and the chunks derived from them.
//!
//! - [`MetadataDocument`]: one disposition, shared base fields plus a
//!   [`SourceDetails`] variant with the publisher-specific fields
//! - [`ScratchFile`]: the owned temp file holding the extracted body text
//! - [`Chunk`]: a window of a document's text carrying the full metadata
//!
//! Dates are kept as [`NaiveDate`] and rendered as `%Y-%m-%d` only when the
//! metadata map is produced. `anio`/`mes`/`dia` are derived from
//! `fecha_publicacion` at that moment, so they always agree with it. A
//! document cannot be built without a publication date.

use crate::error::EtlError;
use crate::scrapers::Source;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::Path;
use tempfile::TempPath;

/// Extracted plain-text body of one document, stored in a temp file.
///
/// The file is removed when the value is dropped; [`ScratchFile::dispose`]
/// removes it explicitly and reports failures.
#[derive(Debug)]
pub struct ScratchFile {
    path: TempPath,
}

impl ScratchFile {
    pub fn create(text: &str) -> Result<Self, EtlError> {
        let mut file = tempfile::Builder::new()
            .prefix("boletin-")
            .suffix(".txt")
            .tempfile()?;
        file.write_all(text.as_bytes())?;
        file.flush()?;
        Ok(Self {
            path: file.into_temp_path(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<String, EtlError> {
        Ok(std::fs::read_to_string(&self.path)?)
    }

    pub fn dispose(self) -> Result<(), EtlError> {
        self.path.close()?;
        Ok(())
    }
}

/// Cross reference between two BOE dispositions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Referencia {
    pub id: String,
    pub palabra: String,
    pub texto: String,
}

/// Publisher-specific fields.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SourceDetails {
    Boe {
        numero_oficial: String,
        rango: String,
        origen_legislativo: String,
        observaciones: String,
        ambito_geografico: String,
        modalidad: String,
        tipo: String,
        materias: Vec<String>,
        alertas: Vec<String>,
        notas: Vec<String>,
        ref_posteriores: Vec<Referencia>,
        ref_anteriores: Vec<Referencia>,
    },
    Bocm {
        numero_oficial: String,
        seccion: String,
        seccion_full: String,
        subseccion: String,
        apartado: String,
        rango: String,
        origen_legislativo: String,
        anunciante: String,
        paginas: String,
    },
    Boa {
        numero_boletin: String,
        seccion: String,
        subseccion: String,
        rango: String,
        codigo_materia: String,
    },
    Bopv {
        tipologia: String,
    },
    Boja {
        tipologia: String,
    },
    Bopz {
        numero_oficial: String,
        materia: Vec<String>,
    },
    Bopgr {
        numero_oficial: String,
        legal_deposit: String,
        issn: String,
        administracion: String,
        direccion: String,
        telefono: String,
        fax: String,
        materia: String,
    },
    Dgt {
        numero_consulta: String,
        organo: String,
        normativa: String,
    },
}

/// Day-level attributes known only to the listing page, back-filled onto a
/// document by [`Scraper::download_listed`](crate::scrapers::Scraper::download_listed).
#[derive(Debug, Clone, Default)]
pub struct DispositionSummary {
    pub titulo: Option<String>,
    pub url_html: Option<String>,
    pub url_boletin: Option<String>,
    pub fecha_publicacion: Option<NaiveDate>,
    pub fecha_disposicion: Option<NaiveDate>,
}

/// One scraped disposition.
#[derive(Debug)]
pub struct MetadataDocument {
    pub scratch: ScratchFile,
    pub source: Source,
    pub source_type: String,
    pub identificador: String,
    pub titulo: String,
    pub departamento: String,
    pub fecha_publicacion: NaiveDate,
    pub fecha_disposicion: Option<NaiveDate>,
    pub url_pdf: Option<String>,
    pub url_html: Option<String>,
    pub url_boletin: Option<String>,
    datetime_insert: DateTime<Utc>,
    pub details: SourceDetails,
}

#[derive(Serialize)]
struct MetadataView<'a> {
    source_name: &'a str,
    source_type: &'a str,
    identificador: &'a str,
    titulo: &'a str,
    departamento: &'a str,
    fecha_publicacion: String,
    fecha_disposicion: String,
    anio: String,
    mes: String,
    dia: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    url_pdf: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url_html: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url_boletin: Option<&'a str>,
    datetime_insert: String,
    #[serde(flatten)]
    details: &'a SourceDetails,
}

fn iso(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

impl MetadataDocument {
    pub fn builder(source: Source, identificador: impl Into<String>, details: SourceDetails) -> DocumentBuilder {
        DocumentBuilder {
            source,
            source_type: "Boletin".to_string(),
            identificador: identificador.into().trim().to_string(),
            titulo: None,
            departamento: String::new(),
            fecha_publicacion: None,
            fecha_disposicion: None,
            url_pdf: None,
            url_html: None,
            url_boletin: None,
            details,
        }
    }

    pub fn datetime_insert(&self) -> DateTime<Utc> {
        self.datetime_insert
    }

    /// Back-fill listing-level attributes. Only the provided values overwrite.
    pub fn apply_summary(&mut self, summary: DispositionSummary) {
        if let Some(titulo) = summary.titulo.filter(|t| !t.trim().is_empty()) {
            self.titulo = titulo.trim().to_string();
        }
        if summary.url_html.is_some() {
            self.url_html = summary.url_html;
        }
        if summary.url_boletin.is_some() {
            self.url_boletin = summary.url_boletin;
        }
        if let Some(date) = summary.fecha_publicacion {
            self.fecha_publicacion = date;
        }
        if summary.fecha_disposicion.is_some() {
            self.fecha_disposicion = summary.fecha_disposicion;
        }
    }

    /// Flat metadata map attached to every chunk of this document.
    pub fn metadata(&self) -> Result<Map<String, Value>, EtlError> {
        let published = self.fecha_publicacion;
        let view = MetadataView {
            source_name: self.source.name(),
            source_type: &self.source_type,
            identificador: &self.identificador,
            titulo: &self.titulo,
            departamento: &self.departamento,
            fecha_publicacion: iso(Some(published)),
            fecha_disposicion: iso(self.fecha_disposicion),
            anio: format!("{:04}", published.year()),
            mes: format!("{:02}", published.month()),
            dia: format!("{:02}", published.day()),
            url_pdf: self.url_pdf.as_deref(),
            url_html: self.url_html.as_deref(),
            url_boletin: self.url_boletin.as_deref(),
            datetime_insert: self.datetime_insert.to_rfc3339(),
            details: &self.details,
        };
        match serde_json::to_value(view)? {
            Value::Object(map) => Ok(map),
            other => Err(EtlError::scrape(
                &self.identificador,
                format!("metadata serialized to {other}"),
            )),
        }
    }
}

/// Collects the base fields of a [`MetadataDocument`] before its body is written.
#[derive(Debug)]
pub struct DocumentBuilder {
    source: Source,
    source_type: String,
    identificador: String,
    titulo: Option<String>,
    departamento: String,
    fecha_publicacion: Option<NaiveDate>,
    fecha_disposicion: Option<NaiveDate>,
    url_pdf: Option<String>,
    url_html: Option<String>,
    url_boletin: Option<String>,
    details: SourceDetails,
}

fn non_empty(value: impl Into<String>) -> Option<String> {
    let value = value.into();
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl DocumentBuilder {
    pub fn source_type(mut self, source_type: impl Into<String>) -> Self {
        if let Some(t) = non_empty(source_type) {
            self.source_type = t;
        }
        self
    }

    pub fn titulo(mut self, titulo: impl Into<String>) -> Self {
        self.titulo = non_empty(titulo);
        self
    }

    pub fn departamento(mut self, departamento: impl Into<String>) -> Self {
        self.departamento = departamento.into().trim().to_string();
        self
    }

    pub fn fecha_publicacion(mut self, date: Option<NaiveDate>) -> Self {
        self.fecha_publicacion = date;
        self
    }

    pub fn fecha_disposicion(mut self, date: Option<NaiveDate>) -> Self {
        self.fecha_disposicion = date;
        self
    }

    pub fn url_pdf(mut self, url: impl Into<String>) -> Self {
        self.url_pdf = non_empty(url);
        self
    }

    pub fn url_html(mut self, url: impl Into<String>) -> Self {
        self.url_html = non_empty(url);
        self
    }

    pub fn url_boletin(mut self, url: impl Into<String>) -> Self {
        self.url_boletin = non_empty(url);
        self
    }

    /// Write `text` to a scratch file and produce the document.
    ///
    /// # Errors
    ///
    /// [`EtlError::Scrape`] when the identifier is empty, no source link is
    /// known or the publication date is unset; [`EtlError::Io`] when the
    /// scratch file cannot be written.
    pub fn build(self, text: &str) -> Result<MetadataDocument, EtlError> {
        if self.identificador.is_empty() {
            return Err(EtlError::scrape(
                self.url_html.or(self.url_pdf).unwrap_or_default(),
                "empty identificador",
            ));
        }
        if self.url_pdf.is_none() && self.url_html.is_none() && self.url_boletin.is_none() {
            return Err(EtlError::scrape(&self.identificador, "no source link"));
        }
        let Some(fecha_publicacion) = self.fecha_publicacion else {
            return Err(EtlError::scrape(&self.identificador, "no fecha_publicacion"));
        };

        let titulo = self
            .titulo
            .unwrap_or_else(|| format!("{} {}", self.source.name(), self.identificador));

        Ok(MetadataDocument {
            scratch: ScratchFile::create(text)?,
            source: self.source,
            source_type: self.source_type,
            identificador: self.identificador,
            titulo,
            departamento: self.departamento,
            fecha_publicacion,
            fecha_disposicion: self.fecha_disposicion,
            url_pdf: self.url_pdf,
            url_html: self.url_html,
            url_boletin: self.url_boletin,
            datetime_insert: Utc::now(),
            details: self.details,
        })
    }
}

/// A bounded window of a document's text with the parent's metadata.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub text: String,
    pub metadata: Map<String, Value>,
    pub source: Source,
    pub identificador: String,
    pub index: usize,
}
