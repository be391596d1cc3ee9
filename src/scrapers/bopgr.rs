//! BOPGR (Boletín Oficial de la Provincia de Granada) scraper.
//!
//! The whole bulletin of a day is a single PDF. An empty `200` body means
//! nothing was published. The extracted text is split into edicts by
//! [`LineRules`]: each `NÚMERO <n>` header opens a record, page furniture is
//! skipped, and the masthead lines feed the bulletin metadata.
//!
//! Every record is handed to [`Scraper::download_document`] as a JSON
//! [`DocumentRef::Fragment`] of [`BopgrEdict`].

use super::{collect_documents, discover, DocumentRef, Pending, Scraper, Source};
use crate::config::BopgrConfig;
use crate::error::EtlError;
use crate::http::HttpClient;
use crate::models::{DispositionSummary, MetadataDocument, SourceDetails};
use crate::pdf;
use crate::rules::lines::{Cleanup, LineRule, LineRules};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

const BASE_URL: &str = "https://bop2.dipgra.es";
const DOWNLOAD_PATH: &str = "opencms/opencms/portal/DescargaPDFBoletin";

fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid BOPGR pattern {pattern}: {e}"))
}

static BULLETIN_RULES: Lazy<LineRules> = Lazy::new(|| {
    LineRules::new(regex(r"(?m)^NÚMERO (\d+) $"), vec![
        LineRule::Skip(regex(r" *Página +\d+ *")),
        LineRule::Skip(regex(r"^ *n\n$")),
        LineRule::Skip(regex(r" *Granada,.* \d{4}\n")),
        LineRule::Extract {
            pattern: regex(r"Año (\d+)"),
            fields: vec!["anio"],
            include_line: false,
        },
        LineRule::Extract {
            pattern: regex(r".*DL GR (.+?)\..*I\.S\.S\.N\.: (.+?)\..*Edición.*"),
            fields: vec!["legal_deposit", "issn"],
            include_line: false,
        },
        LineRule::Extract {
            pattern: regex(r".*Administración: (.+?)\..*Domicilio: (.+?)\..*Tel\.: (\d{3} \d{6}) / Fax: (\d{3} \d{6})"),
            fields: vec!["administracion", "direccion", "telefono", "fax"],
            include_line: false,
        },
        LineRule::Extract {
            pattern: regex(r"^(\d+)\n$"),
            fields: vec!["numero_oficial"],
            include_line: false,
        },
        LineRule::Cleanup {
            pattern: regex(r"-\n$"),
            action: Cleanup::RemoveLast("-\n"),
        },
        LineRule::Cleanup {
            pattern: regex(r".*\w+[^\S\r\n]*\n"),
            action: Cleanup::TrimToSpace,
        },
    ])
});

/// One edict cut out of a bulletin, as carried between discovery and extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BopgrEdict {
    pub url_pdf: String,
    pub fecha_publicacion: NaiveDate,
    pub marker: Option<String>,
    pub body: String,
    pub metadata: BTreeMap<String, String>,
}

impl BopgrEdict {
    fn meta(&self, key: &str) -> String {
        self.metadata.get(key).cloned().unwrap_or_default()
    }

    /// `<bulletin number>-<edict number>`, the date standing in for a missing bulletin number.
    fn identificador(&self) -> String {
        let bulletin = self
            .metadata
            .get("numero_oficial")
            .cloned()
            .unwrap_or_else(|| self.fecha_publicacion.format("%Y%m%d").to_string());
        match &self.marker {
            Some(marker) => format!("{bulletin}-{marker}"),
            None => bulletin,
        }
    }
}

/// Split the text of a bulletin into edicts.
pub fn split_bulletin(text: &str, url_pdf: &str, day: NaiveDate, flush_on_eof: bool) -> Vec<BopgrEdict> {
    let processed = BULLETIN_RULES.process(text, flush_on_eof);
    if let Some(tail) = &processed.dropped_tail {
        warn!(%day, chars = tail.chars().count(), "Trailing BOPGR edict dropped at end of bulletin");
    }
    processed
        .records
        .into_iter()
        .map(|record| BopgrEdict {
            url_pdf: url_pdf.to_string(),
            fecha_publicacion: day,
            marker: record.marker,
            body: record.body,
            metadata: record.metadata,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct BopgrScraper {
    http: HttpClient,
    base_url: String,
    flush_on_eof: bool,
}

impl BopgrScraper {
    pub fn new(http: HttpClient, config: &BopgrConfig) -> Self {
        Self::with_base_url(http, config, BASE_URL)
    }

    pub fn with_base_url(http: HttpClient, config: &BopgrConfig, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            flush_on_eof: config.flush_on_eof,
        }
    }

    fn bulletin_url(&self, day: NaiveDate) -> String {
        format!("{}/{}?fecha={}", self.base_url, DOWNLOAD_PATH, day.format("%d/%m/%Y"))
    }

    #[instrument(level = "info", skip(self))]
    async fn edicts(&self, day: NaiveDate) -> Result<Vec<BopgrEdict>, EtlError> {
        let url = self.bulletin_url(day);
        let bytes = self.http.get_bytes(&url).await?;
        if bytes.is_empty() {
            info!(%day, "No BOPGR bulletin published");
            return Ok(Vec::new());
        }
        let text = pdf::extract_text(&url, bytes).await?;
        Ok(split_bulletin(&text, &url, day, self.flush_on_eof))
    }
}

impl Scraper for BopgrScraper {
    fn source(&self) -> Source {
        Source::Bopgr
    }

    #[instrument(level = "info", skip(self))]
    async fn download_day(&self, day: NaiveDate) -> Result<Vec<MetadataDocument>, EtlError> {
        let pending = discover(Source::Bopgr, day, async {
            self.edicts(day)
                .await?
                .iter()
                .map(|edict| -> Result<Pending, EtlError> {
                    Ok(Pending::new(
                        DocumentRef::Fragment(serde_json::to_string(edict)?),
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
        let DocumentRef::Fragment(json) = reference else {
            return Err(EtlError::scrape(
                reference.to_string(),
                "BOPGR edicts only exist inside a bulletin PDF",
            ));
        };
        let edict: BopgrEdict = serde_json::from_str(json)?;
        if edict.body.trim().is_empty() {
            return Err(EtlError::scrape(edict.identificador(), "empty edict"));
        }

        let details = SourceDetails::Bopgr {
            numero_oficial: edict.meta("numero_oficial"),
            legal_deposit: edict.meta("legal_deposit"),
            issn: edict.meta("issn"),
            administracion: edict.meta("administracion"),
            direccion: edict.meta("direccion"),
            telefono: edict.meta("telefono"),
            fax: edict.meta("fax"),
            materia: edict.body.clone(),
        };
        let document = MetadataDocument::builder(Source::Bopgr, edict.identificador(), details)
            .fecha_publicacion(Some(edict.fecha_publicacion))
            .url_pdf(edict.url_pdf.as_str())
            .build(&edict.body)?;
        info!(identificador = %document.identificador, "Scraped BOPGR edict");
        Ok(document)
    }
}
