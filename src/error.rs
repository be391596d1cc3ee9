//! Error taxonomy for the scraping and loading pipeline.
//!
//! Errors fall into three groups that decide how far they travel:
//!
//! | Group | Variants | Handling |
//! |-------|----------|----------|
//! | Document-local | `Network`, `Status`, `Scrape`, `Skipped`, `Pdf`, `Json` | logged and skipped by the per-document collector |
//! | Load | `Load`, `Store`, `Embedding` | retried by the ETL, then fatal for the run |
//! | Environmental | `Io`, `Config` | always propagated |

use reqwest::StatusCode;
use thiserror::Error;

/// HTTP statuses the fetch layer treats as transient.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

#[derive(Debug, Error)]
pub enum EtlError {
    /// Transport failure: connection refused, DNS, timeout, broken body.
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-success status.
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: StatusCode },

    /// A required field is missing or the page structure is not recognized.
    #[error("could not scrape {reference}: {reason}")]
    Scrape { reference: String, reason: String },

    /// The document was fetched but is deliberately not indexed.
    #[error("{reference} skipped: {reason}")]
    Skipped { reference: String, reason: String },

    #[error("PDF text extraction failed for {reference}: {reason}")]
    Pdf { reference: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("vector store load failed after {attempts} attempts: {reason}")]
    Load { attempts: usize, reason: String },

    #[error("vector store error: {0}")]
    Store(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EtlError {
    pub fn scrape(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Scrape {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn skipped(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Skipped {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Whether another attempt at the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request() || source.is_body()
            }
            Self::Status { status, .. } => RETRYABLE_STATUSES.contains(&status.as_u16()),
            Self::Store(_) | Self::Embedding(_) => true,
            _ => false,
        }
    }

    /// Whether the error only invalidates the single document being scraped.
    pub fn is_document_local(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::Status { .. }
                | Self::Scrape { .. }
                | Self::Skipped { .. }
                | Self::Pdf { .. }
                | Self::Json(_)
        )
    }
}
