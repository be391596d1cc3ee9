//! PDF text extraction.
//!
//! `pdf-extract` is synchronous and CPU bound, so it runs on the blocking pool.

use crate::error::EtlError;
use tracing::{debug, instrument};

/// Extract the text layer of an in-memory PDF.
///
/// # Arguments
///
/// * `reference` - URL or name of the PDF, used in errors and logs
/// * `bytes` - The raw PDF
///
/// # Errors
///
/// [`EtlError::Pdf`] when the body is not a readable PDF or the extraction
/// task panics.
#[instrument(level = "debug", skip(bytes), fields(bytes = bytes.len()))]
pub async fn extract_text(reference: &str, bytes: Vec<u8>) -> Result<String, EtlError> {
    let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
        .await
        .map_err(|e| EtlError::Pdf {
            reference: reference.to_string(),
            reason: format!("extraction task failed: {e}"),
        })?
        .map_err(|e| EtlError::Pdf {
            reference: reference.to_string(),
            reason: e.to_string(),
        })?;
    debug!(chars = text.chars().count(), "Extracted PDF text");
    Ok(text)
}
