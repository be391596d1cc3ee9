//! Section classification.
//!
//! Publishers group dispositions under free-text headers instead of an explicit
//! field. The header is case-folded and trimmed, and its leading characters are
//! looked up in [`SECTION_PREFIXES`]. This is best effort: headers are written by
//! hand upstream and an unmatched header classifies as nothing.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::error;

/// Normalized header prefix to ordinal section number.
pub const SECTION_PREFIXES: [(&str, u8); 5] = [
    ("i. c", 1),
    ("ii. ", 2),
    ("iii.", 3),
    ("iv. ", 4),
    ("v. o", 5),
];

/// Section filters applied to the BOCM day summary (`section-subsection`).
pub const BOCM_SECTIONS: [&str; 3] = ["1-A", "3-", "4-"];

/// BOPV sections whose dispositions are indexed.
pub const BOPV_SECTIONS: [&str; 2] = ["DISPOSICIONES GENERALES", "OTRAS DISPOSICIONES"];

static BOJA_LISTING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(Disposiciones Generales|Otras Disposiciones)\b").expect("boja listing regex")
});
static ORDINAL_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\.\s*").expect("ordinal prefix regex"));
static FIRST_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(\w+)").expect("first word regex"));

/// Map a section header such as `"III. ADMINISTRACIÓN LOCAL"` to its number.
pub fn classify_section(header: &str) -> Option<u8> {
    let normalized = header.trim().to_lowercase();
    SECTION_PREFIXES
        .iter()
        .find(|(prefix, _)| normalized.starts_with(prefix))
        .map(|(_, number)| *number)
}

/// Legislative origin implied by a BOCM section number.
pub fn origen_legislativo(seccion: &str) -> &'static str {
    match seccion {
        "1" => "Autonómico",
        "2" => "Estatal",
        "3" => "Local",
        "4" => "Judicial",
        _ => "",
    }
}

/// Fields derived from the `#cabeceras` paragraphs of a BOCM disposition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BocmHeaders {
    pub seccion: String,
    pub subseccion: String,
    pub apartado: String,
    pub organo: String,
    pub anunciante: String,
    pub rango: String,
}

/// Classify the (at most three, already upper-cased) header paragraphs of a BOCM
/// disposition. `description` is the page's meta description and `cve` its CVE,
/// both used to pull the rank out of section 1 descriptions.
///
/// An unrecognized first header is logged and yields an empty classification.
pub fn classify_bocm_headers(paras: &[String], description: &str, cve: &str) -> BocmHeaders {
    let Some(section) = paras.first().and_then(|h| classify_section(h)) else {
        error!(%cve, headers = ?paras, "Unrecognized BOCM section header; leaving classification empty");
        return BocmHeaders::default();
    };

    let para = |i: usize| paras.get(i).cloned().unwrap_or_default();
    let mut out = BocmHeaders {
        seccion: section.to_string(),
        ..Default::default()
    };

    match section {
        1 => {
            out.subseccion = para(1);
            out.organo = para(2);
            let num_art = cve.rsplit('-').next().unwrap_or_default();
            if description.len() > 10 && !num_art.is_empty() {
                if let Some(rest) = description.split(num_art).nth(1) {
                    out.rango = FIRST_WORD
                        .captures(rest)
                        .map(|c| c[1].to_uppercase())
                        .unwrap_or_default();
                }
            }
        }
        2 => {
            out.subseccion = "DISPOSICIONES Y ANUNCIOS DEL ESTADO".to_string();
            out.organo = para(1);
        }
        3 => {
            out.subseccion = "ADMINISTRACIÓN LOCAL AYUNTAMIENTOS".to_string();
            match paras.len() {
                3 => {
                    out.apartado = para(1);
                    out.organo = para(2);
                }
                _ => {
                    out.apartado = "MANCOMUNIDADES".to_string();
                    out.organo = para(1);
                }
            }
        }
        4 => out.subseccion = "ADMINISTRACIÓN DE JUSTICIA".to_string(),
        _ => {
            out.subseccion = "OTROS ANUNCIOS".to_string();
            out.anunciante = para(1);
        }
    }
    out
}

/// Whether a BOPV section header belongs to an indexed section.
pub fn is_bopv_section(header: &str) -> bool {
    let header = header.trim().to_uppercase();
    BOPV_SECTIONS.contains(&header.as_str())
}

/// Whether a BOJA summary entry links to a listing of dispositions.
pub fn is_boja_listing(text: &str) -> bool {
    BOJA_LISTING.is_match(text)
}

/// Drop the `"3. "` ordinal some BOJA disposition types carry.
pub fn boja_tipologia(raw: &str) -> String {
    ORDINAL_PREFIX.replace(raw.trim(), "").into_owned()
}
