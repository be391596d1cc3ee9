//! Whitespace and markup cleanup shared by the HTML, JSON and PDF scrapers.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use scraper::{ElementRef, Html};

static LAYOUT_WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\x{a0}|\t+|\n+)").expect("layout whitespace regex"));
static PAGE_NUMBER_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*\d+\s*$").expect("page number regex"));
static SPLIT_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\w+)- (\w+)").expect("split word regex"));
static NEWLINE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n+").expect("newline regex"));
static NUMERIC_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").expect("numeric date regex"));
static LONG_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(\d{1,2}) de (\p{L}+) de (\d{4})\b").expect("long date regex"));

/// Replace non-breaking spaces, tab runs and newline runs with a single space.
pub fn clean_text(text: &str) -> String {
    LAYOUT_WHITESPACE.replace_all(text, " ").into_owned()
}

/// Plain text of an HTML fragment, trimmed.
pub fn html_to_text(fragment: &str) -> String {
    let html = Html::parse_fragment(fragment);
    html.root_element().text().collect::<String>().trim().to_string()
}

/// All descendant text of `element`, concatenated as-is.
pub fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect()
}

/// Descendant text nodes, each trimmed, empties dropped, joined by `separator`.
pub fn element_text_stripped(element: ElementRef<'_>, separator: &str) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(separator)
}

/// Fix the usual artifacts of text extracted from a bulletin PDF: bare page
/// numbers, words split by a hyphen and a space, and runs of blank lines.
pub fn clean_pdf_text(text: &str) -> String {
    let text = PAGE_NUMBER_LINE.replace_all(text, "");
    let text = SPLIT_WORD.replace_all(&text, "$1$2");
    let text = NEWLINE_RUNS.replace_all(&text, "\n");
    text.trim_end_matches('\n').to_string()
}

/// Spanish month name to month number.
pub fn month_number(name: &str) -> Option<u32> {
    let month = match name.trim().to_lowercase().as_str() {
        "enero" => 1,
        "febrero" => 2,
        "marzo" => 3,
        "abril" => 4,
        "mayo" => 5,
        "junio" => 6,
        "julio" => 7,
        "agosto" => 8,
        "septiembre" | "setiembre" => 9,
        "octubre" => 10,
        "noviembre" => 11,
        "diciembre" => 12,
        _ => return None,
    };
    Some(month)
}

fn captured_date(caps: &Captures<'_>, month: Option<u32>) -> Option<(usize, NaiveDate)> {
    let day = caps[1].parse().ok()?;
    let year = caps[3].parse().ok()?;
    let start = caps.get(0)?.start();
    Some((start, NaiveDate::from_ymd_opt(year, month?, day)?))
}

/// First valid date in `text`, written either `dd/mm/yyyy` or `d de <mes> de yyyy`.
pub fn find_date(text: &str) -> Option<NaiveDate> {
    let numeric = NUMERIC_DATE
        .captures_iter(text)
        .find_map(|caps| captured_date(&caps, caps[2].parse().ok()));
    let long = LONG_DATE
        .captures_iter(text)
        .find_map(|caps| captured_date(&caps, month_number(&caps[2])));
    numeric
        .into_iter()
        .chain(long)
        .min_by_key(|(start, _)| *start)
        .map(|(_, date)| date)
}

/// Date found in the first text node under `root` that matches `marker`.
/// Text inside an element carrying the class `skip_class` is ignored.
pub fn marked_date(root: ElementRef<'_>, marker: &Regex, skip_class: Option<&str>) -> Option<NaiveDate> {
    root.descendants()
        .filter(|node| {
            !skip_class.is_some_and(|class| {
                node.ancestors()
                    .filter_map(|a| a.value().as_element())
                    .any(|e| e.classes().any(|c| c == class))
            })
        })
        .filter_map(|node| node.value().as_text().map(|text| &**text))
        .filter(|text| marker.is_match(text))
        .find_map(find_date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Selector;

    #[test]
    fn test_clean_text_collapses_layout_whitespace() {
        assert_eq!(clean_text("a\u{a0}b\t\tc\n\n\nd"), "a b c d");
        assert_eq!(clean_text("sin cambios"), "sin cambios");
    }

    #[test]
    fn test_html_to_text() {
        assert_eq!(
            html_to_text("<p>ORDEN de <b>3 de enero</b></p>\n<p>Texto</p>"),
            "ORDEN de 3 de enero\nTexto"
        );
    }

    #[test]
    fn test_element_text_stripped() {
        let html = Html::parse_fragment("<div> <p> uno </p>\n<p>dos</p><p>  </p></div>");
        let div = html.select(&Selector::parse("div").unwrap()).next().unwrap();
        assert_eq!(element_text_stripped(div, "\n"), "uno\ndos");
    }

    #[test]
    fn test_clean_pdf_text() {
        let raw = "ANUNCIO del ayunta- miento\n\n12\nde Zaragoza\n\n\n";
        assert_eq!(clean_pdf_text(raw), "ANUNCIO del ayuntamiento\nde Zaragoza");
    }

    #[test]
    fn test_find_date_takes_the_earliest_form() {
        assert_eq!(find_date("BOJA núm. 1 de 02/01/2024"), NaiveDate::from_ymd_opt(2024, 1, 2));
        assert_eq!(
            find_date("N.º 10, lunes 15 de Enero de 2024 (ref. 20/02/2024)"),
            NaiveDate::from_ymd_opt(2024, 1, 15)
        );
        assert_eq!(find_date("31/02/2024 o 5 de brumario de 2024"), None);
        assert_eq!(find_date("sin fecha"), None);
    }

    #[test]
    fn test_marked_date_ignores_skipped_blocks() {
        let html = Html::parse_document(
            r#"<div class="cuerpo"><p>BOPV N.º 3, de 4 de enero de 2023</p></div>
               <p>Otro texto de 9 de enero de 2024</p>
               <p>BOPV N.º 12, 17 de enero de 2024</p>"#,
        );
        let marker = Regex::new(r"N\.º\s*\d+").unwrap();
        assert_eq!(
            marked_date(html.root_element(), &marker, Some("cuerpo")),
            NaiveDate::from_ymd_opt(2024, 1, 17)
        );
        assert_eq!(
            marked_date(html.root_element(), &marker, None),
            NaiveDate::from_ymd_opt(2023, 1, 4)
        );
    }

    #[test]
    fn test_month_number() {
        assert_eq!(month_number("Enero"), Some(1));
        assert_eq!(month_number(" diciembre "), Some(12));
        assert_eq!(month_number("brumario"), None);
    }
}
