//! Command-line interface definitions.
//!
//! Every subcommand works on one bulletin source. The configuration file can
//! be given with `--config`; otherwise `$APP_PATH/config/config.yaml` is used
//! when present.

use crate::scrapers::Source;
use crate::utils::parse_date;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Scrape official bulletins and load them into a vector store.
///
/// # Examples
///
/// ```sh
/// # Load today's BOE
/// boletin_etl today --source boe
///
/// # Backfill a date range
/// boletin_etl --config ./config.yaml dates --source bocm 2024/01/01 2024/01/31
///
/// # Query the loaded collection
/// boletin_etl search "tipo impositivo de las viviendas" -k 5 --source dgt
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to config.yaml
    #[arg(short, long, global = true, env = "BOLETIN_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load everything published today
    Today {
        #[arg(short, long, value_enum)]
        source: Source,
    },

    /// Load every day between two dates, both included
    Dates {
        #[arg(short, long, value_enum)]
        source: Source,

        /// First day, YYYY/MM/DD
        #[arg(value_parser = parse_day)]
        start: NaiveDate,

        /// Last day, YYYY/MM/DD
        #[arg(value_parser = parse_day)]
        end: NaiveDate,
    },

    /// Load specific documents by URL
    Document {
        #[arg(short, long, value_enum)]
        source: Source,

        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Similarity search over a source collection
    Search {
        query: String,

        /// Number of hits; defaults to `top_k_results` from the configuration
        #[arg(short)]
        k: Option<usize>,

        #[arg(short, long, value_enum, default_value = "boe")]
        source: Source,
    },
}

fn parse_day(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y/%m/%d")
        .ok()
        .or_else(|| parse_date(raw))
        .ok_or_else(|| format!("invalid date `{raw}`, expected YYYY/MM/DD"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_today() {
        let cli = Cli::parse_from(["boletin_etl", "today", "--source", "bopgr"]);
        assert!(cli.config.is_none());
        assert!(matches!(cli.command, Command::Today { source: Source::Bopgr }));
    }

    #[test]
    fn test_dates_with_global_config() {
        let cli = Cli::parse_from([
            "boletin_etl",
            "dates",
            "-s",
            "boe",
            "2024/01/30",
            "2024/02/02",
            "--config",
            "/etc/boletin/config.yaml",
        ]);

        assert_eq!(cli.config, Some(PathBuf::from("/etc/boletin/config.yaml")));
        match cli.command {
            Command::Dates { source, start, end } => {
                assert_eq!(source, Source::Boe);
                assert_eq!(start, NaiveDate::from_ymd_opt(2024, 1, 30).unwrap());
                assert_eq!(end, NaiveDate::from_ymd_opt(2024, 2, 2).unwrap());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_bad_date_is_rejected() {
        let err = Cli::try_parse_from(["boletin_etl", "dates", "-s", "boe", "2024/13/01", "2024/01/02"]);
        assert!(err.is_err());
    }

    #[test]
    fn test_document_needs_urls() {
        assert!(Cli::try_parse_from(["boletin_etl", "document", "--source", "boa"]).is_err());

        let cli = Cli::parse_from([
            "boletin_etl",
            "document",
            "--source",
            "boe",
            "https://www.boe.es/diario_boe/xml.php?id=BOE-A-2024-1",
            "https://www.boe.es/diario_boe/xml.php?id=BOE-A-2024-2",
        ]);
        match cli.command {
            Command::Document { source, urls } => {
                assert_eq!(source, Source::Boe);
                assert_eq!(urls.len(), 2);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_search() {
        let cli = Cli::parse_from(["boletin_etl", "search", "subvenciones agrarias", "-k", "3", "-s", "boa"]);
        match cli.command {
            Command::Search { query, k, source } => {
                assert_eq!(query, "subvenciones agrarias");
                assert_eq!(k, Some(3));
                assert_eq!(source, Source::Boa);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
