//! Static GTFS reference data: `agency.txt` and `routes.txt`.

pub mod agency;
pub mod route;

pub use agency::{Agency, AgencyRegistry};
pub use route::{Route, RouteRegistry, RouteType};

use std::io::Read;

use tracing::warn;

fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader)
}

/// Logs every header not in `known`. Unknown columns are ignored.
fn warn_unknown_columns(file: &'static str, headers: &csv::StringRecord, known: &[&str]) {
    for header in headers.iter().filter(|h| !known.contains(h)) {
        warn!(file, column = header, "ignoring unrecognized column");
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_url(
    file: &'static str,
    row: u64,
    column: &str,
    value: Option<String>,
) -> crate::Result<Option<String>> {
    match non_blank(value) {
        Some(value) => reqwest::Url::parse(&value)
            .map(|_| Some(value))
            .map_err(|e| crate::Error::static_data(file, row, format!("{column}: {e}"))),
        None => Ok(None),
    }
}
