//! Airport/city code to country reference list.

use std::path::Path;

use recon_storage::AirportEntry;
use serde::Serialize;
use tracing::{info, warn};

use crate::csv_file::parse_csv_rows;
use crate::AdapterError;

const CODE_COLUMNS: &[&str] = &["code", "Codigociudad"];
const CITY_COLUMNS: &[&str] = &["city", "Nombreciudad"];
const COUNTRY_COLUMNS: &[&str] = &["country", "Idpaises"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedEntry {
    pub line: usize,
    pub code: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReferenceLoad {
    pub entries: Vec<AirportEntry>,
    pub rejected: Vec<RejectedEntry>,
}

fn cell(row: &recon_core::RawRow, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| row.get(name))
        .filter(|v| !v.is_blank())
        .and_then(|v| match v {
            recon_core::RawValue::Text(s) => Some(s.trim().to_uppercase()),
            _ => None,
        })
}

pub fn parse_airport_reference(bytes: &[u8], origin: &str) -> Result<ReferenceLoad, AdapterError> {
    let rows = parse_csv_rows(bytes, origin)?;
    let mut load = ReferenceLoad::default();
    let mut seen = std::collections::HashSet::new();

    for (index, row) in rows.iter().enumerate() {
        // header is line 1
        let line = index + 2;
        let code = cell(row, CODE_COLUMNS);
        let Some(code_value) = code.clone() else {
            load.rejected.push(RejectedEntry {
                line,
                code,
                reason: "missing code".into(),
            });
            continue;
        };
        let Some(country) = cell(row, COUNTRY_COLUMNS) else {
            load.rejected.push(RejectedEntry {
                line,
                code,
                reason: "no country mapped".into(),
            });
            continue;
        };
        if !seen.insert(code_value.clone()) {
            load.rejected.push(RejectedEntry {
                line,
                code,
                reason: "duplicate code".into(),
            });
            continue;
        }
        load.entries.push(AirportEntry {
            code: code_value,
            city: cell(row, CITY_COLUMNS),
            // the source list lost its Ñ to an encoding round-trip
            country: country.replace('?', "N"),
        });
    }
    Ok(load)
}

pub async fn load_airport_reference(path: impl AsRef<Path>) -> Result<ReferenceLoad, AdapterError> {
    let path = path.as_ref();
    let origin = path.display().to_string();
    let bytes = tokio::fs::read(path).await.map_err(|source| AdapterError::Io {
        path: origin.clone(),
        source,
    })?;
    let load = parse_airport_reference(&bytes, &origin)?;
    for rejected in &load.rejected {
        warn!(
            line = rejected.line,
            code = ?rejected.code,
            reason = %rejected.reason,
            "reference entry rejected"
        );
    }
    info!(
        accepted = load.entries.len(),
        rejected = load.rejected.len(),
        origin = %origin,
        "loaded airport reference"
    );
    Ok(load)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_without_country_are_rejected() {
        let csv = b"code,city,country\njfk,New York,Estados Unidos\nCRU,Cruceros,\n,Nowhere,Peru\n";
        let load = parse_airport_reference(csv, "inline").unwrap();
        assert_eq!(load.entries.len(), 1);
        assert_eq!(load.entries[0].code, "JFK");
        assert_eq!(load.entries[0].country, "ESTADOS UNIDOS");
        assert_eq!(load.rejected.len(), 2);
        assert_eq!(load.rejected[0].line, 3);
        assert_eq!(load.rejected[0].code.as_deref(), Some("CRU"));
    }

    #[test]
    fn question_marks_become_n_and_source_headers_are_accepted() {
        let csv = b"Codigociudad,Nombreciudad,Idpaises\nMAD,Madrid,Espa?a\n";
        let load = parse_airport_reference(csv, "inline").unwrap();
        assert_eq!(load.entries[0].country, "ESPANA");
        assert_eq!(load.entries[0].city.as_deref(), Some("MADRID"));
    }

    #[test]
    fn duplicate_codes_keep_the_first() {
        let csv = b"code,country\nHKG,Hong Kong\nhkg,China\n";
        let load = parse_airport_reference(csv, "inline").unwrap();
        assert_eq!(load.entries.len(), 1);
        assert_eq!(load.entries[0].country, "HONG KONG");
        assert_eq!(load.rejected[0].reason, "duplicate code");
    }

    #[tokio::test]
    async fn loads_reference_fixture() {
        let path =
            Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/reference/airports.csv");
        let load = load_airport_reference(path).await.unwrap();
        assert!(load.entries.iter().any(|e| e.code == "JFK"));
        assert!(!load.rejected.is_empty());
    }
}
