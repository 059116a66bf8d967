use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use recon_core::{RawRow, RawValue};
use tracing::info;

use crate::{AdapterError, FeedBatch, RawPayload, RowSource};

/// A spreadsheet extract saved as CSV. The header names the columns and every
/// cell is handed on as text; typing happens in the normalizer.
#[derive(Debug, Clone)]
pub struct CsvFileSource {
    feed_id: String,
    path: PathBuf,
}

impl CsvFileSource {
    pub fn new(feed_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            feed_id: feed_id.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn parse_csv_rows(bytes: &[u8], origin: &str) -> Result<Vec<RawRow>, AdapterError> {
    let malformed = |err: csv::Error| AdapterError::Malformed {
        origin: origin.to_string(),
        message: err.to_string(),
    };

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(malformed)?
        .iter()
        .map(|h| h.trim().trim_start_matches('\u{feff}').to_string())
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(malformed)?;
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(name, cell)| (name.clone(), RawValue::text(cell)))
            .collect::<RawRow>();
        rows.push(row);
    }
    Ok(rows)
}

#[async_trait]
impl RowSource for CsvFileSource {
    fn feed_id(&self) -> &str {
        &self.feed_id
    }

    fn describe(&self) -> String {
        format!("csv:{}", self.path.display())
    }

    async fn fetch(&self) -> Result<FeedBatch, AdapterError> {
        let origin = self.path.display().to_string();
        let bytes = tokio::fs::read(&self.path).await.map_err(|source| AdapterError::Io {
            path: origin.clone(),
            source,
        })?;
        let rows = parse_csv_rows(&bytes, &origin)?;
        info!(feed_id = %self.feed_id, rows = rows.len(), origin = %origin, "read csv extract");

        Ok(FeedBatch {
            feed_id: self.feed_id.clone(),
            fetched_at: Utc::now(),
            origin,
            rows,
            raw_payload: Some(RawPayload {
                extension: "csv",
                bytes,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    #[test]
    fn cells_are_kept_as_text_and_short_rows_read_missing() {
        let rows =
            parse_csv_rows(b"file,amount,status\nab1234, 100.5 ,ok\nzz9\n", "inline").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("amount"), Some(&RawValue::text(" 100.5 ")));
        assert_eq!(rows[1].get("file"), Some(&RawValue::text("zz9")));
        assert!(rows[1].get("status").is_none());
    }

    #[test]
    fn header_bom_is_stripped() {
        let rows = parse_csv_rows("\u{feff}file\nAB1\n".as_bytes(), "inline").unwrap();
        assert!(rows[0].get("file").is_some());
    }

    #[tokio::test]
    async fn reads_booking_fixture() {
        let source = CsvFileSource::new(
            "bookings",
            workspace_root().join("fixtures/bookings/extract.csv"),
        );
        let batch = source.fetch().await.unwrap();
        assert_eq!(batch.feed_id, "bookings");
        assert!(!batch.rows.is_empty());
        assert_eq!(batch.raw_payload.as_ref().map(|p| p.extension), Some("csv"));
        assert!(batch.rows[0].get("file").is_some());
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let source = CsvFileSource::new("bookings", "/nonexistent/extract.csv");
        assert!(matches!(source.fetch().await, Err(AdapterError::Io { .. })));
    }
}
