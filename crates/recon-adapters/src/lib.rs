//! Row sources for the reconciler: CSV extracts, JSON fixture bundles and
//! the paginated remote booking feed, plus the airport reference loader.

use chrono::{DateTime, Utc};
use recon_core::RawRow;
use serde::Serialize;
use thiserror::Error;

mod bundle;
mod csv_file;
mod reference;
mod remote;

pub use bundle::{load_feed_bundle, FeedBundle, JsonBundleSource};
pub use csv_file::{parse_csv_rows, CsvFileSource};
pub use reference::{load_airport_reference, parse_airport_reference, ReferenceLoad, RejectedEntry};
pub use remote::{booking_column_renames, RemoteBookingSource, RemoteFeedConfig};

pub const CRATE_NAME: &str = "recon-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed extract {origin}: {message}")]
    Malformed { origin: String, message: String },
    #[error("bundle at {origin} is for feed `{found}`, expected `{expected}`")]
    FeedMismatch {
        origin: String,
        expected: String,
        found: String,
    },
    #[error(transparent)]
    Fetch(#[from] recon_storage::FetchError),
}

/// Raw bytes as received, kept for the artifact archive.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub extension: &'static str,
    pub bytes: Vec<u8>,
}

/// One finite batch of rows for one feed.
#[derive(Debug, Clone)]
pub struct FeedBatch {
    pub feed_id: String,
    pub fetched_at: DateTime<Utc>,
    /// Path or URL the rows came from.
    pub origin: String,
    pub rows: Vec<RawRow>,
    pub raw_payload: Option<RawPayload>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchInfo {
    pub feed_id: String,
    pub origin: String,
    pub fetched_at: DateTime<Utc>,
    pub row_count: usize,
}

impl FeedBatch {
    pub fn info(&self) -> BatchInfo {
        BatchInfo {
            feed_id: self.feed_id.clone(),
            origin: self.origin.clone(),
            fetched_at: self.fetched_at,
            row_count: self.rows.len(),
        }
    }
}

#[async_trait::async_trait]
pub trait RowSource: Send + Sync {
    fn feed_id(&self) -> &str;

    fn describe(&self) -> String;

    async fn fetch(&self) -> Result<FeedBatch, AdapterError>;
}
