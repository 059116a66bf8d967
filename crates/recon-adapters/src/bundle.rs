use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::RawRow;
use serde::{Deserialize, Serialize};

use crate::{AdapterError, FeedBatch, RawPayload, RowSource};

/// A captured batch on disk: `{ feed_id, fetched_at, rows: [ {column: value} ] }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedBundle {
    pub feed_id: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub rows: Vec<RawRow>,
}

pub async fn load_feed_bundle(
    path: impl AsRef<Path>,
) -> Result<(FeedBundle, Vec<u8>), AdapterError> {
    let path = path.as_ref();
    let origin = path.display().to_string();
    let bytes = tokio::fs::read(path).await.map_err(|source| AdapterError::Io {
        path: origin.clone(),
        source,
    })?;
    let bundle = serde_json::from_slice(&bytes).map_err(|err| AdapterError::Malformed {
        origin,
        message: err.to_string(),
    })?;
    Ok((bundle, bytes))
}

#[derive(Debug, Clone)]
pub struct JsonBundleSource {
    feed_id: String,
    path: PathBuf,
}

impl JsonBundleSource {
    pub fn new(feed_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            feed_id: feed_id.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl RowSource for JsonBundleSource {
    fn feed_id(&self) -> &str {
        &self.feed_id
    }

    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }

    async fn fetch(&self) -> Result<FeedBatch, AdapterError> {
        let origin = self.path.display().to_string();
        let (bundle, bytes) = load_feed_bundle(&self.path).await?;
        if bundle.feed_id != self.feed_id {
            return Err(AdapterError::FeedMismatch {
                origin,
                expected: self.feed_id.clone(),
                found: bundle.feed_id,
            });
        }
        Ok(FeedBatch {
            feed_id: bundle.feed_id,
            fetched_at: bundle.fetched_at,
            origin,
            rows: bundle.rows,
            raw_payload: Some(RawPayload {
                extension: "json",
                bytes,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::RawValue;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    #[tokio::test]
    async fn loads_bundle_rows_with_mixed_types() {
        let source = JsonBundleSource::new(
            "bookings",
            workspace_root().join("fixtures/bookings/bundle.json"),
        );
        let batch = source.fetch().await.unwrap();
        assert_eq!(batch.rows.len(), 3);
        assert_eq!(batch.rows[0].get("file"), Some(&RawValue::text("AB1234")));
        assert_eq!(batch.rows[0].get("amount"), Some(&RawValue::Number(100.0)));
    }

    #[tokio::test]
    async fn rejects_bundle_for_another_feed() {
        let source = JsonBundleSource::new(
            "balances",
            workspace_root().join("fixtures/bookings/bundle.json"),
        );
        assert!(matches!(source.fetch().await, Err(AdapterError::FeedMismatch { .. })));
    }

    #[tokio::test]
    async fn malformed_json_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();
        let err = JsonBundleSource::new("bookings", &path).fetch().await.unwrap_err();
        assert!(matches!(err, AdapterError::Malformed { .. }));
    }
}
