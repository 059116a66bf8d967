//! Hash-addressed, write-once storage for raw feed payloads and run
//! diagnostics.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The same bytes were already on disk; nothing was written.
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<day>/<feed_id>/<hash>.<ext>`; payloads fetched on the same day with
    /// the same content share one file.
    pub fn relative_path_for(
        captured_at: DateTime<Utc>,
        feed_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        PathBuf::from(captured_at.format("%Y-%m-%d").to_string())
            .join(feed_id)
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn store_bytes(
        &self,
        captured_at: DateTime<Utc>,
        feed_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = sha256_hex(bytes);
        let relative_path = Self::relative_path_for(captured_at, feed_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let written = write_once(&absolute_path, bytes).await?;

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: !written,
        })
    }

    pub async fn store_json<T: Serialize + ?Sized>(
        &self,
        captured_at: DateTime<Utc>,
        feed_id: &str,
        value: &T,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(value).context("serializing artifact json")?;
        self.store_bytes(captured_at, feed_id, "json", &bytes).await
    }
}

/// Writes through a temp file and a rename so readers never see a partial
/// file. Returns false when the target already exists.
async fn write_once(path: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let parent = path
        .parent()
        .with_context(|| format!("artifact path {} has no parent", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating artifact directory {}", parent.display()))?;

    if fs::try_exists(path)
        .await
        .with_context(|| format!("checking artifact path {}", path.display()))?
    {
        return Ok(false);
    }

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::File::create(&temp_path)
        .await
        .with_context(|| format!("creating temp artifact {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp artifact {}", temp_path.display()))?;
    file.flush().await?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        if err.kind() == std::io::ErrorKind::AlreadyExists {
            return Ok(false);
        }
        return Err(err).with_context(|| format!("renaming artifact into {}", path.display()));
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_payloads_share_one_file() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let at = DateTime::parse_from_rfc3339("2026-03-02T08:15:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_bytes(at, "bookings", "json", br#"{"Entities":[]}"#)
            .await
            .expect("first");
        let second = store
            .store_bytes(at, "bookings", "json", br#"{"Entities":[]}"#)
            .await
            .expect("second");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("2026-03-02/bookings"));
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn json_artifacts_get_json_extension() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let stored = store
            .store_json(Utc::now(), "balances", &serde_json::json!({"rows": 3}))
            .await
            .expect("store");
        assert_eq!(stored.relative_path.extension().and_then(|e| e.to_str()), Some("json"));
    }
}
