//! Get-or-create resolution of dimension keys to surrogate ids.
//!
//! Resolved keys are cached for the whole run. Keys created while a row is in
//! flight stay pending until the row is released; if the row is rolled back
//! they are forgotten, since the savepoint rollback removed the rows.

use std::collections::HashMap;

use recon_core::{DimensionKind, ResolvePolicy, Value};
use recon_storage::{InsertOutcome, StoreError, UnitOfWork};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resolved(i64),
    /// The key was absent; the reference stays empty.
    NoReference,
    /// Lookup-only dimension with no row for this key.
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverStats {
    pub cache_hits: usize,
    pub found: usize,
    pub created: usize,
    pub conflicts_recovered: usize,
    pub unknown: usize,
}

#[derive(Debug, Default)]
pub struct DimensionResolver {
    cache: HashMap<(DimensionKind, String), i64>,
    pending: Vec<(DimensionKind, String)>,
    stats: ResolverStats,
}

fn cache_key(key: &Value) -> String {
    key.to_string().trim().to_uppercase()
}

impl DimensionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> ResolverStats {
        self.stats
    }

    pub async fn resolve(
        &mut self,
        uow: &mut dyn UnitOfWork,
        kind: DimensionKind,
        key: &Value,
    ) -> Result<Resolution, StoreError> {
        if key.is_absent() {
            return Ok(Resolution::NoReference);
        }
        let key = cache_key(key);
        if let Some(id) = self.cache.get(&(kind, key.clone())) {
            self.stats.cache_hits += 1;
            return Ok(Resolution::Resolved(*id));
        }

        if let Some(id) = uow.find_dimension(kind, &key).await? {
            self.stats.found += 1;
            self.cache.insert((kind, key), id);
            return Ok(Resolution::Resolved(id));
        }

        if kind.policy() == ResolvePolicy::LookupOnly {
            self.stats.unknown += 1;
            return Ok(Resolution::Unknown);
        }

        let id = match uow.create_dimension(kind, &key).await? {
            InsertOutcome::Inserted(id) => {
                self.stats.created += 1;
                self.pending.push((kind, key.clone()));
                debug!(%kind, key = %key, id, "created dimension row");
                id
            }
            InsertOutcome::Conflict => {
                // a concurrent writer got there first; read its row
                let id = uow.find_dimension(kind, &key).await?.ok_or_else(|| {
                    StoreError::Invalid(format!(
                        "{kind} `{key}` conflicted on insert but cannot be read"
                    ))
                })?;
                self.stats.conflicts_recovered += 1;
                debug!(%kind, key = %key, id, "recovered dimension insert conflict");
                id
            }
        };
        self.cache.insert((kind, key), id);
        Ok(Resolution::Resolved(id))
    }

    /// The current row's writes are kept.
    pub fn commit_row(&mut self) {
        self.pending.clear();
    }

    /// The current row was rolled back; forget the keys it created.
    pub fn discard_row(&mut self) {
        for key in self.pending.drain(..) {
            self.cache.remove(&key);
            self.stats.created -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_storage::{MemoryStore, ReconStore};

    fn text(s: &str) -> Value {
        Value::Text(s.into())
    }

    #[tokio::test]
    async fn same_key_resolves_to_same_id_without_second_create() {
        let store = MemoryStore::new();
        let mut uow = store.begin().await.unwrap();
        let mut resolver = DimensionResolver::new();

        let a = resolver
            .resolve(uow.as_mut(), DimensionKind::Provider, &text("ACME"))
            .await
            .unwrap();
        let b = resolver
            .resolve(uow.as_mut(), DimensionKind::Provider, &text("acme"))
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(resolver.stats().created, 1);
        assert_eq!(resolver.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn absent_key_is_no_reference() {
        let store = MemoryStore::new();
        let mut uow = store.begin().await.unwrap();
        let mut resolver = DimensionResolver::new();
        let res = resolver
            .resolve(uow.as_mut(), DimensionKind::Passenger, &Value::Absent)
            .await
            .unwrap();
        assert_eq!(res, Resolution::NoReference);
        assert_eq!(resolver.stats(), ResolverStats::default());
    }

    #[tokio::test]
    async fn lookup_only_miss_is_unknown_and_creates_nothing() {
        let store = MemoryStore::new();
        let mut uow = store.begin().await.unwrap();
        let mut resolver = DimensionResolver::new();
        let res = resolver
            .resolve(uow.as_mut(), DimensionKind::Airport, &text("XXX"))
            .await
            .unwrap();
        assert_eq!(res, Resolution::Unknown);
        uow.commit().await.unwrap();
        assert!(store.dimension_rows(DimensionKind::Airport).await.is_empty());
    }

    #[tokio::test]
    async fn discarded_row_forgets_created_keys() {
        let store = MemoryStore::new();
        let mut uow = store.begin().await.unwrap();
        let mut resolver = DimensionResolver::new();

        uow.savepoint().await.unwrap();
        resolver.resolve(uow.as_mut(), DimensionKind::Account, &text("SANTANDER")).await.unwrap();
        uow.rollback_to_savepoint().await.unwrap();
        resolver.discard_row();

        let again = resolver
            .resolve(uow.as_mut(), DimensionKind::Account, &text("SANTANDER"))
            .await
            .unwrap();
        assert!(matches!(again, Resolution::Resolved(_)));
        resolver.commit_row();
        uow.commit().await.unwrap();
        assert_eq!(store.dimension_rows(DimensionKind::Account).await.len(), 1);
    }
}
