//! In-process store with the same unit-of-work semantics as PostgreSQL.
//!
//! A unit of work holds the store lock for its whole lifetime and edits a
//! private copy of the state; commit swaps the copy in, rollback drops it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use recon_core::{Columns, DimensionKind, FactTable, FieldDiff, StoredFact, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::store::{AirportEntry, InsertOutcome, ReconStore, StoreError, UnitOfWork};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionRow {
    pub id: i64,
    pub key: String,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    dimensions: BTreeMap<DimensionKind, Vec<DimensionRow>>,
    facts: BTreeMap<String, Vec<StoredFact>>,
    sequences: BTreeMap<String, i64>,
}

impl MemoryState {
    fn next_id(&mut self, table: &str) -> i64 {
        let seq = self.sequences.entry(table.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    fn dimension_id(&self, kind: DimensionKind, key: &str) -> Option<i64> {
        if kind == DimensionKind::Reservation {
            let id = key.trim().parse::<i64>().ok()?;
            return self
                .facts
                .get(kind.table())
                .and_then(|rows| rows.iter().find(|r| r.id == id))
                .map(|r| r.id);
        }
        let wanted = key.trim().to_uppercase();
        self.dimensions
            .get(&kind)
            .and_then(|rows| rows.iter().find(|r| r.key.to_uppercase() == wanted))
            .map(|r| r.id)
    }

    fn insert_dimension(
        &mut self,
        kind: DimensionKind,
        key: &str,
        country: Option<String>,
    ) -> InsertOutcome {
        if self.dimension_id(kind, key).is_some() {
            return InsertOutcome::Conflict;
        }
        let id = self.next_id(kind.table());
        self.dimensions.entry(kind).or_default().push(DimensionRow {
            id,
            key: key.to_string(),
            country,
        });
        InsertOutcome::Inserted(id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed dimension rows of one kind, in creation order.
    pub async fn dimension_rows(&self, kind: DimensionKind) -> Vec<DimensionRow> {
        let state = self.state.lock().await;
        state.dimensions.get(&kind).cloned().unwrap_or_default()
    }

    /// Committed fact rows of one table, in id order.
    pub async fn fact_rows(&self, table: &str) -> Vec<StoredFact> {
        let state = self.state.lock().await;
        state.facts.get(table).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ReconStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryUnitOfWork {
            guard,
            working,
            savepoints: Vec::new(),
        }))
    }
}

pub struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    savepoints: Vec<MemoryState>,
}

impl MemoryUnitOfWork {
    fn check_columns(
        table: &FactTable,
        columns: impl Iterator<Item = impl AsRef<str>>,
    ) -> Result<(), StoreError> {
        for column in columns {
            let column = column.as_ref();
            if table.column(column).is_none() {
                return Err(StoreError::Invalid(format!(
                    "table {} has no column {column}",
                    table.name
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn find_dimension(
        &mut self,
        kind: DimensionKind,
        key: &str,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self.working.dimension_id(kind, key))
    }

    async fn create_dimension(
        &mut self,
        kind: DimensionKind,
        key: &str,
    ) -> Result<InsertOutcome, StoreError> {
        match kind {
            DimensionKind::Airport | DimensionKind::Reservation => Err(StoreError::Invalid(format!(
                "{kind} rows are not created by reconciliation"
            ))),
            _ => Ok(self.working.insert_dimension(kind, key, None)),
        }
    }

    async fn upsert_airport(&mut self, entry: &AirportEntry) -> Result<InsertOutcome, StoreError> {
        Ok(self
            .working
            .insert_dimension(DimensionKind::Airport, &entry.code, Some(entry.country.clone())))
    }

    async fn find_fact(
        &mut self,
        table: &FactTable,
        lookup: &[(&'static str, Value)],
    ) -> Result<Option<StoredFact>, StoreError> {
        Self::check_columns(table, lookup.iter().map(|(c, _)| *c))?;
        let Some(rows) = self.working.facts.get(table.name) else {
            return Ok(None);
        };
        Ok(rows
            .iter()
            .find(|row| lookup.iter().all(|(column, value)| row.get(column).equivalent(value)))
            .cloned())
    }

    async fn insert_fact(
        &mut self,
        table: &FactTable,
        columns: &Columns,
    ) -> Result<i64, StoreError> {
        Self::check_columns(table, columns.keys())?;
        if let Some(unique) = table.unique_column {
            let candidate = columns.get(unique).cloned().unwrap_or_default();
            let taken = !candidate.is_absent()
                && self
                    .working
                    .facts
                    .get(table.name)
                    .is_some_and(|rows| rows.iter().any(|r| r.get(unique).equivalent(&candidate)));
            if taken {
                return Err(StoreError::UniqueViolation {
                    constraint: format!("{}_{unique}_key", table.name),
                });
            }
        }

        let id = self.working.next_id(table.name);
        let mut stored = Columns::new();
        for def in &table.columns {
            stored.insert(def.name.to_string(), columns.get(def.name).cloned().unwrap_or_default());
        }
        self.working
            .facts
            .entry(table.name.to_string())
            .or_default()
            .push(StoredFact { id, columns: stored });
        Ok(id)
    }

    async fn patch_fact(
        &mut self,
        table: &FactTable,
        id: i64,
        diff: &FieldDiff,
    ) -> Result<(), StoreError> {
        Self::check_columns(table, diff.iter().map(|(c, _)| c))?;
        let row = self
            .working
            .facts
            .get_mut(table.name)
            .and_then(|rows| rows.iter_mut().find(|r| r.id == id))
            .ok_or_else(|| StoreError::Invalid(format!("{} row {id} does not exist", table.name)))?;
        diff.apply_to(&mut row.columns);
        Ok(())
    }

    async fn savepoint(&mut self) -> Result<(), StoreError> {
        self.savepoints.push(self.working.clone());
        Ok(())
    }

    async fn release_savepoint(&mut self) -> Result<(), StoreError> {
        self.savepoints
            .pop()
            .map(|_| ())
            .ok_or_else(|| StoreError::Invalid("no open savepoint".into()))
    }

    async fn rollback_to_savepoint(&mut self) -> Result<(), StoreError> {
        let snapshot = self
            .savepoints
            .pop()
            .ok_or_else(|| StoreError::Invalid("no open savepoint".into()))?;
        self.working = snapshot;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryUnitOfWork { mut guard, working, .. } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
