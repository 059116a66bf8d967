//! PostgreSQL store over sqlx. One unit of work is one transaction; per-row
//! isolation uses a named savepoint.

use async_trait::async_trait;
use chrono::NaiveDate;
use recon_core::{
    ColumnDef, Columns, DimensionKind, FactTable, FieldDiff, FieldKind, StoredFact, Value,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;

use crate::store::{AirportEntry, InsertOutcome, ReconStore, StoreError, UnitOfWork};

const ROW_SAVEPOINT: &str = "recon_row";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl ReconStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }
}

pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn select_dimension_sql(kind: DimensionKind) -> String {
    let table = quote_ident(kind.table());
    match kind {
        DimensionKind::Reservation => format!("SELECT \"id\" FROM {table} WHERE \"id\" = $1"),
        _ => format!(
            "SELECT \"id\" FROM {table} WHERE upper({}) = upper($1) ORDER BY \"id\" LIMIT 1",
            quote_ident(kind.key_column())
        ),
    }
}

pub fn insert_dimension_sql(kind: DimensionKind) -> String {
    format!(
        "INSERT INTO {} ({}) VALUES ($1) ON CONFLICT DO NOTHING RETURNING \"id\"",
        quote_ident(kind.table()),
        quote_ident(kind.key_column())
    )
}

pub fn insert_airport_sql() -> &'static str {
    "INSERT INTO \"airports\" (\"code\", \"city\", \"country\") VALUES ($1, $2, $3) \
     ON CONFLICT DO NOTHING RETURNING \"id\""
}

pub fn select_fact_sql(table: &FactTable, lookup: &[&str]) -> String {
    let columns = std::iter::once("\"id\"".to_string())
        .chain(table.columns.iter().map(|c| quote_ident(c.name)))
        .collect::<Vec<_>>()
        .join(", ");
    let predicate = if lookup.is_empty() {
        "FALSE".to_string()
    } else {
        lookup
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{} IS NOT DISTINCT FROM ${}", quote_ident(col), i + 1))
            .collect::<Vec<_>>()
            .join(" AND ")
    };
    format!(
        "SELECT {columns} FROM {} WHERE {predicate} ORDER BY \"id\" LIMIT 1",
        quote_ident(table.name)
    )
}

pub fn insert_fact_sql(table: &FactTable, columns: &[&str]) -> String {
    let names = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    let params = (1..=columns.len()).map(|i| format!("${i}")).collect::<Vec<_>>().join(", ");
    format!(
        "INSERT INTO {} ({names}) VALUES ({params}) RETURNING \"id\"",
        quote_ident(table.name)
    )
}

pub fn update_fact_sql(table: &FactTable, columns: &[&str]) -> String {
    let assignments = columns
        .iter()
        .enumerate()
        .map(|(i, col)| format!("{} = ${}", quote_ident(col), i + 1))
        .chain(std::iter::once("\"updated_at\" = now()".to_string()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {} SET {assignments} WHERE \"id\" = ${}",
        quote_ident(table.name),
        columns.len() + 1
    )
}

fn column_def<'t>(table: &'t FactTable, column: &str) -> Result<&'t ColumnDef, StoreError> {
    table
        .column(column)
        .ok_or_else(|| StoreError::Invalid(format!("table {} has no column {column}", table.name)))
}

/// Binds a value with the SQL type of its column so `IS NOT DISTINCT FROM`
/// and inserts see typed NULLs.
fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    def: &ColumnDef,
    value: &Value,
) -> Result<Query<'q, Postgres, PgArguments>, StoreError> {
    let mismatch = || StoreError::Invalid(format!("column {} cannot hold {value:?}", def.name));
    let absent = value.is_absent();
    Ok(match def.kind {
        FieldKind::Text | FieldKind::Code => {
            query.bind((!absent).then(|| value.to_string()))
        }
        FieldKind::Amount | FieldKind::Rate => {
            let decimal: Option<Decimal> = if absent {
                None
            } else {
                Some(value.as_decimal().ok_or_else(mismatch)?)
            };
            query.bind(decimal)
        }
        FieldKind::Date => {
            let date: Option<NaiveDate> = if absent {
                None
            } else {
                Some(value.calendar_day().ok_or_else(mismatch)?)
            };
            query.bind(date)
        }
        FieldKind::Integer => {
            let int: Option<i64> = if absent {
                None
            } else {
                Some(value.as_i64().ok_or_else(mismatch)?)
            };
            query.bind(int)
        }
    })
}

fn read_value(row: &PgRow, def: &ColumnDef) -> Result<Value, StoreError> {
    let value = match def.kind {
        FieldKind::Text | FieldKind::Code => row
            .try_get::<Option<String>, _>(def.name)?
            .map(Value::Text),
        FieldKind::Amount | FieldKind::Rate => row
            .try_get::<Option<Decimal>, _>(def.name)?
            .map(Value::Decimal),
        FieldKind::Date => row.try_get::<Option<NaiveDate>, _>(def.name)?.map(Value::Date),
        FieldKind::Integer => row.try_get::<Option<i64>, _>(def.name)?.map(Value::Integer),
    };
    Ok(value.unwrap_or_default())
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn find_dimension(
        &mut self,
        kind: DimensionKind,
        key: &str,
    ) -> Result<Option<i64>, StoreError> {
        let sql = select_dimension_sql(kind);
        let row = if kind == DimensionKind::Reservation {
            let Ok(id) = key.trim().parse::<i64>() else {
                return Ok(None);
            };
            sqlx::query(&sql).bind(id).fetch_optional(&mut *self.tx).await?
        } else {
            sqlx::query(&sql).bind(key).fetch_optional(&mut *self.tx).await?
        };
        Ok(row.map(|r| r.try_get::<i64, _>("id")).transpose()?)
    }

    async fn create_dimension(
        &mut self,
        kind: DimensionKind,
        key: &str,
    ) -> Result<InsertOutcome, StoreError> {
        if matches!(kind, DimensionKind::Airport | DimensionKind::Reservation) {
            return Err(StoreError::Invalid(format!(
                "{kind} rows are not created by reconciliation"
            )));
        }
        let row = sqlx::query(&insert_dimension_sql(kind))
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(match row {
            Some(row) => InsertOutcome::Inserted(row.try_get("id")?),
            None => InsertOutcome::Conflict,
        })
    }

    async fn upsert_airport(&mut self, entry: &AirportEntry) -> Result<InsertOutcome, StoreError> {
        let row = sqlx::query(insert_airport_sql())
            .bind(&entry.code)
            .bind(&entry.city)
            .bind(&entry.country)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(match row {
            Some(row) => InsertOutcome::Inserted(row.try_get("id")?),
            None => InsertOutcome::Conflict,
        })
    }

    async fn find_fact(
        &mut self,
        table: &FactTable,
        lookup: &[(&'static str, Value)],
    ) -> Result<Option<StoredFact>, StoreError> {
        let names = lookup.iter().map(|(c, _)| *c).collect::<Vec<_>>();
        let sql = select_fact_sql(table, &names);
        let mut query = sqlx::query(&sql);
        for (column, value) in lookup {
            query = bind_value(query, column_def(table, column)?, value)?;
        }
        let Some(row) = query.fetch_optional(&mut *self.tx).await? else {
            return Ok(None);
        };

        let mut columns = Columns::new();
        for def in &table.columns {
            columns.insert(def.name.to_string(), read_value(&row, def)?);
        }
        Ok(Some(StoredFact {
            id: row.try_get("id")?,
            columns,
        }))
    }

    async fn insert_fact(
        &mut self,
        table: &FactTable,
        columns: &Columns,
    ) -> Result<i64, StoreError> {
        let names = columns.keys().map(String::as_str).collect::<Vec<_>>();
        let sql = insert_fact_sql(table, &names);
        let mut query = sqlx::query(&sql);
        for (column, value) in columns {
            query = bind_value(query, column_def(table, column)?, value)?;
        }
        let row = query.fetch_one(&mut *self.tx).await?;
        Ok(row.try_get("id")?)
    }

    async fn patch_fact(
        &mut self,
        table: &FactTable,
        id: i64,
        diff: &FieldDiff,
    ) -> Result<(), StoreError> {
        if diff.is_empty() {
            return Ok(());
        }
        let names = diff.iter().map(|(c, _)| c).collect::<Vec<_>>();
        let sql = update_fact_sql(table, &names);
        let mut query = sqlx::query(&sql);
        for (column, value) in diff.iter() {
            query = bind_value(query, column_def(table, column)?, value)?;
        }
        let result = query.bind(id).execute(&mut *self.tx).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Invalid(format!("{} row {id} does not exist", table.name)));
        }
        Ok(())
    }

    async fn savepoint(&mut self) -> Result<(), StoreError> {
        sqlx::query(&format!("SAVEPOINT {ROW_SAVEPOINT}"))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn release_savepoint(&mut self) -> Result<(), StoreError> {
        sqlx::query(&format!("RELEASE SAVEPOINT {ROW_SAVEPOINT}"))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> Result<(), StoreError> {
        sqlx::query(&format!("ROLLBACK TO SAVEPOINT {ROW_SAVEPOINT}"))
            .execute(&mut *self.tx)
            .await?;
        self.release_savepoint().await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
