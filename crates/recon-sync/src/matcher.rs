//! Identity matching and field-level diffing against stored facts.

use std::collections::BTreeMap;

use recon_core::{
    CanonicalRecord, Columns, FactTable, FeedSpec, FieldDiff, IdentityRule, StoredFact, Value,
    DIGEST_COLUMN,
};
use recon_storage::{StoreError, UnitOfWork};

use crate::fingerprint::content_digest;

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Insert { columns: Columns },
    Patch {
        id: i64,
        diff: FieldDiff,
        changed_fields: Vec<&'static str>,
    },
    Unchanged { id: i64 },
}

/// Fact-table columns for a canonical record: plain fields copied, reference
/// fields replaced by their resolved id, plus the digest when the feed
/// stores one.
pub fn fact_columns(
    spec: &FeedSpec,
    record: &CanonicalRecord,
    references: &BTreeMap<&'static str, Option<i64>>,
) -> Columns {
    let mut columns = Columns::new();
    for field in &spec.fields {
        let value = match field.reference {
            Some(_) => references
                .get(field.name)
                .copied()
                .flatten()
                .map(Value::Integer)
                .unwrap_or_default(),
            None => record.get(field.name).clone(),
        };
        columns.insert(field.column.to_string(), value);
    }
    if spec.stores_digest() {
        columns.insert(
            DIGEST_COLUMN.to_string(),
            Value::Text(content_digest(record, spec.digest_fields())),
        );
    }
    columns
}

fn column_of(spec: &FeedSpec, field: &str) -> &'static str {
    spec.field(field).map(|f| f.column).unwrap_or(DIGEST_COLUMN)
}

/// Equality predicates for the feed's identity rule. `None` when an explicit
/// id is absent, since such a row cannot be matched at all.
pub fn identity_lookup(spec: &FeedSpec, columns: &Columns) -> Option<Vec<(&'static str, Value)>> {
    let value_of = |column: &str| columns.get(column).cloned().unwrap_or_default();
    match &spec.identity {
        IdentityRule::ExplicitId(field) => {
            let column = column_of(spec, field);
            let value = value_of(column);
            (!value.is_absent()).then(|| vec![(column, value)])
        }
        IdentityRule::NaturalKey(fields) => {
            let mut lookup = fields
                .iter()
                .map(|f| {
                    let column = column_of(spec, f);
                    (column, value_of(column))
                })
                .collect::<Vec<_>>();
            if spec.stores_digest() {
                lookup.push((DIGEST_COLUMN, value_of(DIGEST_COLUMN)));
            }
            Some(lookup)
        }
        IdentityRule::ContentHash(_) => Some(vec![(DIGEST_COLUMN, value_of(DIGEST_COLUMN))]),
    }
}

/// Mutable fields whose stored and incoming values are not equivalent.
pub fn diff_mutable(
    spec: &FeedSpec,
    stored: &StoredFact,
    columns: &Columns,
) -> (FieldDiff, Vec<&'static str>) {
    let mut diff = FieldDiff::new();
    let mut changed = Vec::new();
    for field in spec.mutable_fields() {
        let incoming = columns.get(field.column).cloned().unwrap_or_default();
        if !stored.get(field.column).equivalent(&incoming) {
            diff.record(field.column, incoming);
            changed.push(field.name);
        }
    }
    (diff, changed)
}

pub async fn decide(
    uow: &mut dyn UnitOfWork,
    spec: &FeedSpec,
    table: &FactTable,
    columns: Columns,
) -> Result<Decision, StoreError> {
    let lookup = identity_lookup(spec, &columns).ok_or_else(|| {
        StoreError::Invalid(format!("{}: identity value is absent", spec.feed_id))
    })?;
    let Some(stored) = uow.find_fact(table, &lookup).await? else {
        return Ok(Decision::Insert { columns });
    };

    let (diff, changed_fields) = diff_mutable(spec, &stored, &columns);
    if diff.is_empty() {
        Ok(Decision::Unchanged { id: stored.id })
    } else {
        Ok(Decision::Patch {
            id: stored.id,
            diff,
            changed_fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use recon_core::{FieldKind, FieldSpec};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn booking() -> CanonicalRecord {
        let mut r = CanonicalRecord::new();
        r.insert("file", Value::Text("AB1234".into()));
        r.insert("currency", Value::Text("USD".into()));
        r.insert("amount", Value::Decimal(Decimal::from_str("100.00").unwrap()));
        r.insert("status", Value::Absent);
        r
    }

    fn refs(provider: Option<i64>) -> BTreeMap<&'static str, Option<i64>> {
        BTreeMap::from([("provider", provider), ("passenger", Some(2)), ("airport_code", Some(3))])
    }

    #[test]
    fn columns_carry_reference_ids_and_digest() {
        let spec = FeedSpec::bookings();
        let columns = fact_columns(&spec, &booking(), &refs(Some(1)));
        assert_eq!(columns["provider_id"], Value::Integer(1));
        assert!(!columns.contains_key("provider"));
        assert!(matches!(&columns[DIGEST_COLUMN], Value::Text(d) if d.len() == 64));

        let without = fact_columns(&spec, &booking(), &refs(None));
        assert_eq!(without["provider_id"], Value::Absent);
    }

    #[test]
    fn natural_key_lookup_uses_immutable_columns_and_digest() {
        let spec = FeedSpec::bookings();
        let columns = fact_columns(&spec, &booking(), &refs(Some(1)));
        let lookup = identity_lookup(&spec, &columns).unwrap();
        let names = lookup.iter().map(|(c, _)| *c).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "file",
                "currency",
                "date_in",
                "date_out",
                "departure_date",
                "provider_id",
                "passenger_id",
                "airport_id",
                DIGEST_COLUMN
            ]
        );
        assert!(!names.contains(&"amount"));
    }

    #[test]
    fn explicit_id_lookup_ignores_everything_else() {
        let spec = FeedSpec::balances();
        let mut columns = Columns::new();
        columns.insert("reservation_id".into(), Value::Integer(7));
        columns.insert("amount".into(), Value::Integer(5));
        assert_eq!(
            identity_lookup(&spec, &columns),
            Some(vec![("reservation_id", Value::Integer(7))])
        );
        columns.insert("reservation_id".into(), Value::Absent);
        assert_eq!(identity_lookup(&spec, &columns), None);
    }

    #[test]
    fn content_hash_lookup_is_digest_only() {
        let spec = FeedSpec {
            feed_id: "ledger",
            fact_table: "ledger_lines",
            fields: vec![FieldSpec::new("memo", FieldKind::Text)],
            identity: IdentityRule::ContentHash(vec!["memo"]),
            digest_fields: Vec::new(),
            business_key: vec!["memo"],
        };
        let mut record = CanonicalRecord::new();
        record.insert("memo", Value::Text("RENT".into()));
        let columns = fact_columns(&spec, &record, &BTreeMap::new());
        let lookup = identity_lookup(&spec, &columns).unwrap();
        assert_eq!(lookup.len(), 1);
        assert_eq!(lookup[0].0, DIGEST_COLUMN);
    }

    #[test]
    fn diff_uses_value_equivalence() {
        let spec = FeedSpec::bookings();
        let day = NaiveDate::from_ymd_opt(2026, 4, 1).unwrap();
        let mut stored = Columns::new();
        stored.insert("status".into(), Value::Text(String::new()));
        stored.insert("amount".into(), Value::Decimal(Decimal::from_str("100").unwrap()));
        stored.insert(
            "supplier_payment_date".into(),
            Value::Timestamp(day.and_hms_opt(13, 0, 0).unwrap()),
        );
        let stored = StoredFact { id: 9, columns: stored };

        let mut incoming = Columns::new();
        incoming.insert("status".into(), Value::Absent);
        incoming.insert("amount".into(), Value::Decimal(Decimal::from_str("100.00").unwrap()));
        incoming.insert("supplier_payment_date".into(), Value::Date(day));
        let (diff, changed) = diff_mutable(&spec, &stored, &incoming);
        assert!(diff.is_empty());
        assert!(changed.is_empty());

        incoming.insert("amount".into(), Value::Decimal(Decimal::from_str("150.00").unwrap()));
        let (diff, changed) = diff_mutable(&spec, &stored, &incoming);
        assert_eq!(changed, vec!["amount"]);
        assert_eq!(diff.changed_columns(), vec!["amount".to_string()]);
    }

    #[test]
    fn diff_reports_field_names_for_reference_columns() {
        let spec = FeedSpec::balances();
        let mut stored = Columns::new();
        stored.insert("account_id".into(), Value::Integer(1));
        let stored = StoredFact { id: 1, columns: stored };
        let mut incoming = Columns::new();
        incoming.insert("account_id".into(), Value::Integer(2));
        let (diff, changed) = diff_mutable(&spec, &stored, &incoming);
        assert_eq!(changed, vec!["bank"]);
        assert_eq!(diff.changed_columns(), vec!["account_id".to_string()]);
    }
}
