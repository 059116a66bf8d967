//! Feed descriptors: which columns a feed reads, how each is canonicalized,
//! which ones reference dimension tables, and which identity rule decides
//! whether a row is a record the store has already seen.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Referenced entity kinds. Each maps onto one table with a unique business key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    Provider,
    Passenger,
    Account,
    Airport,
    /// Balance lines point at an existing reservation by its surrogate id.
    Reservation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvePolicy {
    /// Missing keys are created on first sight.
    GetOrCreate,
    /// Missing keys are an invalid reference and reject the row.
    LookupOnly,
}

impl DimensionKind {
    pub const ALL: [DimensionKind; 5] = [
        DimensionKind::Provider,
        DimensionKind::Passenger,
        DimensionKind::Account,
        DimensionKind::Airport,
        DimensionKind::Reservation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DimensionKind::Provider => "provider",
            DimensionKind::Passenger => "passenger",
            DimensionKind::Account => "account",
            DimensionKind::Airport => "airport",
            DimensionKind::Reservation => "reservation",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            DimensionKind::Provider => "providers",
            DimensionKind::Passenger => "passengers",
            DimensionKind::Account => "accounts",
            DimensionKind::Airport => "airports",
            DimensionKind::Reservation => "reservations",
        }
    }

    pub fn key_column(&self) -> &'static str {
        match self {
            DimensionKind::Provider | DimensionKind::Passenger => "name",
            DimensionKind::Account => "bank",
            DimensionKind::Airport => "code",
            DimensionKind::Reservation => "id",
        }
    }

    pub fn policy(&self) -> ResolvePolicy {
        match self {
            DimensionKind::Provider | DimensionKind::Passenger | DimensionKind::Account => {
                ResolvePolicy::GetOrCreate
            }
            DimensionKind::Airport | DimensionKind::Reservation => ResolvePolicy::LookupOnly,
        }
    }
}

impl std::fmt::Display for DimensionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a raw cell is canonicalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Trimmed, upper-cased text.
    Text,
    /// Identifier text; spreadsheet float artifacts (`1234.0`) collapse to `1234`.
    Code,
    /// Money: decimal with two fraction digits.
    Amount,
    /// Exchange rates and similar ratios: decimal with up to six fraction digits.
    Rate,
    Date,
    Integer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    /// Input column name and canonical field name.
    pub name: &'static str,
    /// Column in the fact table. Reference fields store the resolved id here.
    pub column: &'static str,
    pub kind: FieldKind,
    /// Diffed and patched on re-sight. Identity fields are never mutable.
    pub mutable: bool,
    /// Absent after normalization means the row's identity cannot be resolved.
    pub required: bool,
    /// Considered by the "row carries no information" check.
    pub tracked: bool,
    pub reference: Option<DimensionKind>,
}

impl FieldSpec {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            column: name,
            kind,
            mutable: false,
            required: false,
            tracked: true,
            reference: None,
        }
    }

    pub const fn mutable(mut self) -> Self {
        self.mutable = true;
        self
    }

    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub const fn untracked(mut self) -> Self {
        self.tracked = false;
        self
    }

    pub const fn references(mut self, kind: DimensionKind, column: &'static str) -> Self {
        self.reference = Some(kind);
        self.column = column;
        self
    }

    /// Storage type of the fact-table column.
    pub fn column_kind(&self) -> FieldKind {
        if self.reference.is_some() {
            FieldKind::Integer
        } else {
            self.kind
        }
    }
}

/// Exactly one identity rule is active per feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityRule {
    /// Match exclusively on one external identifier carried by the feed.
    ExplicitId(&'static str),
    /// Match on the conjunction of equality over these immutable fields.
    NaturalKey(Vec<&'static str>),
    /// Match on a digest of these fields (append-with-dedup feeds).
    ContentHash(Vec<&'static str>),
}

impl IdentityRule {
    pub fn fields(&self) -> Vec<&'static str> {
        match self {
            IdentityRule::ExplicitId(field) => vec![*field],
            IdentityRule::NaturalKey(fields) | IdentityRule::ContentHash(fields) => fields.clone(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            IdentityRule::ExplicitId(_) => "explicit_id",
            IdentityRule::NaturalKey(_) => "natural_key",
            IdentityRule::ContentHash(_) => "content_hash",
        }
    }
}

pub const DIGEST_COLUMN: &str = "content_digest";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedSpec {
    pub feed_id: &'static str,
    pub fact_table: &'static str,
    pub fields: Vec<FieldSpec>,
    pub identity: IdentityRule,
    /// Fields hashed into the stored content digest. Ignored for
    /// `ContentHash` feeds, whose identity fields are the digest fields.
    pub digest_fields: Vec<&'static str>,
    /// Fields echoed in audit entries so an operator can find the row.
    pub business_key: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid feed spec: {0}")]
pub struct FeedSpecError(pub String);

impl FeedSpec {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn digest_fields(&self) -> &[&'static str] {
        match &self.identity {
            IdentityRule::ContentHash(fields) => fields,
            _ => &self.digest_fields,
        }
    }

    pub fn stores_digest(&self) -> bool {
        !self.digest_fields().is_empty()
    }

    pub fn mutable_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.mutable)
    }

    /// Unique column enforced by the store, if the feed carries an explicit id.
    pub fn unique_column(&self) -> Option<&'static str> {
        match &self.identity {
            IdentityRule::ExplicitId(field) => self.field(field).map(|f| f.column),
            _ => None,
        }
    }

    pub fn table(&self) -> FactTable {
        let mut columns = self
            .fields
            .iter()
            .map(|f| ColumnDef {
                name: f.column,
                kind: f.column_kind(),
            })
            .collect::<Vec<_>>();
        if self.stores_digest() {
            columns.push(ColumnDef {
                name: DIGEST_COLUMN,
                kind: FieldKind::Text,
            });
        }
        FactTable {
            name: self.fact_table,
            columns,
            unique_column: self.unique_column(),
        }
    }

    /// Checks the invariants the engine relies on: identity fields exist and
    /// are immutable, and every digest/business-key field is declared.
    pub fn validate(&self) -> Result<(), FeedSpecError> {
        for name in self.identity.fields() {
            let field = self
                .field(name)
                .ok_or_else(|| {
                    FeedSpecError(format!(
                        "{}: identity field `{name}` not declared",
                        self.feed_id
                    ))
                })?;
            if field.mutable {
                return Err(FeedSpecError(format!(
                    "{}: identity field `{name}` cannot be mutable",
                    self.feed_id
                )));
            }
        }
        for name in self.digest_fields().iter().chain(self.business_key.iter()) {
            if self.field(name).is_none() {
                return Err(FeedSpecError(format!("{}: field `{name}` not declared", self.feed_id)));
            }
        }
        let mut columns = self.fields.iter().map(|f| f.column).collect::<Vec<_>>();
        columns.sort_unstable();
        columns.dedup();
        if columns.len() != self.fields.len() {
            return Err(FeedSpecError(format!("{}: duplicate fact columns", self.feed_id)));
        }
        Ok(())
    }

    pub fn builtin(feed_id: &str) -> Option<FeedSpec> {
        match feed_id {
            "bookings" => Some(Self::bookings()),
            "balances" => Some(Self::balances()),
            _ => None,
        }
    }

    /// Reservation lines from the booking system. No stable external id, so
    /// records are matched on their natural key; only status, amount and the
    /// supplier payment date change between extracts.
    pub fn bookings() -> FeedSpec {
        use DimensionKind::*;
        use FieldKind::*;

        let natural_key = vec![
            "file",
            "currency",
            "date_in",
            "date_out",
            "departure_date",
            "provider",
            "passenger",
            "airport_code",
        ];
        FeedSpec {
            feed_id: "bookings",
            fact_table: "reservations",
            fields: vec![
                FieldSpec::new("file", Code).required(),
                FieldSpec::new("status", Text).mutable(),
                FieldSpec::new("currency", Text),
                FieldSpec::new("amount", Amount).mutable(),
                FieldSpec::new("supplier_payment_date", Date).mutable(),
                FieldSpec::new("date_in", Date),
                FieldSpec::new("date_out", Date),
                FieldSpec::new("departure_date", Date),
                FieldSpec::new("provider", Text).references(Provider, "provider_id"),
                FieldSpec::new("passenger", Text).references(Passenger, "passenger_id"),
                FieldSpec::new("airport_code", Code).references(Airport, "airport_id"),
            ],
            digest_fields: natural_key.clone(),
            identity: IdentityRule::NaturalKey(natural_key),
            business_key: vec!["file", "provider", "passenger"],
        }
    }

    /// Balance lines from the payments spreadsheet, one per reservation.
    pub fn balances() -> FeedSpec {
        use DimensionKind::*;
        use FieldKind::*;

        FeedSpec {
            feed_id: "balances",
            fact_table: "balances",
            fields: vec![
                FieldSpec::new("transfer_code", Code).mutable(),
                FieldSpec::new("movement_type", Text).mutable(),
                FieldSpec::new("payment_date", Date).mutable(),
                FieldSpec::new("description", Text).mutable(),
                FieldSpec::new("payment_currency", Text).mutable(),
                FieldSpec::new("amount", Amount).mutable(),
                FieldSpec::new("exchange_rate", Rate).mutable(),
                FieldSpec::new("commission", Amount).mutable(),
                FieldSpec::new("tax", Amount).mutable(),
                FieldSpec::new("payment_status", Text).mutable(),
                FieldSpec::new("balance_type", Text).mutable(),
                FieldSpec::new("bank", Text).mutable().references(Account, "account_id"),
                FieldSpec::new("reservation_id", Integer)
                    .required()
                    .untracked()
                    .references(Reservation, "reservation_id"),
            ],
            identity: IdentityRule::ExplicitId("reservation_id"),
            digest_fields: Vec::new(),
            business_key: vec!["reservation_id", "bank"],
        }
    }
}

/// Storage-facing view of a feed's fact table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactTable {
    pub name: &'static str,
    pub columns: Vec<ColumnDef>,
    pub unique_column: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl FactTable {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_feeds_are_valid() {
        FeedSpec::bookings().validate().unwrap();
        FeedSpec::balances().validate().unwrap();
    }

    #[test]
    fn mutable_identity_field_is_rejected() {
        let mut spec = FeedSpec::bookings();
        spec.fields[0].mutable = true;
        let err = spec.validate().unwrap_err();
        assert!(err.0.contains("identity field `file`"));
    }

    #[test]
    fn fact_table_stores_reference_ids_and_digest() {
        let table = FeedSpec::bookings().table();
        assert_eq!(table.name, "reservations");
        assert_eq!(table.column("provider_id").unwrap().kind, FieldKind::Integer);
        assert!(table.column(DIGEST_COLUMN).is_some());
        assert_eq!(table.unique_column, None);

        let balances = FeedSpec::balances().table();
        assert!(balances.column(DIGEST_COLUMN).is_none());
        assert_eq!(balances.unique_column, Some("reservation_id"));
    }

    #[test]
    fn content_hash_feed_digests_its_identity_fields() {
        let spec = FeedSpec {
            feed_id: "ledger",
            fact_table: "ledger_lines",
            fields: vec![
                FieldSpec::new("memo", FieldKind::Text),
                FieldSpec::new("amount", FieldKind::Amount),
            ],
            identity: IdentityRule::ContentHash(vec!["memo", "amount"]),
            digest_fields: Vec::new(),
            business_key: vec!["memo"],
        };
        spec.validate().unwrap();
        assert_eq!(spec.digest_fields(), &["memo", "amount"]);
        assert!(spec.stores_digest());
    }

    #[test]
    fn lookup_only_dimensions() {
        assert_eq!(DimensionKind::Airport.policy(), ResolvePolicy::LookupOnly);
        assert_eq!(DimensionKind::Reservation.policy(), ResolvePolicy::LookupOnly);
        assert_eq!(DimensionKind::Provider.policy(), ResolvePolicy::GetOrCreate);
    }
}
