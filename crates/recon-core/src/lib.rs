//! Core domain model for the booking/balance reconciler: raw and canonical
//! values, feed descriptors and the record shapes passed between stages.

pub mod feed;
pub mod record;
pub mod value;

pub use feed::{
    ColumnDef, DimensionKind, FactTable, FeedSpec, FeedSpecError, FieldKind, FieldSpec,
    IdentityRule, ResolvePolicy, DIGEST_COLUMN,
};
pub use record::{CanonicalRecord, Columns, FieldDiff, RawRow, StoredFact};
pub use value::{is_blank_text, RawValue, Value};

pub const CRATE_NAME: &str = "recon-core";
