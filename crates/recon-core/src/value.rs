//! Raw cell values as they arrive from a feed, and canonical values as the
//! engine compares and stores them.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One untyped cell from an extract or a remote page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum RawValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl RawValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// True for null, NaN and blank text. Type coercion happens later; this is
    /// only the "carries nothing" check.
    pub fn is_blank(&self) -> bool {
        match self {
            RawValue::Null => true,
            RawValue::Number(n) => n.is_nan(),
            RawValue::Text(s) => is_blank_text(s),
            RawValue::Bool(_) => false,
        }
    }
}

impl From<serde_json::Value> for RawValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => RawValue::Null,
            serde_json::Value::Bool(b) => RawValue::Bool(b),
            serde_json::Value::Number(n) => {
                n.as_f64().map(RawValue::Number).unwrap_or(RawValue::Null)
            }
            serde_json::Value::String(s) => RawValue::Text(s),
            other => RawValue::Text(other.to_string()),
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Number(value)
    }
}

/// Text markers spreadsheet exports use for "not a number" / "not a time".
pub fn is_blank_text(s: &str) -> bool {
    let trimmed = s.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") || trimmed.eq_ignore_ascii_case("nat")
}

/// A canonical value after normalization, or a value read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    #[default]
    Absent,
    Text(String),
    Decimal(Decimal),
    Float(f64),
    Integer(i64),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Value {
    /// Null, NaN and empty/whitespace-only text all mean "absent".
    pub fn is_absent(&self) -> bool {
        match self {
            Value::Absent => true,
            Value::Float(f) => f.is_nan(),
            Value::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Semantic equality used by the differ.
    ///
    /// Absent forms are one class. Temporal values compare by calendar day so a
    /// date and a timestamp on the same day are equal (and the relation stays
    /// transitive). Numbers compare by numeric value across representations.
    /// Everything else is exact equality of the normalized value.
    pub fn equivalent(&self, other: &Value) -> bool {
        match (self.is_absent(), other.is_absent()) {
            (true, true) => return true,
            (true, false) | (false, true) => return false,
            (false, false) => {}
        }

        if let (Some(a), Some(b)) = (self.calendar_day(), other.calendar_day()) {
            return a == b;
        }

        if let (Some(a), Some(b)) = (self.numeric(), other.numeric()) {
            return a == b;
        }

        match (self, other) {
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            _ => false,
        }
    }

    /// Numeric value in the decimal domain. Floats take their shortest
    /// decimal rendering, so `0.1` meets `Decimal` 0.1 and not the binary
    /// expansion of it.
    fn numeric(&self) -> Option<Decimal> {
        match self {
            Value::Decimal(d) => Some(*d),
            Value::Integer(i) => Some(Decimal::from(*i)),
            Value::Float(f) if f.is_finite() => Decimal::from_f64(*f),
            _ => None,
        }
    }

    pub fn calendar_day(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::Timestamp(ts) => Some(ts.date()),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) if !s.trim().is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Decimal(d) => Some(*d),
            Value::Integer(i) => Some(Decimal::from(*i)),
            Value::Float(f) if f.is_finite() => Decimal::from_f64_retain(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Decimal(d) if d.fract().is_zero() => d.to_i64(),
            Value::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// Stable rendering used inside content digests. Absent renders as `None`
    /// so that digests of partially filled rows stay distinguishable from
    /// rows that literally contain an empty string.
    pub fn digest_fragment(&self) -> String {
        if self.is_absent() {
            return "None".to_string();
        }
        match self {
            Value::Text(s) => s.clone(),
            Value::Decimal(d) => d.normalize().to_string(),
            Value::Float(f) => Decimal::from_f64_retain(*f)
                .map(|d| d.normalize().to_string())
                .unwrap_or_else(|| f.to_string()),
            Value::Integer(i) => i.to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Timestamp(ts) => ts.date().format("%Y-%m-%d").to_string(),
            Value::Absent => unreachable!("absent handled above"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Absent => Ok(()),
            Value::Text(s) => f.write_str(s),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Float(v) if v.is_nan() => Ok(()),
            Value::Float(v) => write!(f, "{v}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}
