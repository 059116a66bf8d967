//! Raw cells to canonical values, per field kind.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use recon_core::{CanonicalRecord, FeedSpec, FieldKind, RawRow, RawValue, Value};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::debug;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

pub fn normalize_cell(kind: FieldKind, raw: Option<&RawValue>) -> Value {
    let Some(raw) = raw.filter(|r| !r.is_blank()) else {
        return Value::Absent;
    };
    match kind {
        FieldKind::Text => text(raw, false),
        FieldKind::Code => text(raw, true),
        FieldKind::Amount => decimal(raw)
            .map(|d| {
                let mut d = d.round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven);
                d.rescale(2);
                Value::Decimal(d)
            })
            .unwrap_or_default(),
        FieldKind::Rate => decimal(raw)
            .map(|d| Value::Decimal(d.round_dp(6).normalize()))
            .unwrap_or_default(),
        FieldKind::Date => date(raw).map(Value::Date).unwrap_or_default(),
        FieldKind::Integer => integer(raw).map(Value::Integer).unwrap_or_default(),
    }
}

fn render_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// `1234.0` and `1234.00` are spreadsheet renderings of an integer code.
fn strip_float_artifact(s: &str) -> &str {
    match s.split_once('.') {
        Some((int, frac))
            if !int.is_empty()
                && int.bytes().all(|b| b.is_ascii_digit())
                && !frac.is_empty()
                && frac.bytes().all(|b| b == b'0') =>
        {
            int
        }
        _ => s,
    }
}

fn text(raw: &RawValue, code: bool) -> Value {
    let rendered = match raw {
        RawValue::Text(s) => {
            let trimmed = s.trim();
            if code {
                strip_float_artifact(trimmed).to_string()
            } else {
                trimmed.to_string()
            }
        }
        RawValue::Number(n) => render_number(*n),
        RawValue::Bool(b) => b.to_string(),
        RawValue::Null => return Value::Absent,
    };
    if rendered.is_empty() {
        Value::Absent
    } else {
        Value::Text(rendered.to_uppercase())
    }
}

/// `1,200.50` to `1200.50`. Only groups of exactly three digits qualify, so a
/// decimal comma (`1,5`) is left as is and fails to parse.
fn strip_thousands(s: &str) -> Option<String> {
    let (int, frac) = match s.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (s, None),
    };
    let digits = int.strip_prefix('-').unwrap_or(int);
    let mut groups = digits.split(',');
    let head = groups.next()?;
    let all_digits = |g: &str| g.bytes().all(|b| b.is_ascii_digit());
    if head.is_empty() || head.len() > 3 || !all_digits(head) {
        return None;
    }
    let mut grouped = false;
    for group in groups {
        if group.len() != 3 || !all_digits(group) {
            return None;
        }
        grouped = true;
    }
    if !grouped {
        return None;
    }
    let mut plain = int.replace(',', "");
    if let Some(frac) = frac {
        plain.push('.');
        plain.push_str(frac);
    }
    Some(plain)
}

fn decimal(raw: &RawValue) -> Option<Decimal> {
    match raw {
        RawValue::Number(n) if n.is_finite() => Decimal::from_f64(*n),
        RawValue::Text(s) => {
            let s = s.trim();
            let parsed = s
                .parse::<Decimal>()
                .ok()
                .or_else(|| strip_thousands(s).and_then(|plain| plain.parse::<Decimal>().ok()))
                .or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .and_then(Decimal::from_f64)
                });
            if parsed.is_none() {
                debug!(cell = s, "unparseable number read as absent");
            }
            parsed
        }
        _ => None,
    }
}

/// Unparseable dates become absent, never an error.
fn date(raw: &RawValue) -> Option<NaiveDate> {
    let RawValue::Text(s) = raw else {
        return None;
    };
    let s = s.trim();
    DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
                .map(|ts| ts.date())
        })
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|ts| ts.date_naive()))
}

fn integer(raw: &RawValue) -> Option<i64> {
    let n = match raw {
        RawValue::Number(n) => *n,
        RawValue::Text(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Some(i);
            }
            s.parse::<f64>().ok()?
        }
        _ => return None,
    };
    (n.is_finite() && n.fract() == 0.0).then_some(n as i64)
}

pub fn normalize_row(spec: &FeedSpec, row: &RawRow) -> CanonicalRecord {
    let mut record = CanonicalRecord::new();
    for field in &spec.fields {
        record.insert(field.name, normalize_cell(field.kind, row.get(field.name)));
    }
    record
}

/// False when every tracked field is absent; such rows are dropped.
pub fn carries_information(spec: &FeedSpec, record: &CanonicalRecord) -> bool {
    spec.fields
        .iter()
        .filter(|f| f.tracked)
        .any(|f| !record.get(f.name).is_absent())
}
