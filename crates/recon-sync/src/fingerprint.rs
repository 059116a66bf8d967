//! Content digests and in-batch exact-duplicate detection.

use std::collections::HashMap;

use recon_core::{CanonicalRecord, FeedSpec};
use sha2::{Digest, Sha256};

/// sha256 over the `|`-joined digest fragments of `fields`, in order.
pub fn content_digest(record: &CanonicalRecord, fields: &[&'static str]) -> String {
    let joined = fields
        .iter()
        .map(|f| record.get(f).digest_fragment())
        .collect::<Vec<_>>()
        .join("|");
    hex::encode(Sha256::digest(joined.as_bytes()))
}

/// Digest over every declared field, used for in-batch exact-duplicate
/// detection.
pub fn full_row_digest(spec: &FeedSpec, record: &CanonicalRecord) -> String {
    let fields = spec.fields.iter().map(|f| f.name).collect::<Vec<_>>();
    content_digest(record, &fields)
}

/// Splits `items` into first occurrences and later exact duplicates. Each
/// duplicate carries the index of the item it repeats.
pub fn split_exact_duplicates<T>(
    spec: &FeedSpec,
    items: Vec<T>,
    record: impl Fn(&T) -> &CanonicalRecord,
) -> (Vec<T>, Vec<(T, usize)>) {
    let mut first_seen: HashMap<String, usize> = HashMap::new();
    let mut kept = Vec::with_capacity(items.len());
    let mut duplicates = Vec::new();

    for (index, item) in items.into_iter().enumerate() {
        let digest = full_row_digest(spec, record(&item));
        match first_seen.get(&digest) {
            Some(first) => duplicates.push((item, *first)),
            None => {
                first_seen.insert(digest, index);
                kept.push(item);
            }
        }
    }
    (kept, duplicates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::Value;

    fn record(pairs: &[(&'static str, Value)]) -> CanonicalRecord {
        let mut r = CanonicalRecord::new();
        for (k, v) in pairs {
            r.insert(*k, v.clone());
        }
        r
    }

    #[test]
    fn digest_is_order_sensitive_and_stable() {
        let r = record(&[
            ("file", Value::Text("AB1".into())),
            ("currency", Value::Text("USD".into())),
        ]);
        let a = content_digest(&r, &["file", "currency"]);
        let b = content_digest(&r, &["currency", "file"]);
        assert_ne!(a, b);
        assert_eq!(a, content_digest(&r.clone(), &["file", "currency"]));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn digest_matches_pipe_joined_sha256() {
        let r = record(&[("file", Value::Text("AB1".into()))]);
        let expected = hex::encode(Sha256::digest(b"AB1|None"));
        assert_eq!(content_digest(&r, &["file", "currency"]), expected);
    }

    #[test]
    fn first_occurrence_wins() {
        let spec = FeedSpec::bookings();
        let a = record(&[("file", Value::Text("AB1".into()))]);
        let b = record(&[("file", Value::Text("AB2".into()))]);
        let items = vec![(1, a.clone()), (2, b), (3, a.clone()), (4, a)];
        let (kept, dups) = split_exact_duplicates(&spec, items, |(_, r)| r);
        assert_eq!(kept.iter().map(|(n, _)| *n).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(
            dups.iter().map(|((n, _), first)| (*n, *first)).collect::<Vec<_>>(),
            vec![(3, 0), (4, 0)]
        );
    }
}
