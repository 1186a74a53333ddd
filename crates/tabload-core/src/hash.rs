//! Row fingerprinting for change detection.
//!
//! The merge into the target table updates a matched row only when its
//! fingerprint differs, so the fingerprint must be identical across runs,
//! hosts, byte orders, and locales. Canonicalisation: schema fields in
//! ascending lexicographic field-name order, rendered to their canonical
//! string form (`Null` as the empty string), joined with `|`, hashed with
//! xxh3-128 and serialised big-endian.

use xxhash_rust::xxh3::xxh3_128;

use crate::schema::RecordSchema;
use crate::value::Value;

/// Fingerprint a record's schema fields. `values` is in schema declaration
/// order; `hash_order` is the precomputed lexicographic index order from
/// [`RecordSchema::hash_order`].
pub fn row_fingerprint_ordered(values: &[Value], hash_order: &[usize]) -> [u8; 16] {
    let joined = hash_order
        .iter()
        .map(|&i| values[i].canonical_string())
        .collect::<Vec<_>>()
        .join("|");
    xxh3_128(joined.as_bytes()).to_be_bytes()
}

/// Convenience wrapper computing the field order on the fly.
pub fn row_fingerprint(schema: &RecordSchema, values: &[Value]) -> [u8; 16] {
    row_fingerprint_ordered(values, &schema.hash_order())
}
