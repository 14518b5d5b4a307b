//! Index key construction and parsing.
//!
//! Every key in a shard store starts with a one-byte family prefix. The
//! primary family maps span id to span bytes; the secondary families hold
//! empty values and exist only for their ordering:
//!
//! | prefix | key layout                  | ordered by |
//! |--------|-----------------------------|------------|
//! | `P`    | span-id                     | span id |
//! | `C`    | parent-id, child-id         | parent then child |
//! | `B`    | begin-ms, span-id           | begin time |
//! | `E`    | end-ms, span-id             | end time |
//! | `D`    | duration-ms, span-id        | duration |
//! | `S`    | description, span-id        | description |
//! | `T`    | tracer-id, span-id          | tracer id |
//!
//! Integers are big-endian with the sign bit flipped, so lexicographic
//! order over key bytes equals numeric order across negative values.

use crate::codec;
use crate::core::span::{Span, SpanId, SPAN_ID_LEN};

pub const PREFIX_PRIMARY: u8 = b'P';
pub const PREFIX_CHILD: u8 = b'C';
pub const PREFIX_BEGIN: u8 = b'B';
pub const PREFIX_END: u8 = b'E';
pub const PREFIX_DURATION: u8 = b'D';
pub const PREFIX_DESCRIPTION: u8 = b'S';
pub const PREFIX_TRACER_ID: u8 = b'T';

/// Encodes a signed millisecond value so byte order matches numeric order.
pub fn encode_i64_key(value: i64) -> [u8; 8] {
    ((value ^ i64::MIN) as u64).to_be_bytes()
}

/// Inverse of [`encode_i64_key`].
pub fn decode_i64_key(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) as i64) ^ i64::MIN
}

pub fn primary_key(id: &SpanId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + SPAN_ID_LEN);
    key.push(PREFIX_PRIMARY);
    key.extend_from_slice(id.as_bytes());
    key
}

pub fn child_key(parent: &SpanId, child: &SpanId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 2 * SPAN_ID_LEN);
    key.push(PREFIX_CHILD);
    key.extend_from_slice(parent.as_bytes());
    key.extend_from_slice(child.as_bytes());
    key
}

/// Prefix selecting every child entry of one parent.
pub fn child_scan_prefix(parent: &SpanId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + SPAN_ID_LEN);
    key.push(PREFIX_CHILD);
    key.extend_from_slice(parent.as_bytes());
    key
}

fn numeric_key(prefix: u8, value: i64, id: &SpanId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 8 + SPAN_ID_LEN);
    key.push(prefix);
    key.extend_from_slice(&encode_i64_key(value));
    key.extend_from_slice(id.as_bytes());
    key
}

fn string_key(prefix: u8, value: &str, id: &SpanId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + value.len() + SPAN_ID_LEN);
    key.push(prefix);
    key.extend_from_slice(value.as_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

pub fn begin_key(span: &Span) -> Vec<u8> {
    numeric_key(PREFIX_BEGIN, span.begin_ms, &span.id)
}

pub fn end_key(span: &Span) -> Vec<u8> {
    numeric_key(PREFIX_END, span.end_ms, &span.id)
}

pub fn duration_key(span: &Span) -> Vec<u8> {
    numeric_key(PREFIX_DURATION, span.duration_ms(), &span.id)
}

pub fn description_key(span: &Span) -> Vec<u8> {
    string_key(PREFIX_DESCRIPTION, &span.description, &span.id)
}

pub fn tracer_id_key(span: &Span) -> Vec<u8> {
    string_key(PREFIX_TRACER_ID, &span.tracer_id, &span.id)
}

/// Start of a secondary-index scan at `value`, before any span id.
pub fn numeric_scan_start(prefix: u8, value: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 8);
    key.push(prefix);
    key.extend_from_slice(&encode_i64_key(value));
    key
}

pub fn string_scan_start(prefix: u8, value: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + value.len());
    key.push(prefix);
    key.extend_from_slice(value.as_bytes());
    key
}

/// Every key/value pair a span contributes to its shard: the primary
/// record, one child edge per parent, and one entry per secondary index.
pub fn span_entries(span: &Span) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut entries = Vec::with_capacity(6 + span.parents.len());
    entries.push((primary_key(&span.id), codec::encode(span)));
    for parent in &span.parents {
        entries.push((child_key(parent, &span.id), Vec::new()));
    }
    entries.push((begin_key(span), Vec::new()));
    entries.push((end_key(span), Vec::new()));
    entries.push((duration_key(span), Vec::new()));
    entries.push((description_key(span), Vec::new()));
    entries.push((tracer_id_key(span), Vec::new()));
    entries
}

/// Splits a secondary-index key into its family, sort key, and span id.
/// Returns `None` for keys too short to carry a span id.
pub fn parse_secondary_key(key: &[u8]) -> Option<(u8, &[u8], SpanId)> {
    if key.len() < 1 + SPAN_ID_LEN {
        return None;
    }
    let (rest, id_bytes) = key.split_at(key.len() - SPAN_ID_LEN);
    let mut id = [0u8; SPAN_ID_LEN];
    id.copy_from_slice(id_bytes);
    Some((rest[0], &rest[1..], SpanId::from_bytes(id)))
}
