//! Span and span-id types shared by every layer of the daemon.
//!
//! A span is immutable after ingestion. The JSON form uses single-letter
//! keys to keep wire payloads small, and all 128-bit ids travel as quoted
//! hex strings because JavaScript clients cannot hold 64-bit integers.

use crate::core::error::{HtracedError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Number of bytes in a span id.
pub const SPAN_ID_LEN: usize = 16;

/// 128-bit opaque span identifier.
///
/// Ordering is lexicographic over the big-endian bytes, which matches the
/// byte order used in every index key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SpanId([u8; SPAN_ID_LEN]);

impl SpanId {
    /// The reserved all-zero id. Never valid for a stored span.
    pub const INVALID: SpanId = SpanId([0u8; SPAN_ID_LEN]);

    pub const fn from_bytes(bytes: [u8; SPAN_ID_LEN]) -> Self {
        SpanId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SPAN_ID_LEN] {
        &self.0
    }

    /// Builds an id from the two 64-bit halves, high half first.
    pub fn from_parts(high: u64, low: u64) -> Self {
        let mut bytes = [0u8; SPAN_ID_LEN];
        bytes[..8].copy_from_slice(&high.to_be_bytes());
        bytes[8..].copy_from_slice(&low.to_be_bytes());
        SpanId(bytes)
    }

    pub fn is_invalid(&self) -> bool {
        *self == Self::INVALID
    }

    /// Returns id + 1 with carry, saturating at the all-ones id.
    pub fn next(&self) -> SpanId {
        let mut bytes = self.0;
        for byte in bytes.iter_mut().rev() {
            let (incremented, overflow) = byte.overflowing_add(1);
            *byte = incremented;
            if !overflow {
                return SpanId(bytes);
            }
        }
        // Wrapped past the maximum id; saturate instead.
        SpanId([0xff; SPAN_ID_LEN])
    }

    /// Parses exactly 32 lowercase or uppercase hex digits.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != SPAN_ID_LEN * 2 {
            return Err(HtracedError::bad_request(format!(
                "Invalid span id '{}': expected {} hex digits, got {}",
                s,
                SPAN_ID_LEN * 2,
                s.len()
            )));
        }
        let mut bytes = [0u8; SPAN_ID_LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| {
            HtracedError::bad_request(format!("Invalid span id '{}': {}", s, e))
        })?;
        Ok(SpanId(bytes))
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for SpanId {
    type Err = HtracedError;

    fn from_str(s: &str) -> Result<Self> {
        SpanId::parse(s)
    }
}

impl Serialize for SpanId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SpanId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SpanId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// One timestamped message on a span's timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimelineAnnotation {
    /// Millisecond timestamp.
    #[serde(rename = "t")]
    pub time_ms: i64,
    /// Free-form message.
    #[serde(rename = "m")]
    pub message: String,
}

/// One unit of traced work.
///
/// `begin_ms <= end_ms` is expected but not enforced; a span that violates
/// it is stored as-is and its duration clamps at zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Span {
    #[serde(rename = "s")]
    pub id: SpanId,

    /// Begin time in signed milliseconds.
    #[serde(rename = "b", default)]
    pub begin_ms: i64,

    /// End time in signed milliseconds.
    #[serde(rename = "e", default)]
    pub end_ms: i64,

    #[serde(rename = "d", default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Identifier of the originating process.
    #[serde(rename = "r", default, skip_serializing_if = "String::is_empty")]
    pub tracer_id: String,

    /// Parent span ids. Stored sorted with duplicates removed.
    #[serde(rename = "p", default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<SpanId>,

    /// Optional key/value annotations. Values are byte strings; the JSON
    /// form renders them as UTF-8 text.
    #[serde(
        rename = "n",
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        serialize_with = "serialize_info",
        deserialize_with = "deserialize_info"
    )]
    pub info: BTreeMap<String, Vec<u8>>,

    #[serde(rename = "t", default, skip_serializing_if = "Vec::is_empty")]
    pub timeline: Vec<TimelineAnnotation>,
}

fn serialize_info<S>(
    info: &BTreeMap<String, Vec<u8>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(info.len()))?;
    for (key, value) in info {
        map.serialize_entry(key, &String::from_utf8_lossy(value))?;
    }
    map.end()
}

fn deserialize_info<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    let map = BTreeMap::<String, String>::deserialize(deserializer)?;
    Ok(map.into_iter().map(|(k, v)| (k, v.into_bytes())).collect())
}

/// Recognized options for constructing a span.
///
/// Unset optional fields default to empty and are omitted from the JSON
/// rendering of the resulting span.
#[derive(Debug, Clone, Default)]
pub struct SpanOptions {
    pub id: SpanId,
    pub begin_ms: i64,
    pub end_ms: i64,
    pub description: String,
    pub tracer_id: String,
    pub parents: Vec<SpanId>,
    pub info: BTreeMap<String, Vec<u8>>,
    pub timeline: Vec<TimelineAnnotation>,
}

impl Span {
    /// Builds a normalized span from a set of options.
    pub fn from_options(opts: SpanOptions) -> Self {
        let mut span = Span {
            id: opts.id,
            begin_ms: opts.begin_ms,
            end_ms: opts.end_ms,
            description: opts.description,
            tracer_id: opts.tracer_id,
            parents: opts.parents,
            info: opts.info,
            timeline: opts.timeline,
        };
        span.normalize();
        span
    }

    /// Derived duration: `max(end - begin, 0)` with saturating arithmetic.
    pub fn duration_ms(&self) -> i64 {
        self.end_ms.saturating_sub(self.begin_ms).max(0)
    }

    /// Sorts and dedups the parent list.
    pub fn normalize(&mut self) {
        self.parents.sort_unstable();
        self.parents.dedup();
    }

    /// Serializes the span as JSON onto a writer.
    pub fn write_json<W: std::io::Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    /// Parses a span from its JSON form.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let mut span: Span = serde_json::from_slice(data)
            .map_err(|e| HtracedError::bad_request(format!("Invalid span JSON: {}", e)))?;
        span.normalize();
        Ok(span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_id(low: u64) -> SpanId {
        SpanId::from_parts(0, low)
    }

    #[test]
    fn test_span_id_formatting() {
        assert_eq!(
            SpanId::INVALID.to_string(),
            "00000000000000000000000000000000"
        );
        let id = SpanId::from_parts(0xdead_beef_0000_0001, 0x0000_0000_0000_00ff);
        let rendered = id.to_string();
        assert_eq!(rendered.len(), 32);
        assert_eq!(rendered, "deadbeef0000000100000000000000ff");
        assert_eq!(SpanId::parse(&rendered).unwrap(), id);
    }

    #[test]
    fn test_span_id_parse_rejects_garbage() {
        assert!(SpanId::parse("").is_err());
        assert!(SpanId::parse("abc").is_err());
        assert!(SpanId::parse("zz000000000000000000000000000000").is_err());
    }

    #[test]
    fn test_span_id_ordering() {
        let one = test_id(1);
        let two = test_id(2);
        assert!(one < two);
        assert!(SpanId::INVALID < one);
        let high = SpanId::from_parts(1, 0);
        assert!(two < high);
    }

    #[test]
    fn test_span_id_next_carries() {
        assert_eq!(SpanId::INVALID.next(), test_id(1));
        let boundary = SpanId::from_parts(0, u64::MAX);
        assert_eq!(boundary.next(), SpanId::from_parts(1, 0));
        let max = SpanId::from_bytes([0xff; SPAN_ID_LEN]);
        assert_eq!(max.next(), max);
    }

    #[test]
    fn test_duration_clamps_at_zero() {
        let span = Span::from_options(SpanOptions {
            id: test_id(1),
            begin_ms: 500,
            end_ms: 100,
            ..Default::default()
        });
        assert_eq!(span.duration_ms(), 0);
    }

    #[test]
    fn test_normalize_sorts_and_dedups_parents() {
        let span = Span::from_options(SpanOptions {
            id: test_id(9),
            parents: vec![test_id(3), test_id(1), test_id(3), test_id(2)],
            ..Default::default()
        });
        assert_eq!(span.parents, vec![test_id(1), test_id(2), test_id(3)]);
    }

    #[test]
    fn test_json_round_trip() {
        let mut info = BTreeMap::new();
        info.insert("host".to_string(), b"node-1".to_vec());
        let span = Span::from_options(SpanOptions {
            id: test_id(0x42),
            begin_ms: -1234,
            end_ms: i64::MAX,
            description: "getFileDescriptors".to_string(),
            tracer_id: "fs-worker".to_string(),
            parents: vec![test_id(2), test_id(1)],
            info,
            timeline: vec![TimelineAnnotation {
                time_ms: -7,
                message: "opened".to_string(),
            }],
        });

        let encoded = serde_json::to_vec(&span).unwrap();
        let decoded = Span::from_json(&encoded).unwrap();
        assert_eq!(decoded, span);
    }

    #[test]
    fn test_json_uses_single_letter_keys() {
        let span = Span::from_options(SpanOptions {
            id: test_id(1),
            begin_ms: 10,
            end_ms: 20,
            description: "x".to_string(),
            ..Default::default()
        });
        let value: serde_json::Value = serde_json::to_value(&span).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(
            obj.get("s").unwrap().as_str().unwrap(),
            "00000000000000000000000000000001"
        );
        assert_eq!(obj.get("b").unwrap().as_i64().unwrap(), 10);
        assert_eq!(obj.get("e").unwrap().as_i64().unwrap(), 20);
        assert_eq!(obj.get("d").unwrap().as_str().unwrap(), "x");
        // Empty optionals are omitted entirely.
        assert!(obj.get("p").is_none());
        assert!(obj.get("n").is_none());
        assert!(obj.get("t").is_none());
        assert!(obj.get("r").is_none());
    }
}
