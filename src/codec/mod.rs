//! Binary span codec.
//!
//! The on-disk and RPC form of a span is a flat sequence of tagged fields:
//! `tag: u8`, `len: u32 LE`, then `len` payload bytes. Decoders skip tags
//! they do not recognize, so fields can be added without breaking old
//! readers.
//!
//! Tags:
//!
//! | tag | field       | payload |
//! |-----|-------------|---------|
//! | 1   | id          | 16 bytes |
//! | 2   | begin       | i64 big-endian |
//! | 3   | end         | i64 big-endian |
//! | 4   | description | UTF-8 bytes |
//! | 5   | tracer id   | UTF-8 bytes |
//! | 6   | parent      | 16 bytes, one field per parent |
//! | 7   | info entry  | u16 BE key length, key, value bytes |
//! | 8   | timeline    | i64 BE time, message bytes |

use crate::core::error::{HtracedError, Result};
use crate::core::span::{Span, SpanId, TimelineAnnotation, SPAN_ID_LEN};
use bytes::{Buf, BufMut, BytesMut};

const TAG_ID: u8 = 1;
const TAG_BEGIN: u8 = 2;
const TAG_END: u8 = 3;
const TAG_DESCRIPTION: u8 = 4;
const TAG_TRACER_ID: u8 = 5;
const TAG_PARENT: u8 = 6;
const TAG_INFO: u8 = 7;
const TAG_TIMELINE: u8 = 8;

/// Hard cap on a single encoded field, matching the RPC frame cap.
const MAX_FIELD_LEN: usize = 32 * 1024 * 1024;

fn put_field(buf: &mut BytesMut, tag: u8, payload: &[u8]) {
    buf.put_u8(tag);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
}

/// Encodes a span into its tagged binary form.
pub fn encode(span: &Span) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(64 + span.description.len());

    put_field(&mut buf, TAG_ID, span.id.as_bytes());
    put_field(&mut buf, TAG_BEGIN, &span.begin_ms.to_be_bytes());
    put_field(&mut buf, TAG_END, &span.end_ms.to_be_bytes());
    if !span.description.is_empty() {
        put_field(&mut buf, TAG_DESCRIPTION, span.description.as_bytes());
    }
    if !span.tracer_id.is_empty() {
        put_field(&mut buf, TAG_TRACER_ID, span.tracer_id.as_bytes());
    }
    for parent in &span.parents {
        put_field(&mut buf, TAG_PARENT, parent.as_bytes());
    }
    for (key, value) in &span.info {
        let mut entry = Vec::with_capacity(2 + key.len() + value.len());
        entry.extend_from_slice(&(key.len() as u16).to_be_bytes());
        entry.extend_from_slice(key.as_bytes());
        entry.extend_from_slice(value);
        put_field(&mut buf, TAG_INFO, &entry);
    }
    for annotation in &span.timeline {
        let mut entry = Vec::with_capacity(8 + annotation.message.len());
        entry.extend_from_slice(&annotation.time_ms.to_be_bytes());
        entry.extend_from_slice(annotation.message.as_bytes());
        put_field(&mut buf, TAG_TIMELINE, &entry);
    }

    buf.to_vec()
}

fn truncated(what: &str) -> HtracedError {
    HtracedError::bad_span(format!("Truncated span encoding: {}", what))
}

fn fixed_len(tag: u8, payload: &[u8], expected: usize) -> Result<()> {
    if payload.len() != expected {
        return Err(HtracedError::bad_span(format!(
            "Field tag {} expects {} bytes, got {}",
            tag,
            expected,
            payload.len()
        )));
    }
    Ok(())
}

fn span_id_from(payload: &[u8]) -> SpanId {
    let mut bytes = [0u8; SPAN_ID_LEN];
    bytes.copy_from_slice(payload);
    SpanId::from_bytes(bytes)
}

fn utf8_from(tag: u8, payload: &[u8]) -> Result<String> {
    String::from_utf8(payload.to_vec())
        .map_err(|_| HtracedError::bad_span(format!("Field tag {} is not valid UTF-8", tag)))
}

fn i64_from(payload: &[u8]) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(payload);
    i64::from_be_bytes(bytes)
}

/// Decodes a span from its tagged binary form.
pub fn decode(data: &[u8]) -> Result<Span> {
    let mut cursor = data;
    let mut id: Option<SpanId> = None;
    let mut span = Span {
        id: SpanId::INVALID,
        begin_ms: 0,
        end_ms: 0,
        description: String::new(),
        tracer_id: String::new(),
        parents: Vec::new(),
        info: Default::default(),
        timeline: Vec::new(),
    };

    while cursor.has_remaining() {
        if cursor.remaining() < 5 {
            return Err(truncated("field header"));
        }
        let tag = cursor.get_u8();
        let len = cursor.get_u32_le() as usize;
        if len > MAX_FIELD_LEN {
            return Err(HtracedError::bad_span(format!(
                "Field tag {} claims {} bytes",
                tag, len
            )));
        }
        if cursor.remaining() < len {
            return Err(truncated("field payload"));
        }
        let (payload, rest) = cursor.split_at(len);
        cursor = rest;

        match tag {
            TAG_ID => {
                fixed_len(tag, payload, SPAN_ID_LEN)?;
                id = Some(span_id_from(payload));
            },
            TAG_BEGIN => {
                fixed_len(tag, payload, 8)?;
                span.begin_ms = i64_from(payload);
            },
            TAG_END => {
                fixed_len(tag, payload, 8)?;
                span.end_ms = i64_from(payload);
            },
            TAG_DESCRIPTION => span.description = utf8_from(tag, payload)?,
            TAG_TRACER_ID => span.tracer_id = utf8_from(tag, payload)?,
            TAG_PARENT => {
                fixed_len(tag, payload, SPAN_ID_LEN)?;
                span.parents.push(span_id_from(payload));
            },
            TAG_INFO => {
                if payload.len() < 2 {
                    return Err(truncated("info entry"));
                }
                let key_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
                if payload.len() < 2 + key_len {
                    return Err(truncated("info key"));
                }
                let key = utf8_from(tag, &payload[2..2 + key_len])?;
                span.info.insert(key, payload[2 + key_len..].to_vec());
            },
            TAG_TIMELINE => {
                if payload.len() < 8 {
                    return Err(truncated("timeline entry"));
                }
                span.timeline.push(TimelineAnnotation {
                    time_ms: i64_from(&payload[..8]),
                    message: utf8_from(tag, &payload[8..])?,
                });
            },
            // Unknown field from a newer writer; length already skipped.
            _ => {},
        }
    }

    span.id = id.ok_or_else(|| HtracedError::bad_span("Span encoding has no id field"))?;
    span.normalize();
    Ok(span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::span::SpanOptions;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn sample_span() -> Span {
        let mut info = BTreeMap::new();
        info.insert("client".to_string(), b"dfs-17".to_vec());
        info.insert("raw".to_string(), vec![0u8, 0xff, 0x80]);
        Span::from_options(SpanOptions {
            id: SpanId::from_parts(0x0123_4567_89ab_cdef, 0xfedc_ba98_7654_3210),
            begin_ms: i64::MIN,
            end_ms: i64::MAX,
            description: "readBlock".to_string(),
            tracer_id: "datanode/10.0.0.2".to_string(),
            parents: vec![SpanId::from_parts(0, 2), SpanId::from_parts(0, 1)],
            info,
            timeline: vec![TimelineAnnotation {
                time_ms: -42,
                message: "retry".to_string(),
            }],
        })
    }

    #[test]
    fn test_round_trip() {
        let span = sample_span();
        let decoded = decode(&encode(&span)).unwrap();
        assert_eq!(decoded, span);
    }

    #[test]
    fn test_round_trip_minimal_span() {
        let span = Span::from_options(SpanOptions {
            id: SpanId::from_parts(0, 1),
            ..Default::default()
        });
        let encoded = encode(&span);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, span);
    }

    #[test]
    fn test_unknown_tags_are_skipped() {
        let span = sample_span();
        let mut encoded = encode(&span);
        // Append a field from a hypothetical future writer.
        encoded.push(250);
        encoded.extend_from_slice(&4u32.to_le_bytes());
        encoded.extend_from_slice(b"wxyz");
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, span);
    }

    #[test]
    fn test_missing_id_is_rejected() {
        let span = sample_span();
        let encoded = encode(&span);
        // Strip the leading id field (1 tag + 4 len + 16 payload bytes).
        let err = decode(&encoded[21..]).unwrap_err();
        assert_eq!(err.category(), "bad_span");
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let span = sample_span();
        let encoded = encode(&span);
        let err = decode(&encoded[..encoded.len() - 1]).unwrap_err();
        assert_eq!(err.category(), "bad_span");
    }

    #[test]
    fn test_decode_normalizes_parents() {
        let mut span = sample_span();
        span.parents = vec![
            SpanId::from_parts(0, 3),
            SpanId::from_parts(0, 1),
            SpanId::from_parts(0, 3),
        ];
        let decoded = decode(&encode(&span)).unwrap();
        assert_eq!(
            decoded.parents,
            vec![SpanId::from_parts(0, 1), SpanId::from_parts(0, 3)]
        );
    }
}
