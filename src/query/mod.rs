//! Predicate query types.
//!
//! A query is a conjunction of predicates plus a result limit and an
//! optional continuation span. The wire form is JSON:
//!
//! ```json
//! {"pred": [{"op": "ge", "field": "begin", "val": "125"}],
//!  "lim": 5,
//!  "prev": {"s": "...", "b": 123, "e": 456}}
//! ```
//!
//! `val` always travels as a string; it is parsed against the field's type
//! when the query is planned.

pub mod executor;

pub use executor::{QueryExecutor, QueryResult};

use crate::core::error::{HtracedError, Result};
use crate::core::span::{Span, SpanId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Span fields a predicate can test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field {
    #[serde(rename = "spanid")]
    SpanId,
    #[serde(rename = "begin")]
    Begin,
    #[serde(rename = "end")]
    End,
    #[serde(rename = "duration")]
    Duration,
    #[serde(rename = "description")]
    Description,
    #[serde(rename = "tracerid")]
    TracerId,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::SpanId => "spanid",
            Field::Begin => "begin",
            Field::End => "end",
            Field::Duration => "duration",
            Field::Description => "description",
            Field::TracerId => "tracerid",
        };
        f.write_str(name)
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    #[serde(rename = "eq")]
    Eq,
    #[serde(rename = "lt")]
    Lt,
    #[serde(rename = "le")]
    Le,
    #[serde(rename = "gt")]
    Gt,
    #[serde(rename = "ge")]
    Ge,
    /// Substring match; description only.
    #[serde(rename = "cn")]
    Contains,
}

impl Op {
    /// True for operators that drive a reverse index scan.
    pub fn is_descending(&self) -> bool {
        matches!(self, Op::Lt | Op::Le)
    }

    /// Applies the operator to an ordering outcome, `subject cmp value`.
    pub fn accepts(&self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Op::Eq => ordering == Equal,
            Op::Lt => ordering == Less,
            Op::Le => ordering != Greater,
            Op::Gt => ordering == Greater,
            Op::Ge => ordering != Less,
            Op::Contains => false,
        }
    }
}

/// One `field op value` test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Predicate {
    pub op: Op,
    pub field: Field,
    #[serde(rename = "val")]
    pub value: String,
}

/// A predicate query with pagination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Query {
    #[serde(rename = "pred", default, skip_serializing_if = "Vec::is_empty")]
    pub predicates: Vec<Predicate>,
    #[serde(rename = "lim", default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Continuation token: the last span of the previous page. The next
    /// page starts strictly after it in scan order.
    #[serde(rename = "prev", default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<Span>,
}

impl Query {
    /// Parses the JSON wire form. All failures are *bad-query*.
    pub fn parse(body: &str) -> Result<Query> {
        serde_json::from_str(body)
            .map_err(|e| HtracedError::bad_query(format!("Invalid query JSON: {}", e)))
    }
}

/// A predicate with its value parsed against the field type.
#[derive(Debug, Clone)]
pub(crate) struct CompiledPredicate {
    pub op: Op,
    pub field: Field,
    pub value: TypedValue,
}

/// Parsed predicate value.
#[derive(Debug, Clone)]
pub(crate) enum TypedValue {
    Id(SpanId),
    Time(i64),
    Text(String),
}

impl CompiledPredicate {
    pub fn compile(predicate: &Predicate) -> Result<CompiledPredicate> {
        if predicate.op == Op::Contains && predicate.field != Field::Description {
            return Err(HtracedError::bad_query(format!(
                "Operator cn only applies to description, not {}",
                predicate.field
            )));
        }
        let value = match predicate.field {
            Field::SpanId => TypedValue::Id(
                SpanId::parse(&predicate.value)
                    .map_err(|e| HtracedError::bad_query(e.to_string()))?,
            ),
            Field::Begin | Field::End | Field::Duration => {
                TypedValue::Time(predicate.value.parse().map_err(|_| {
                    HtracedError::bad_query(format!(
                        "Field {} needs an integer value, got '{}'",
                        predicate.field, predicate.value
                    ))
                })?)
            },
            Field::Description | Field::TracerId => TypedValue::Text(predicate.value.clone()),
        };
        Ok(CompiledPredicate {
            op: predicate.op,
            field: predicate.field,
            value,
        })
    }

    /// Evaluates the predicate against a fully decoded span.
    pub fn matches(&self, span: &Span) -> bool {
        match (&self.value, self.field) {
            (TypedValue::Id(id), Field::SpanId) => self.op.accepts(span.id.cmp(id)),
            (TypedValue::Time(t), Field::Begin) => self.op.accepts(span.begin_ms.cmp(t)),
            (TypedValue::Time(t), Field::End) => self.op.accepts(span.end_ms.cmp(t)),
            (TypedValue::Time(t), Field::Duration) => self.op.accepts(span.duration_ms().cmp(t)),
            (TypedValue::Text(text), Field::Description) => {
                if self.op == Op::Contains {
                    span.description.contains(text.as_str())
                } else {
                    self.op.accepts(span.description.as_str().cmp(text.as_str()))
                }
            },
            (TypedValue::Text(text), Field::TracerId) => {
                self.op.accepts(span.tracer_id.as_str().cmp(text.as_str()))
            },
            // compile() pairs values with fields; nothing else occurs.
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::span::SpanOptions;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_wire_form() {
        let query = Query::parse(
            r#"{"pred": [{"op": "ge", "field": "begin", "val": "125"}], "lim": 5}"#,
        )
        .unwrap();
        assert_eq!(query.limit, Some(5));
        assert_eq!(
            query.predicates,
            vec![Predicate {
                op: Op::Ge,
                field: Field::Begin,
                value: "125".to_string(),
            }]
        );
        assert!(query.prev.is_none());
    }

    #[test]
    fn test_parse_rejects_unknown_operator() {
        let err = Query::parse(r#"{"pred": [{"op": "like", "field": "begin", "val": "1"}]}"#)
            .unwrap_err();
        assert_eq!(err.category(), "bad_query");
    }

    #[test]
    fn test_compile_rejects_bad_values() {
        let bad_id = Predicate {
            op: Op::Eq,
            field: Field::SpanId,
            value: "xyz".to_string(),
        };
        assert_eq!(
            CompiledPredicate::compile(&bad_id).unwrap_err().category(),
            "bad_query"
        );

        let bad_time = Predicate {
            op: Op::Ge,
            field: Field::Begin,
            value: "noon".to_string(),
        };
        assert!(CompiledPredicate::compile(&bad_time).is_err());

        let contains_on_tracer = Predicate {
            op: Op::Contains,
            field: Field::TracerId,
            value: "x".to_string(),
        };
        assert!(CompiledPredicate::compile(&contains_on_tracer).is_err());
    }

    #[test]
    fn test_predicate_matching() {
        let span = Span::from_options(SpanOptions {
            id: SpanId::from_parts(0, 5),
            begin_ms: 100,
            end_ms: 250,
            description: "getFileDescriptors".to_string(),
            tracer_id: "fsclient".to_string(),
            ..Default::default()
        });

        let check = |op, field, value: &str| {
            CompiledPredicate::compile(&Predicate {
                op,
                field,
                value: value.to_string(),
            })
            .unwrap()
            .matches(&span)
        };

        assert!(check(Op::Ge, Field::Begin, "100"));
        assert!(!check(Op::Gt, Field::Begin, "100"));
        assert!(check(Op::Le, Field::End, "250"));
        assert!(check(Op::Eq, Field::Duration, "150"));
        assert!(check(Op::Eq, Field::Description, "getFileDescriptors"));
        assert!(check(Op::Contains, Field::Description, "FileDesc"));
        assert!(!check(Op::Contains, Field::Description, "filedesc"));
        assert!(check(Op::Lt, Field::SpanId, "00000000000000000000000000000006"));
    }
}
