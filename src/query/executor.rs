//! Query planning and execution.
//!
//! Each query is planned once: one predicate is chosen to drive an index
//! scan and the rest become post-filters. The plan then runs against every
//! shard in parallel, and a heap merge yields spans in global scan order
//! until the limit is reached. Ties on the sort key break by span id, which
//! is what makes continuation tokens exact.

use crate::codec;
use crate::core::error::{HtracedError, Result};
use crate::core::span::{Span, SpanId, SPAN_ID_LEN};
use crate::query::{CompiledPredicate, Field, Op, Query, TypedValue};
use crate::storage::keys;
use crate::storage::shard::ShardStore;
use crate::storage::store::DataStore;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Hard cap on any single query's result size.
pub const MAX_QUERY_LIMIT: usize = 10_000;

/// Query outcome: spans in scan order plus how many candidate spans each
/// shard examined (which drives pagination accounting).
#[derive(Debug)]
pub struct QueryResult {
    pub spans: Vec<Span>,
    pub scanned_per_shard: Vec<u64>,
}

/// Executes parsed queries against a data store.
pub struct QueryExecutor {
    store: Arc<DataStore>,
    default_limit: usize,
}

/// The per-shard scan recipe produced by planning.
#[derive(Debug, Clone)]
struct ScanPlan {
    family: u8,
    reverse: bool,
    /// Encoded driving value; empty for the fallback full scan.
    driving: Option<DrivingBound>,
    start_key: Vec<u8>,
    /// Continuation cut: in reverse scans, keys at or above this are
    /// skipped. Forward scans bake the cut into `start_key`.
    prev_key: Option<Vec<u8>>,
    /// Set for `eq spanid`, which is a single primary fetch.
    point: Option<SpanId>,
}

#[derive(Debug, Clone)]
struct DrivingBound {
    op: Op,
    value_key: Vec<u8>,
}

/// Verdict on one index key, decided before fetching the span.
enum KeyVerdict {
    Match,
    Skip,
    Stop,
}

impl QueryExecutor {
    pub fn new(store: Arc<DataStore>, default_limit: usize) -> Self {
        QueryExecutor {
            store,
            default_limit,
        }
    }

    /// Plans and runs one query. Shard failures fail the whole query; no
    /// partial results are returned.
    pub async fn execute(&self, query: &Query) -> Result<QueryResult> {
        let compiled = query
            .predicates
            .iter()
            .map(CompiledPredicate::compile)
            .collect::<Result<Vec<_>>>()?;

        let limit = query
            .limit
            .unwrap_or(self.default_limit)
            .min(MAX_QUERY_LIMIT);
        let total_shards = self.store.total_shards() as usize;
        if limit == 0 {
            return Ok(QueryResult {
                spans: Vec::new(),
                scanned_per_shard: vec![0; total_shards],
            });
        }

        let (plan, filters) = plan_query(&compiled, query.prev.as_ref());
        tracing::debug!(
            family = %(plan.family as char),
            reverse = plan.reverse,
            filters = filters.len(),
            "Executing query"
        );

        let mut handles = Vec::with_capacity(total_shards);
        for shard in 0..total_shards {
            let reader = self.store.reader(shard);
            let plan = plan.clone();
            let filters = filters.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                run_shard_scan(&reader, &plan, &filters, limit)
            }));
        }

        let mut shard_results = Vec::with_capacity(total_shards);
        let mut scanned_per_shard = Vec::with_capacity(total_shards);
        for joined in futures::future::join_all(handles).await {
            let (entries, scanned) =
                joined.map_err(|_| HtracedError::storage("Shard scan task panicked"))??;
            shard_results.push(entries);
            scanned_per_shard.push(scanned);
        }

        let spans = merge_shard_results(shard_results, plan.reverse, limit);
        Ok(QueryResult {
            spans,
            scanned_per_shard,
        })
    }
}

/// Index preference of a predicate: lower ranks drive the scan. `None`
/// means the predicate can only filter.
fn index_rank(predicate: &CompiledPredicate) -> Option<u8> {
    if predicate.op == Op::Contains {
        return None;
    }
    match predicate.field {
        Field::SpanId if predicate.op == Op::Eq => Some(0),
        Field::SpanId => Some(1),
        Field::Begin | Field::End | Field::Duration => Some(2),
        Field::Description | Field::TracerId => Some(3),
    }
}

fn family_for_field(field: Field) -> u8 {
    match field {
        Field::SpanId => keys::PREFIX_PRIMARY,
        Field::Begin => keys::PREFIX_BEGIN,
        Field::End => keys::PREFIX_END,
        Field::Duration => keys::PREFIX_DURATION,
        Field::Description => keys::PREFIX_DESCRIPTION,
        Field::TracerId => keys::PREFIX_TRACER_ID,
    }
}

fn encoded_value(value: &TypedValue) -> Vec<u8> {
    match value {
        TypedValue::Id(id) => id.as_bytes().to_vec(),
        TypedValue::Time(t) => keys::encode_i64_key(*t).to_vec(),
        TypedValue::Text(text) => text.as_bytes().to_vec(),
    }
}

/// Sort key the given span carries in the given family.
fn sort_key_for(span: &Span, family: u8) -> Vec<u8> {
    match family {
        keys::PREFIX_PRIMARY => span.id.as_bytes().to_vec(),
        keys::PREFIX_BEGIN => keys::encode_i64_key(span.begin_ms).to_vec(),
        keys::PREFIX_END => keys::encode_i64_key(span.end_ms).to_vec(),
        keys::PREFIX_DURATION => keys::encode_i64_key(span.duration_ms()).to_vec(),
        keys::PREFIX_DESCRIPTION => span.description.as_bytes().to_vec(),
        keys::PREFIX_TRACER_ID => span.tracer_id.as_bytes().to_vec(),
        _ => Vec::new(),
    }
}

/// Full index key a span occupies in the given family.
fn index_key_for(span: &Span, family: u8) -> Vec<u8> {
    let sort_key = sort_key_for(span, family);
    let mut key = Vec::with_capacity(1 + sort_key.len() + SPAN_ID_LEN);
    key.push(family);
    key.extend_from_slice(&sort_key);
    if family != keys::PREFIX_PRIMARY {
        key.extend_from_slice(span.id.as_bytes());
    }
    key
}

fn plan_query(
    compiled: &[CompiledPredicate],
    prev: Option<&Span>,
) -> (ScanPlan, Vec<CompiledPredicate>) {
    let driving_position = compiled
        .iter()
        .enumerate()
        .filter_map(|(position, p)| index_rank(p).map(|rank| (rank, position)))
        .min()
        .map(|(_, position)| position);

    let mut filters: Vec<CompiledPredicate> = Vec::new();
    for (position, predicate) in compiled.iter().enumerate() {
        if Some(position) != driving_position {
            filters.push(predicate.clone());
        }
    }

    let plan = match driving_position.map(|p| &compiled[p]) {
        None => {
            // No indexable predicate: walk the begin-time index forward.
            let family = keys::PREFIX_BEGIN;
            let mut start_key = vec![family];
            if let Some(prev) = prev {
                start_key = forward_start_after(&index_key_for(prev, family));
            }
            ScanPlan {
                family,
                reverse: false,
                driving: None,
                start_key,
                prev_key: None,
                point: None,
            }
        },
        Some(driving) => {
            let family = family_for_field(driving.field);
            let reverse = driving.op.is_descending();
            let value_key = encoded_value(&driving.value);
            let prev_key = prev.map(|p| index_key_for(p, family));

            if driving.field == Field::SpanId && driving.op == Op::Eq {
                let id = match &driving.value {
                    TypedValue::Id(id) => *id,
                    _ => SpanId::INVALID,
                };
                ScanPlan {
                    family,
                    reverse: false,
                    driving: None,
                    start_key: Vec::new(),
                    prev_key,
                    point: Some(id),
                }
            } else {
                let mut start_key = if reverse {
                    reverse_start_key(family, &driving.value, &value_key)
                } else {
                    let mut key = Vec::with_capacity(1 + value_key.len());
                    key.push(family);
                    key.extend_from_slice(&value_key);
                    key
                };
                if let Some(prev_key) = &prev_key {
                    if reverse {
                        start_key = start_key.min(prev_key.clone());
                    } else {
                        start_key = start_key.max(forward_start_after(prev_key));
                    }
                }
                ScanPlan {
                    family,
                    reverse,
                    driving: Some(DrivingBound {
                        op: driving.op,
                        value_key,
                    }),
                    start_key,
                    prev_key: if reverse { prev_key } else { None },
                    point: None,
                }
            }
        },
    };
    (plan, filters)
}

/// Smallest key strictly greater than `key`.
fn forward_start_after(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0);
    next
}

/// Seek target for a reverse scan bounded above by the driving value.
fn reverse_start_key(family: u8, value: &TypedValue, value_key: &[u8]) -> Vec<u8> {
    match value {
        // Text sort keys are variable-length, so a shorter description can
        // sort above the bound key; reverse text scans walk the whole
        // family and let the key verdict skip non-matches.
        TypedValue::Text(_) => vec![family + 1],
        TypedValue::Id(_) => {
            let mut key = Vec::with_capacity(1 + value_key.len());
            key.push(family);
            key.extend_from_slice(value_key);
            key
        },
        TypedValue::Time(_) => {
            let mut key = Vec::with_capacity(1 + value_key.len() + SPAN_ID_LEN);
            key.push(family);
            key.extend_from_slice(value_key);
            key.extend_from_slice(&[0xff; SPAN_ID_LEN]);
            key
        },
    }
}

/// Decides whether an index key matches the driving bound, can be skipped,
/// or ends the scan.
fn key_verdict(plan: &ScanPlan, sort_key: &[u8]) -> KeyVerdict {
    let bound = match &plan.driving {
        None => return KeyVerdict::Match,
        Some(bound) => bound,
    };
    let ordering = sort_key.cmp(bound.value_key.as_slice());
    match bound.op {
        Op::Ge => match ordering {
            Ordering::Less => KeyVerdict::Skip,
            _ => KeyVerdict::Match,
        },
        Op::Gt => match ordering {
            Ordering::Greater => KeyVerdict::Match,
            _ => KeyVerdict::Skip,
        },
        Op::Le => match ordering {
            Ordering::Greater => KeyVerdict::Skip,
            _ => KeyVerdict::Match,
        },
        Op::Lt => match ordering {
            Ordering::Less => KeyVerdict::Match,
            _ => KeyVerdict::Skip,
        },
        Op::Eq => match ordering {
            Ordering::Equal => KeyVerdict::Match,
            Ordering::Less => KeyVerdict::Skip,
            Ordering::Greater => {
                if sort_key.starts_with(&bound.value_key) {
                    // A longer value sharing the bound as prefix; exact
                    // matches can still follow it in key order.
                    KeyVerdict::Skip
                } else {
                    KeyVerdict::Stop
                }
            },
        },
        // Contains never drives a scan.
        Op::Contains => KeyVerdict::Skip,
    }
}

/// Runs the plan against one shard, returning up to `limit` matching
/// spans in scan order plus the number of candidate spans examined.
fn run_shard_scan(
    reader: &ShardStore,
    plan: &ScanPlan,
    filters: &[CompiledPredicate],
    limit: usize,
) -> Result<(Vec<(Vec<u8>, Span)>, u64)> {
    let mut matches: Vec<(Vec<u8>, Span)> = Vec::new();
    let mut scanned = 0u64;

    if let Some(id) = plan.point {
        let primary = keys::primary_key(&id);
        if let Some(prev_key) = &plan.prev_key {
            // Scan order for a point lookup is ascending id; the single
            // candidate is gone once the continuation passed it.
            if primary.as_slice() <= prev_key.as_slice() {
                return Ok((matches, scanned));
            }
        }
        if let Some(bytes) = reader.get(&primary)? {
            let span = codec::decode(&bytes)?;
            scanned += 1;
            if filters.iter().all(|f| f.matches(&span)) {
                matches.push((primary[1..].to_vec(), span));
            }
        }
        return Ok((matches, scanned));
    }

    for item in reader.scan_from(&plan.start_key, plan.reverse) {
        let (key, value) = item?;
        if key.first() != Some(&plan.family) {
            break;
        }
        if plan.reverse {
            if let Some(prev_key) = &plan.prev_key {
                if key.as_ref() >= prev_key.as_slice() {
                    continue;
                }
            }
        }

        let (sort_key, span_id) = if plan.family == keys::PREFIX_PRIMARY {
            if key.len() != 1 + SPAN_ID_LEN {
                continue;
            }
            let mut id = [0u8; SPAN_ID_LEN];
            id.copy_from_slice(&key[1..]);
            (&key[1..], SpanId::from_bytes(id))
        } else {
            match keys::parse_secondary_key(&key) {
                Some((_, sort_key, id)) => (sort_key, id),
                None => continue,
            }
        };

        match key_verdict(plan, sort_key) {
            KeyVerdict::Skip => continue,
            KeyVerdict::Stop => break,
            KeyVerdict::Match => {},
        }

        // Fetch the candidate. Primary-family scans already carry it.
        let span = if plan.family == keys::PREFIX_PRIMARY {
            codec::decode(&value)?
        } else {
            match reader.get(&keys::primary_key(&span_id))? {
                Some(bytes) => codec::decode(&bytes)?,
                None => {
                    tracing::warn!(span_id = %span_id, "Index entry without primary record");
                    continue;
                },
            }
        };
        scanned += 1;

        if filters.iter().all(|f| f.matches(&span)) {
            matches.push((key[1..].to_vec(), span));
            if matches.len() >= limit {
                break;
            }
        }
    }
    Ok((matches, scanned))
}

/// One shard's cursor in the heap merge. The heap is a max-heap, so the
/// ordering ranks the entry that must be emitted next as the greatest.
struct MergeHead {
    key: Vec<u8>,
    shard: usize,
    pos: usize,
    descending: bool,
}

impl PartialEq for MergeHead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeHead {}

impl PartialOrd for MergeHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeHead {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_key = self.key.cmp(&other.key);
        let by_key = if self.descending { by_key } else { by_key.reverse() };
        by_key.then_with(|| self.shard.cmp(&other.shard).reverse())
    }
}

/// Merges per-shard scan results into one globally ordered page.
fn merge_shard_results(
    shard_results: Vec<Vec<(Vec<u8>, Span)>>,
    descending: bool,
    limit: usize,
) -> Vec<Span> {
    let mut heap = BinaryHeap::with_capacity(shard_results.len());
    for (shard, entries) in shard_results.iter().enumerate() {
        if let Some((key, _)) = entries.first() {
            heap.push(MergeHead {
                key: key.clone(),
                shard,
                pos: 0,
                descending,
            });
        }
    }

    let mut spans = Vec::with_capacity(limit.min(64));
    while spans.len() < limit {
        let head = match heap.pop() {
            Some(head) => head,
            None => break,
        };
        spans.push(shard_results[head.shard][head.pos].1.clone());
        let next_pos = head.pos + 1;
        if let Some((key, _)) = shard_results[head.shard].get(next_pos) {
            heap.push(MergeHead {
                key: key.clone(),
                shard: head.shard,
                pos: next_pos,
                descending,
            });
        }
    }
    spans
}
