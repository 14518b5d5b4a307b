//! Per-origin write/drop accounting.
//!
//! Counters live in a single-owner sink worker; see [`sink`] for the
//! channel protocol and [`ring_buffer`] for the latency window.

pub mod ring_buffer;
pub mod sink;

pub use ring_buffer::IntRingBuffer;
pub use sink::{MetricsSink, SinkHandle, SpanMetricsUpdate};

use serde::Serialize;
use std::collections::BTreeMap;

/// Counters for one remote origin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OriginTotals {
    #[serde(rename = "Written")]
    pub written: u64,
    #[serde(rename = "ServerDropped")]
    pub server_dropped: u64,
}

/// Snapshot returned by `GET /server/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    /// Total spans committed since startup. Survives origin eviction.
    #[serde(rename = "IngestedSpans")]
    pub ingested_spans: u64,
    /// Total spans dropped since startup. Survives origin eviction.
    #[serde(rename = "ServerDropped")]
    pub server_dropped: u64,
    #[serde(rename = "ByOrigin")]
    pub by_origin: BTreeMap<String, OriginTotals>,
    /// Mean write-batch commit latency over the recent window.
    #[serde(rename = "AvgWriteBatchMs")]
    pub avg_write_batch_ms: i64,
    #[serde(rename = "MaxWriteBatchMs")]
    pub max_write_batch_ms: i64,
}
