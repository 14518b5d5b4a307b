//! Channel-owned metrics sink.
//!
//! One worker thread owns the per-origin counter map, so no lock is ever
//! taken: writers send delta messages, and readers obtain a consistent
//! snapshot by sending a request message onto the same channel and waiting
//! for the reply. A heartbeat timer drives eviction even when no traffic
//! arrives.

use crate::core::error::{HtracedError, Result};
use crate::metrics::ring_buffer::IntRingBuffer;
use crate::metrics::{OriginTotals, ServerStats};
use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender};
use std::collections::{BTreeMap, HashMap};
use std::thread::JoinHandle;
use std::time::Duration;

/// Number of write-batch latency samples retained for averaging.
const LATENCY_RING_SLOTS: usize = 128;

/// A delta report folded into the sink's counters.
#[derive(Debug, Default)]
pub struct SpanMetricsUpdate {
    /// Spans committed per origin since the last report.
    pub written: HashMap<String, u64>,
    /// Spans dropped per origin since the last report.
    pub dropped: HashMap<String, u64>,
    /// Commit latency of the batch behind this report, if any.
    pub batch_latency_ms: Option<i64>,
    /// Millisecond timestamp of the report, used for eviction recency.
    pub time_ms: i64,
}

enum SinkMessage {
    Update(SpanMetricsUpdate),
    Access(Sender<ServerStats>),
}

struct OriginEntry {
    written: u64,
    dropped: u64,
    last_update_ms: i64,
}

/// Cheap cloneable handle used by writers, ingestors, and adapters.
#[derive(Clone)]
pub struct SinkHandle {
    sender: Sender<SinkMessage>,
}

impl SinkHandle {
    /// Folds a delta report into the sink. Reports after shutdown are
    /// dropped silently.
    pub fn report(&self, update: SpanMetricsUpdate) {
        if self.sender.send(SinkMessage::Update(update)).is_err() {
            tracing::debug!("Metrics sink is gone; dropping update");
        }
    }

    /// Returns a consistent snapshot of all counters.
    pub fn access_totals(&self) -> Result<ServerStats> {
        let (reply_sender, reply_receiver) = bounded(1);
        self.sender
            .send(SinkMessage::Access(reply_sender))
            .map_err(|_| HtracedError::ChannelSend)?;
        reply_receiver.recv().map_err(|_| HtracedError::ChannelReceive)
    }
}

/// The metrics sink worker. Owns its thread; dropping the sink (after
/// `shutdown`) stops the worker.
pub struct MetricsSink {
    sender: Sender<SinkMessage>,
    handle: Option<JoinHandle<()>>,
}

impl MetricsSink {
    /// Spawns the worker thread.
    pub fn spawn(max_addr_entries: usize, heartbeat_period: Duration) -> Self {
        let (sender, receiver) = unbounded();
        let handle = std::thread::Builder::new()
            .name("metrics-sink".to_string())
            .spawn(move || run_sink(receiver, max_addr_entries, heartbeat_period))
            .expect("failed to spawn metrics sink thread");
        MetricsSink {
            sender,
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> SinkHandle {
        SinkHandle {
            sender: self.sender.clone(),
        }
    }

    /// Stops the worker and waits for it to exit. Clones held by
    /// [`SinkHandle`]s keep the channel alive, so the daemon tears those
    /// down before calling this.
    pub fn shutdown(self) {
        let MetricsSink { sender, handle } = self;
        drop(sender);
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Metrics sink thread panicked");
            }
        }
    }
}

fn run_sink(
    receiver: Receiver<SinkMessage>,
    max_addr_entries: usize,
    heartbeat_period: Duration,
) {
    let heartbeat = tick(heartbeat_period);
    let mut origins: HashMap<String, OriginEntry> = HashMap::new();
    let mut ingested_spans: u64 = 0;
    let mut server_dropped: u64 = 0;
    let mut latencies = IntRingBuffer::new(LATENCY_RING_SLOTS);

    loop {
        select! {
            recv(receiver) -> msg => match msg {
                Ok(SinkMessage::Update(update)) => {
                    fold_update(&mut origins, &mut ingested_spans, &mut server_dropped,
                        &mut latencies, update);
                    evict(&mut origins, max_addr_entries);
                },
                Ok(SinkMessage::Access(reply)) => {
                    let snapshot = snapshot(&origins, ingested_spans, server_dropped, &latencies);
                    // A reader that gave up is not an error.
                    let _ = reply.send(snapshot);
                },
                Err(_) => break,
            },
            recv(heartbeat) -> _ => {
                evict(&mut origins, max_addr_entries);
            },
        }
    }
    tracing::debug!("Metrics sink exiting");
}

fn fold_update(
    origins: &mut HashMap<String, OriginEntry>,
    ingested_spans: &mut u64,
    server_dropped: &mut u64,
    latencies: &mut IntRingBuffer,
    update: SpanMetricsUpdate,
) {
    for (origin, count) in update.written {
        *ingested_spans += count;
        let entry = origins.entry(origin).or_insert(OriginEntry {
            written: 0,
            dropped: 0,
            last_update_ms: update.time_ms,
        });
        entry.written += count;
        entry.last_update_ms = entry.last_update_ms.max(update.time_ms);
    }
    for (origin, count) in update.dropped {
        *server_dropped += count;
        let entry = origins.entry(origin).or_insert(OriginEntry {
            written: 0,
            dropped: 0,
            last_update_ms: update.time_ms,
        });
        entry.dropped += count;
        entry.last_update_ms = entry.last_update_ms.max(update.time_ms);
    }
    if let Some(latency) = update.batch_latency_ms {
        latencies.push(latency);
    }
}

/// Drops least-recently-updated origins until the map fits the cap.
fn evict(origins: &mut HashMap<String, OriginEntry>, max_addr_entries: usize) {
    while origins.len() > max_addr_entries {
        let oldest = origins
            .iter()
            .min_by(|(addr_a, a), (addr_b, b)| {
                a.last_update_ms
                    .cmp(&b.last_update_ms)
                    .then_with(|| addr_a.cmp(addr_b))
            })
            .map(|(addr, _)| addr.clone());
        match oldest {
            Some(addr) => {
                tracing::debug!(origin = %addr, "Evicting idle origin from metrics");
                origins.remove(&addr);
            },
            None => break,
        }
    }
}

fn snapshot(
    origins: &HashMap<String, OriginEntry>,
    ingested_spans: u64,
    server_dropped: u64,
    latencies: &IntRingBuffer,
) -> ServerStats {
    let by_origin: BTreeMap<String, OriginTotals> = origins
        .iter()
        .map(|(addr, entry)| {
            (
                addr.clone(),
                OriginTotals {
                    written: entry.written,
                    server_dropped: entry.dropped,
                },
            )
        })
        .collect();
    ServerStats {
        ingested_spans,
        server_dropped,
        by_origin,
        avg_write_batch_ms: latencies.average(),
        max_write_batch_ms: latencies.max(),
    }
}
