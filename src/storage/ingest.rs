//! Per-connection span ingestion.
//!
//! An ingestor is created for one remote peer and routes each span to the
//! shard that owns it. The default mode never blocks: a full shard queue
//! drops the span and charges the drop to this peer. The RPC path flips to
//! blocking mode so bulk writers wait for queue space instead.

use crate::core::error::{HtracedError, Result};
use crate::core::span::Span;
use crate::metrics::SpanMetricsUpdate;
use crate::storage::store::DataStore;
use crate::storage::writer::{CommitHook, SpanWriteRequest};
use std::collections::HashMap;
use std::sync::Arc;

/// Routes spans from one remote peer into the shard queues.
pub struct SpanIngestor {
    store: Arc<DataStore>,
    remote_addr: String,
    default_tracer_id: String,
    blocking: bool,
    /// Spans dropped on behalf of this peer since the last flush.
    dropped: u64,
    closed: bool,
}

impl SpanIngestor {
    pub(crate) fn new(
        store: Arc<DataStore>,
        remote_addr: String,
        default_tracer_id: String,
    ) -> Self {
        SpanIngestor {
            store,
            remote_addr,
            default_tracer_id,
            blocking: false,
            dropped: 0,
            closed: false,
        }
    }

    /// Switches between dropping on a full queue (default) and waiting.
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Ingests one span. Errors describe that span only; the connection
    /// stays usable.
    pub fn ingest(&mut self, span: Span) -> Result<()> {
        self.ingest_with_hook(span, None)
    }

    /// Ingests one span, firing `done` once its batch commits.
    pub fn ingest_with_hook(&mut self, mut span: Span, done: Option<CommitHook>) -> Result<()> {
        if span.id.is_invalid() {
            self.dropped += 1;
            let err = HtracedError::bad_span("Span has an invalid (zero) id");
            if let Some(done) = done {
                let _ = done.send(Err(HtracedError::bad_span(
                    "Span has an invalid (zero) id",
                )));
            }
            return Err(err);
        }
        if span.tracer_id.is_empty() {
            span.tracer_id = self.default_tracer_id.clone();
        }
        span.normalize();

        let shard = self.store.shard_for(&span.id);
        let request = SpanWriteRequest {
            span,
            origin: self.remote_addr.clone(),
            done,
        };
        let writer = self.store.writer(shard);
        if self.blocking {
            writer.enqueue_blocking(request)
        } else {
            match writer.try_enqueue(request) {
                Ok(()) => Ok(()),
                Err(request) => {
                    self.dropped += 1;
                    if let Some(done) = request.done {
                        let _ = done.send(Err(HtracedError::QueueFull));
                    }
                    Err(HtracedError::QueueFull)
                },
            }
        }
    }

    /// Flushes owed drop accounting into the metrics sink, stamped with
    /// the supplied timestamp.
    pub fn close(mut self, now_ms: i64) {
        self.flush_accounting(now_ms);
        self.closed = true;
    }

    fn flush_accounting(&mut self, now_ms: i64) {
        if self.dropped == 0 {
            return;
        }
        let mut dropped = HashMap::new();
        dropped.insert(self.remote_addr.clone(), self.dropped);
        self.store.sink().report(SpanMetricsUpdate {
            written: HashMap::new(),
            dropped,
            batch_latency_ms: None,
            time_ms: now_ms,
        });
        self.dropped = 0;
    }
}

impl Drop for SpanIngestor {
    fn drop(&mut self) {
        // A dropped-but-unclosed ingestor still owes its accounting.
        if !self.closed {
            self.flush_accounting(crate::storage::writer::now_ms());
        }
    }
}
