//! Pluggable span receivers.
//!
//! Besides being persisted, every accepted span can be handed to a set of
//! additional receivers (for example a debug logger). Receivers are named
//! by short string identifiers in the `span.receivers` configuration key
//! and resolved through a static registry; there is no dynamic loading.
//!
//! The active set is traversed on every ingested span but mutated rarely,
//! so it lives behind an atomic snapshot pointer: readers load the current
//! snapshot without blocking while mutations swap in a new list under a
//! small lock.

use crate::core::error::{HtracedError, Result};
use crate::core::span::Span;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Capability shared by all span receivers.
pub trait SpanReceiver: Send + Sync {
    /// Short identifier the registry and logs know this receiver by.
    fn name(&self) -> &'static str;

    fn receive(&self, span: &Span);

    fn close(&self);
}

/// Receiver that logs accepted spans at debug level.
#[derive(Debug, Default)]
pub struct LogReceiver;

impl SpanReceiver for LogReceiver {
    fn name(&self) -> &'static str {
        "log"
    }

    fn receive(&self, span: &Span) {
        tracing::debug!(
            span_id = %span.id,
            tracer_id = %span.tracer_id,
            description = %span.description,
            "Received span"
        );
    }

    fn close(&self) {}
}

/// Builds a receiver from its registry identifier.
pub fn create_receiver(id: &str) -> Result<Arc<dyn SpanReceiver>> {
    match id {
        "log" => Ok(Arc::new(LogReceiver)),
        _ => Err(HtracedError::config(format!(
            "Unknown span receiver '{}'",
            id
        ))),
    }
}

/// The active receiver set: concurrent traversal, serialized mutation.
pub struct SharedReceiverList {
    snapshot: ArcSwap<Vec<Arc<dyn SpanReceiver>>>,
    update_lock: Mutex<()>,
}

impl Default for SharedReceiverList {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedReceiverList {
    pub fn new() -> Self {
        SharedReceiverList {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            update_lock: Mutex::new(()),
        }
    }

    /// Builds the list named by the configuration value.
    pub fn from_ids<I, S>(ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let list = Self::new();
        for id in ids {
            list.add(create_receiver(id.as_ref())?);
        }
        Ok(list)
    }

    pub fn add(&self, receiver: Arc<dyn SpanReceiver>) {
        let _guard = self.update_lock.lock();
        let mut next = self.snapshot.load_full().as_ref().clone();
        next.push(receiver);
        self.snapshot.store(Arc::new(next));
    }

    /// Removes every receiver with the given name; returns how many went.
    pub fn remove(&self, name: &str) -> usize {
        let _guard = self.update_lock.lock();
        let current = self.snapshot.load_full();
        let next: Vec<Arc<dyn SpanReceiver>> = current
            .iter()
            .filter(|receiver| receiver.name() != name)
            .cloned()
            .collect();
        let removed = current.len() - next.len();
        self.snapshot.store(Arc::new(next));
        removed
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    /// Hands the span to every receiver in the current snapshot.
    pub fn broadcast(&self, span: &Span) {
        let snapshot = self.snapshot.load();
        for receiver in snapshot.iter() {
            receiver.receive(span);
        }
    }

    /// Closes every receiver and empties the list.
    pub fn close_all(&self) {
        let _guard = self.update_lock.lock();
        let current = self.snapshot.load_full();
        for receiver in current.iter() {
            receiver.close();
        }
        self.snapshot.store(Arc::new(Vec::new()));
    }
}
