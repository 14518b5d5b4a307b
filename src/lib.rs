//! htraced: a daemon that ingests distributed-tracing spans, persists them
//! across sharded on-disk key/value stores, and answers point lookups,
//! parent/children lookups, and predicate queries.
//!
//! The crate is organized around the ingestion-and-query engine:
//!
//! - [`core`] holds the span model, errors, and configuration.
//! - [`codec`] is the tagged binary span encoding.
//! - [`storage`] owns the sharded stores, index layout, write pipeline,
//!   and store lifecycle.
//! - [`query`] plans and executes predicate queries with continuation
//!   tokens.
//! - [`metrics`] aggregates per-origin write/drop counters.
//! - [`receivers`] is the pluggable span receiver registry.
//! - [`server`] assembles the daemon and its REST and binary RPC
//!   transports.

pub mod cli;
pub mod codec;
pub mod core;
pub mod metrics;
pub mod query;
pub mod receivers;
pub mod server;
pub mod storage;

pub use crate::core::{Config, HtracedError, Result, Span, SpanId, SpanOptions};
