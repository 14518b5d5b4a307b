//! Core types shared across the daemon.

pub mod config;
pub mod error;
pub mod span;

pub use config::Config;
pub use error::{HtracedError, Result};
pub use span::{Span, SpanId, SpanOptions, TimelineAnnotation, SPAN_ID_LEN};
