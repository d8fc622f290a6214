//! Metrics and observability
//!
//! Prometheus-compatible metrics with atomic counters for the hot path, plus
//! per-proxy traffic accounting.

mod counters;
mod exporter;
pub mod traffic;

pub use counters::*;
pub use exporter::init_metrics;
pub use traffic::{CountingStream, LogSink, TrafficAccounting, TrafficSample, TrafficSink};
