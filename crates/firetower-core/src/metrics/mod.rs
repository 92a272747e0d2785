//! Metrics collection for the Firetower gateway.
//!
//! Provides Prometheus-compatible metrics for monitoring fanout, upstream
//! link health and client connection statistics.

pub mod prometheus;

pub use prometheus::GatewayMetrics;
