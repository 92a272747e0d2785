//! Prometheus metrics for the Firetower gateway.
//!
//! Provides counters, histograms, and gauges for monitoring fanout health
//! and upstream link stability.

use prometheus::{
    Counter, CounterVec, Histogram, HistogramOpts, IntGauge, Opts, Registry, TextEncoder,
};

/// Gateway metrics collection.
///
/// Contains all metrics exposed by the gateway for monitoring.
pub struct GatewayMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Messages handed to the bucket for fanout.
    pub messages_pushed: Counter,

    /// Messages enqueued on a subscriber queue.
    pub fanout_deliveries: Counter,

    /// Messages dropped per subscriber, by reason.
    pub messages_dropped: CounterVec,

    /// Time spent in a single bucket push.
    pub fanout_duration_seconds: Histogram,

    /// Current open client sessions.
    pub active_sessions: IntGauge,

    /// Current topics with at least one subscriber.
    pub topics: IntGauge,

    /// 1 while the upstream transport is connected.
    pub upstream_connected: IntGauge,

    /// Successful upstream reconnects.
    pub upstream_reconnects: Counter,

    /// Upstream sends that hit the send timeout.
    pub upstream_send_timeouts: Counter,

    /// Frames decoded from the upstream stream.
    pub frames_decoded: Counter,

    /// Frames dropped as corrupt.
    pub frames_corrupt: Counter,

    /// Bytes skipped while resynchronizing on the frame header.
    pub garbage_bytes: Counter,

    /// Client publishes, by result.
    pub publishes: CounterVec,

    /// Total bytes received from clients.
    pub bytes_received: Counter,

    /// Total bytes sent to clients.
    pub bytes_sent: Counter,
}

impl GatewayMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_pushed = Counter::new(
            "firetower_messages_pushed_total",
            "Total number of messages handed to the bucket for fanout",
        )
        .expect("metric creation should succeed");

        let fanout_deliveries = Counter::new(
            "firetower_fanout_deliveries_total",
            "Total number of messages enqueued on subscriber queues",
        )
        .expect("metric creation should succeed");

        let messages_dropped = CounterVec::new(
            Opts::new(
                "firetower_messages_dropped_total",
                "Total number of per-subscriber drops by reason",
            ),
            &["reason"],
        )
        .expect("metric creation should succeed");

        let fanout_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "firetower_fanout_duration_seconds",
                "Bucket push latency in seconds",
            )
            .buckets(vec![
                0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1,
            ]),
        )
        .expect("metric creation should succeed");

        let active_sessions = IntGauge::new(
            "firetower_active_sessions",
            "Current number of open client sessions",
        )
        .expect("metric creation should succeed");

        let topics = IntGauge::new(
            "firetower_topics",
            "Current number of topics with subscribers",
        )
        .expect("metric creation should succeed");

        let upstream_connected = IntGauge::new(
            "firetower_upstream_connected",
            "Whether the topic service link is connected",
        )
        .expect("metric creation should succeed");

        let upstream_reconnects = Counter::new(
            "firetower_upstream_reconnects_total",
            "Total number of successful topic service reconnects",
        )
        .expect("metric creation should succeed");

        let upstream_send_timeouts = Counter::new(
            "firetower_upstream_send_timeouts_total",
            "Total number of topic service sends that timed out",
        )
        .expect("metric creation should succeed");

        let frames_decoded = Counter::new(
            "firetower_frames_decoded_total",
            "Total number of frames decoded from the topic service",
        )
        .expect("metric creation should succeed");

        let frames_corrupt = Counter::new(
            "firetower_frames_corrupt_total",
            "Total number of corrupt frames skipped",
        )
        .expect("metric creation should succeed");

        let garbage_bytes = Counter::new(
            "firetower_garbage_bytes_total",
            "Total bytes skipped while searching for a frame header",
        )
        .expect("metric creation should succeed");

        let publishes = CounterVec::new(
            Opts::new(
                "firetower_publishes_total",
                "Total number of client publishes by result",
            ),
            &["result"],
        )
        .expect("metric creation should succeed");

        let bytes_received = Counter::new(
            "firetower_bytes_received_total",
            "Total bytes received from clients",
        )
        .expect("metric creation should succeed");

        let bytes_sent = Counter::new(
            "firetower_bytes_sent_total",
            "Total bytes sent to clients",
        )
        .expect("metric creation should succeed");

        // Register all metrics
        registry
            .register(Box::new(messages_pushed.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(fanout_deliveries.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(messages_dropped.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(fanout_duration_seconds.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(active_sessions.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(topics.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(upstream_connected.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(upstream_reconnects.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(upstream_send_timeouts.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(frames_decoded.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(frames_corrupt.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(garbage_bytes.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(publishes.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(bytes_received.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(bytes_sent.clone()))
            .expect("metric registration should succeed");

        Self {
            registry,
            messages_pushed,
            fanout_deliveries,
            messages_dropped,
            fanout_duration_seconds,
            active_sessions,
            topics,
            upstream_connected,
            upstream_reconnects,
            upstream_send_timeouts,
            frames_decoded,
            frames_corrupt,
            garbage_bytes,
            publishes,
            bytes_received,
            bytes_sent,
        }
    }

    /// Record one bucket push and its outcome.
    pub fn record_push(&self, delivered: u64, duration_seconds: f64) {
        self.messages_pushed.inc();
        self.fanout_deliveries.inc_by(delivered as f64);
        self.fanout_duration_seconds.observe(duration_seconds);
    }

    /// Record a message dropped for one subscriber.
    pub fn record_drop(&self, reason: &str) {
        self.messages_dropped.with_label_values(&[reason]).inc();
    }

    /// Increment open sessions.
    pub fn inc_sessions(&self) {
        self.active_sessions.inc();
    }

    /// Decrement open sessions.
    pub fn dec_sessions(&self) {
        self.active_sessions.dec();
    }

    /// Set the number of topics with subscribers.
    pub fn set_topics(&self, count: i64) {
        self.topics.set(count);
    }

    /// Mark the upstream link up or down.
    pub fn set_upstream_connected(&self, connected: bool) {
        self.upstream_connected.set(i64::from(connected));
    }

    /// Record a successful reconnect.
    pub fn record_reconnect(&self) {
        self.upstream_reconnects.inc();
    }

    /// Record an upstream send timeout.
    pub fn record_send_timeout(&self) {
        self.upstream_send_timeouts.inc();
    }

    /// Record a decoded upstream frame.
    pub fn record_frame_decoded(&self) {
        self.frames_decoded.inc();
    }

    /// Record skipped corrupt frames.
    pub fn record_frames_corrupt(&self, count: u64) {
        if count > 0 {
            self.frames_corrupt.inc_by(count as f64);
        }
    }

    /// Record bytes skipped before a frame header.
    pub fn record_garbage_bytes(&self, count: u64) {
        if count > 0 {
            self.garbage_bytes.inc_by(count as f64);
        }
    }

    /// Record a client publish.
    pub fn record_publish(&self, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.publishes.with_label_values(&[result]).inc();
    }

    /// Record bytes received.
    pub fn record_bytes_received(&self, bytes: u64) {
        self.bytes_received.inc_by(bytes as f64);
    }

    /// Record bytes sent.
    pub fn record_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.inc_by(bytes as f64);
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl std::fmt::Debug for GatewayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayMetrics")
            .field("active_sessions", &self.active_sessions.get())
            .field("topics", &self.topics.get())
            .field("upstream_connected", &self.upstream_connected.get())
            .finish_non_exhaustive()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = GatewayMetrics::new();
        assert!(metrics.encode().is_ok());
    }

    #[test]
    fn test_debug_output() {
        let metrics = GatewayMetrics::new();
        metrics.inc_sessions();

        let debug = format!("{metrics:?}");
        assert!(debug.starts_with("GatewayMetrics"));
        assert!(debug.contains("active_sessions: 1"));
    }

    #[test]
    fn test_record_garbage_bytes() {
        let metrics = GatewayMetrics::new();
        metrics.record_garbage_bytes(0);
        metrics.record_garbage_bytes(7);

        assert_eq!(metrics.garbage_bytes.get() as u64, 7);
        assert!(metrics.encode().unwrap().contains("firetower_garbage_bytes_total 7"));
    }

    #[test]
    fn test_record_push() {
        let metrics = GatewayMetrics::new();
        metrics.record_push(3, 0.0001);
        metrics.record_push(0, 0.0002);

        assert_eq!(metrics.messages_pushed.get() as u64, 2);
        assert_eq!(metrics.fanout_deliveries.get() as u64, 3);

        let output = metrics.encode().unwrap();
        assert!(output.contains("firetower_fanout_duration_seconds"));
    }

    #[test]
    fn test_record_drop() {
        let metrics = GatewayMetrics::new();
        metrics.record_drop("queue_full");
        metrics.record_drop("queue_full");

        let dropped = metrics.messages_dropped.with_label_values(&["queue_full"]).get();
        assert_eq!(dropped as u64, 2);

        let output = metrics.encode().unwrap();
        assert!(output.contains("firetower_messages_dropped_total"));
    }

    #[test]
    fn test_session_gauge() {
        let metrics = GatewayMetrics::new();

        metrics.inc_sessions();
        metrics.inc_sessions();
        metrics.dec_sessions();

        assert_eq!(metrics.active_sessions.get(), 1);
    }

    #[test]
    fn test_upstream_metrics() {
        let metrics = GatewayMetrics::new();
        metrics.set_upstream_connected(true);
        metrics.record_reconnect();
        metrics.record_send_timeout();
        metrics.record_frames_corrupt(0);
        metrics.record_frames_corrupt(2);

        assert_eq!(metrics.upstream_connected.get(), 1);
        assert_eq!(metrics.frames_corrupt.get() as u64, 2);

        let output = metrics.encode().unwrap();
        assert!(output.contains("firetower_upstream_reconnects_total"));
        assert!(output.contains("firetower_upstream_send_timeouts_total"));
    }

    #[test]
    fn test_bytes_counters() {
        let metrics = GatewayMetrics::new();
        metrics.record_bytes_received(1024);
        metrics.record_bytes_sent(2048);

        let output = metrics.encode().unwrap();
        assert!(output.contains("firetower_bytes_received_total"));
        assert!(output.contains("firetower_bytes_sent_total"));
    }
}
