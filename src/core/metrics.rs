//! Prometheus metrics for monitoring the relay.
//!
//! Unlike a process-global registry, [`Metrics`] owns its own
//! [`prometheus::Registry`] so tests and embedded uses can build independent
//! instances.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Container for all application metrics.
pub struct Metrics {
    registry: Registry,

    /// Finished requests by request type, stream flag and outcome
    pub requests_total: IntCounterVec,

    /// Active connections, refreshed from the accountant on every scrape
    pub active_connections: IntGauge,

    /// Time from request start to the first byte delivered to the client
    pub first_byte_latency: HistogramVec,

    /// SSE frames written to clients
    pub stream_frames: IntCounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("llm_relay_requests_total", "Total number of finished requests"),
            &["request_type", "stream", "outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let active_connections = IntGauge::new(
            "llm_relay_active_connections",
            "Number of in-flight client connections",
        )?;
        registry.register(Box::new(active_connections.clone()))?;

        let first_byte_latency = HistogramVec::new(
            HistogramOpts::new(
                "llm_relay_first_byte_seconds",
                "Time to first byte delivered to the client in seconds",
            )
            .buckets(vec![0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
            &["request_type"],
        )?;
        registry.register(Box::new(first_byte_latency.clone()))?;

        let stream_frames = IntCounterVec::new(
            Opts::new("llm_relay_stream_frames_total", "SSE frames written to clients"),
            &["request_type"],
        )?;
        registry.register(Box::new(stream_frames.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            active_connections,
            first_byte_latency,
            stream_frames,
        })
    }

    /// Record the end of one request.
    pub fn record_request(&self, request_type: &str, stream: bool, outcome: &str) {
        self.requests_total
            .with_label_values(&[request_type, if stream { "true" } else { "false" }, outcome])
            .inc();
    }

    pub fn observe_first_byte(&self, request_type: &str, seconds: f64) {
        self.first_byte_latency
            .with_label_values(&[request_type])
            .observe(seconds);
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
