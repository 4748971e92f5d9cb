//! Request metrics
//!
//! Registry and collectors for proxied traffic, exposed on the status
//! listener in Prometheus text format.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    /// Proxied request counter, labelled by listener scheme and status
    pub static ref PROXY_REQUESTS_TOTAL: IntCounterVec = {
        let opts = Opts::new("proxy_requests_total", "Total number of proxied requests");
        let counter = IntCounterVec::new(opts, &["scheme", "status"])
            .expect("Failed to create request counter");
        METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register request counter");
        counter
    };

    /// Request latency histogram (in seconds)
    pub static ref PROXY_REQUEST_DURATION: HistogramVec = {
        let opts = HistogramOpts::new(
            "proxy_request_duration_seconds",
            "Proxied request latencies in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
        ]);
        let histogram = HistogramVec::new(opts, &["scheme", "status"])
            .expect("Failed to create request duration histogram");
        METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register request duration histogram");
        histogram
    };
}

/// Record one handled request
pub fn record_request(scheme: &str, status: u16, seconds: f64) {
    let status = status.to_string();
    PROXY_REQUESTS_TOTAL
        .with_label_values(&[scheme, &status])
        .inc();
    PROXY_REQUEST_DURATION
        .with_label_values(&[scheme, &status])
        .observe(seconds);
}

/// Encode the registry in Prometheus exposition format
pub fn encode() -> Result<Vec<u8>, prometheus::Error> {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&METRICS_REGISTRY.gather(), &mut buffer)?;
    Ok(buffer)
}
