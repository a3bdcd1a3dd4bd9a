//! Prometheus metrics for the gateway and the build pipeline.
//!
//! Everything registers in the global default registry once, through the
//! lazily initialized [`METRICS`] recorder, and is scraped from `/metrics`.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec,
    TextEncoder,
};

/// Maximum distinct service labels before bucketing to "other".
const MAX_SERVICE_LABELS: usize = 1_000;

pub static METRICS: Lazy<PrometheusRecorder> = Lazy::new(PrometheusRecorder::new);

pub struct PrometheusRecorder {
    gateway_requests_total: CounterVec,
    upstream_failures_total: CounterVec,
    forward_duration_seconds: HistogramVec,
    builds_total: CounterVec,
    build_duration_seconds: HistogramVec,
    lifecycle_actions_total: CounterVec,
    seen_services: Mutex<HashSet<String>>,
}

impl PrometheusRecorder {
    fn new() -> Self {
        let gateway_requests_total = register_counter_vec!(
            opts!("msgate_gateway_requests_total", "Requests handled by the service gateway"),
            &["service", "status_code"]
        )
        .expect("failed to register msgate_gateway_requests_total");

        let upstream_failures_total = register_counter_vec!(
            opts!(
                "msgate_upstream_failures_total",
                "Forwarding failures by service and reason"
            ),
            &["service", "reason"]
        )
        .expect("failed to register msgate_upstream_failures_total");

        let forward_duration_seconds = register_histogram_vec!(
            prometheus::histogram_opts!(
                "msgate_forward_duration_seconds",
                "Upstream round-trip latency in seconds",
                vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
            ),
            &["service"]
        )
        .expect("failed to register msgate_forward_duration_seconds");

        let builds_total = register_counter_vec!(
            opts!("msgate_builds_total", "Image builds by outcome"),
            &["outcome"]
        )
        .expect("failed to register msgate_builds_total");

        let build_duration_seconds = register_histogram_vec!(
            prometheus::histogram_opts!(
                "msgate_build_duration_seconds",
                "Image build duration in seconds",
                vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]
            ),
            &["outcome"]
        )
        .expect("failed to register msgate_build_duration_seconds");

        let lifecycle_actions_total = register_counter_vec!(
            opts!("msgate_lifecycle_actions_total", "Container lifecycle actions by outcome"),
            &["action", "outcome"]
        )
        .expect("failed to register msgate_lifecycle_actions_total");

        Self {
            gateway_requests_total,
            upstream_failures_total,
            forward_duration_seconds,
            builds_total,
            build_duration_seconds,
            lifecycle_actions_total,
            seen_services: Mutex::new(HashSet::new()),
        }
    }

    /// Service label, bucketed to "other" once too many distinct names were seen.
    fn service_label<'a>(&self, service: &'a str) -> &'a str {
        let mut seen = self.seen_services.lock().unwrap_or_else(|e| e.into_inner());
        if seen.contains(service) {
            return service;
        }
        if seen.len() >= MAX_SERVICE_LABELS {
            return "other";
        }
        seen.insert(service.to_string());
        service
    }

    pub fn record_gateway_request(&self, service: &str, status: u16, elapsed: Option<Duration>) {
        let service = self.service_label(service);
        self.gateway_requests_total
            .with_label_values(&[service, &status.to_string()])
            .inc();
        if let Some(elapsed) = elapsed {
            self.forward_duration_seconds
                .with_label_values(&[service])
                .observe(elapsed.as_secs_f64());
        }
    }

    pub fn record_upstream_failure(&self, service: &str, reason: &str) {
        let service = self.service_label(service);
        self.upstream_failures_total
            .with_label_values(&[service, reason])
            .inc();
    }

    pub fn record_build(&self, outcome: &str, elapsed: Duration) {
        self.builds_total.with_label_values(&[outcome]).inc();
        self.build_duration_seconds
            .with_label_values(&[outcome])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_lifecycle(&self, action: &str, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        self.lifecycle_actions_total
            .with_label_values(&[action, outcome])
            .inc();
    }
}

/// Encode all registered metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}
