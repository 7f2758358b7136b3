use once_cell::sync::Lazy;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, register_histogram_vec,
    register_int_counter_vec, register_int_gauge_vec,
};

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "clp_gateway_requests_total",
        "Total requests handled by the gateway",
        &["service", "status"]
    )
    .expect("failed to register clp_gateway_requests_total")
});

static REQUEST_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        HistogramOpts::new(
            "clp_gateway_request_latency_ms",
            "Request latency in milliseconds, per service"
        ),
        &["service"]
    )
    .expect("failed to register clp_gateway_request_latency_ms")
});

static EXCLUDED_CONFIGS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "clp_gateway_excluded_configs",
        "Number of upstream configs currently excluded by the load balancer, per service",
        &["service"]
    )
    .expect("failed to register clp_gateway_excluded_configs")
});

pub fn observe_request(service: &str, status: u16, latency_ms: f64) {
    let status_label = status.to_string();
    REQUESTS_TOTAL
        .with_label_values(&[service, status_label.as_str()])
        .inc();
    REQUEST_LATENCY_MS
        .with_label_values(&[service])
        .observe(latency_ms);
}

pub fn set_excluded_configs(service: &str, count: i64) {
    EXCLUDED_CONFIGS.with_label_values(&[service]).set(count);
}
