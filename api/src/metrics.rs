use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref LOGIN_SUCCESS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "api_login_success_total",
        "Total successful logins"
    ))
    .unwrap();
    pub static ref LOGIN_FAILURE_TOTAL: Counter = Counter::with_opts(Opts::new(
        "api_login_failure_total",
        "Total logins rejected for bad credentials"
    ))
    .unwrap();
    pub static ref LOGIN_RATE_LIMITED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "api_login_rate_limited_total",
        "Total login attempts rejected by the rate limiter"
    ))
    .unwrap();
    pub static ref MEASUREMENTS_INGESTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "api_measurements_ingested_total",
            "Total measurements written, by source"
        ),
        &["source"]
    )
    .unwrap();
    pub static ref MEASUREMENTS_REJECTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "api_measurements_rejected_total",
            "Total measurement writes rejected by validation, by source"
        ),
        &["source"]
    )
    .unwrap();
    pub static ref UNKNOWN_SENSOR_KEY_TOTAL: Counter = Counter::with_opts(Opts::new(
        "api_unknown_sensor_key_total",
        "Total sensor requests presenting an unknown API key"
    ))
    .unwrap();
    pub static ref SERIES_CASCADE_DELETES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "api_series_cascade_deletes_total",
        "Total series removed together with their measurements and sensors"
    ))
    .unwrap();
    pub static ref PASSWORD_HASH_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "api_password_hash_seconds",
            "Time spent hashing or verifying a password"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5])
    )
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY
        .register(Box::new(LOGIN_SUCCESS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(LOGIN_FAILURE_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(LOGIN_RATE_LIMITED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(MEASUREMENTS_INGESTED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(MEASUREMENTS_REJECTED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(UNKNOWN_SENSOR_KEY_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(SERIES_CASCADE_DELETES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PASSWORD_HASH_SECONDS.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
