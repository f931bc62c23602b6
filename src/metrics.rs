use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static FETCHES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("fetches_total", "Finished fetches by outcome");
    let vec = IntCounterVec::new(opts, &["outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register fetches_total");
    vec
});

static FETCH_STATUS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("fetch_status_total", "Fetch responses by status class");
    let vec = IntCounterVec::new(opts, &["status_class"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register fetch_status_total");
    vec
});

static FETCH_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new("fetch_duration_seconds", "Fetch latency by outcome")
        .buckets(latency_buckets());
    let vec = HistogramVec::new(opts, &["outcome"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register fetch_duration_seconds");
    vec
});

static FETCH_BYTES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("fetch_bytes_total", "Decoded body bytes stored by fetches")
        .expect("create fetch_bytes_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register fetch_bytes_total");
    counter
});

static TRANSPORT_RETRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "transport_retries_total",
        "Requests retried after a transport failure before any response byte",
    )
    .expect("create transport_retries_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register transport_retries_total");
    counter
});

static CACHE_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    let gauge =
        IntGauge::new("cache_bytes", "Bytes held by the object store").expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register cache_bytes");
    gauge
});

static CACHE_ENTRIES: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("cache_entries", "Entries in the object store")
        .expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register cache_entries");
    gauge
});

static CACHE_EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_evictions_total", "Cache entries evicted")
        .expect("create cache_evictions_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_evictions_total");
    counter
});

static CACHE_DIVERGENCE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_divergence_total",
        "Writes whose bytes differed from already cached bytes",
    )
    .expect("create cache_divergence_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_divergence_total");
    counter
});

static IDLE_POOL_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("idle_pool_size", "Idle keep-alive sockets held for reuse")
        .expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register idle_pool_size");
    gauge
});

static IDLE_POOL_CAPACITY: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("idle_pool_capacity", "Maximum idle keep-alive sockets")
        .expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register idle_pool_capacity");
    gauge
});

static IDLE_POOL_REUSE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "idle_pool_reuse_total",
        "Connection attempts by whether an idle socket was reused",
    );
    let vec = IntCounterVec::new(opts, &["reused"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register idle_pool_reuse_total");
    vec
});

fn latency_buckets() -> Vec<f64> {
    vec![
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ]
}

fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

pub fn record_fetch(outcome: &str, status: Option<u16>, bytes: u64, elapsed: Duration) {
    FETCHES_TOTAL.with_label_values(&[outcome]).inc();
    if let Some(status) = status {
        FETCH_STATUS_TOTAL
            .with_label_values(&[status_class(status)])
            .inc();
    }
    FETCH_BYTES_TOTAL.inc_by(bytes);
    FETCH_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(elapsed.as_secs_f64());
}

pub fn record_transport_retry() {
    TRANSPORT_RETRIES_TOTAL.inc();
}

pub fn record_evictions(entries: u64) {
    CACHE_EVICTIONS_TOTAL.inc_by(entries);
}

pub fn record_divergence() {
    CACHE_DIVERGENCE_TOTAL.inc();
}

pub fn set_cache_usage(bytes: u64, entries: u64) {
    CACHE_BYTES.set(i64::try_from(bytes).unwrap_or(i64::MAX));
    CACHE_ENTRIES.set(i64::try_from(entries).unwrap_or(i64::MAX));
}

pub fn set_pool_capacity(capacity: usize) {
    IDLE_POOL_CAPACITY.set(capacity as i64);
}

pub fn set_pool_size(size: usize) {
    IDLE_POOL_SIZE.set(size as i64);
}

pub fn record_pool_reuse(reused: bool) {
    let label = if reused { "true" } else { "false" };
    IDLE_POOL_REUSE_TOTAL.with_label_values(&[label]).inc();
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("encode metrics");
    buffer
}
