use lazy_static::lazy_static;
use prometheus::{self, Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    // Registry for holding metric state
    pub static ref REGISTRY: Registry = Registry::new();
    // Transport requests by outcome
    pub static ref TRANSPORT_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("transport_requests", "The number of requests sent to ERDDAP servers"),
        &["outcome"]
    ).unwrap();
    // Response cache lookups by result
    pub static ref CACHE_LOOKUPS: IntCounterVec = IntCounterVec::new(
        Opts::new("cache_lookups", "The number of response cache lookups"),
        &["result"]
    ).unwrap();
    // Failed cache writes, which are otherwise swallowed
    pub static ref CACHE_WRITE_FAILURES: IntCounter = IntCounter::new(
        "cache_write_failures", "The number of response cache writes that failed"
    ).unwrap();
    // URLs waiting in the politeness queue
    pub static ref POLITE_QUEUE_DEPTH: IntGauge = IntGauge::new(
        "polite_queue_depth", "The number of URLs waiting in the politeness queue"
    ).unwrap();
    // Multi-server searches by lifecycle event
    pub static ref SEARCHES: IntCounterVec = IntCounterVec::new(
        Opts::new("searches", "The number of multi-server searches"),
        &["event"]
    ).unwrap();
}

pub fn register_metrics() {
    REGISTRY
        .register(Box::new(TRANSPORT_REQUESTS.clone()))
        .unwrap();
    REGISTRY.register(Box::new(CACHE_LOOKUPS.clone())).unwrap();
    REGISTRY
        .register(Box::new(CACHE_WRITE_FAILURES.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(POLITE_QUEUE_DEPTH.clone()))
        .unwrap();
    REGISTRY.register(Box::new(SEARCHES.clone())).unwrap();
}

/// Returns the registered metrics in the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    encoder.encode(&REGISTRY.gather(), &mut buffer).unwrap();

    String::from_utf8(buffer).unwrap()
}
