//! Prometheus metrics registry and instruments.
//!
//! Instruments are usable before `init_metrics` runs; registration only
//! makes them visible to `encode_metrics`.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref ACTIVITIES_PUBLISHED: IntCounterVec = IntCounterVec::new(
        Opts::new("shelfpost_activities_published_total", "Total number of activities that reached dispatch"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref PUBLISH_ABORTS: IntCounterVec = IntCounterVec::new(
        Opts::new("shelfpost_publish_aborts_total", "Publishes aborted before dispatch"),
        &["error_kind"]
    ).expect("metric can be created");
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("shelfpost_deliveries_total", "Total number of inbox delivery attempts"),
        &["status"]
    ).expect("metric can be created");
    pub static ref DELIVERY_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "shelfpost_delivery_duration_seconds",
            "Inbox delivery duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["status"]
    ).expect("metric can be created");
    pub static ref CROSSPOSTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("shelfpost_crossposts_total", "Total number of crosspost attempts"),
        &["service", "status"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(ACTIVITIES_PUBLISHED.clone()))
        .expect("ACTIVITIES_PUBLISHED can be registered");
    REGISTRY
        .register(Box::new(PUBLISH_ABORTS.clone()))
        .expect("PUBLISH_ABORTS can be registered");
    REGISTRY
        .register(Box::new(DELIVERIES_TOTAL.clone()))
        .expect("DELIVERIES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_DURATION_SECONDS.clone()))
        .expect("DELIVERY_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(CROSSPOSTS_TOTAL.clone()))
        .expect("CROSSPOSTS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}

/// Render every registered metric in the Prometheus text format.
pub fn encode_metrics() -> Result<String, crate::error::AppError> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| crate::error::AppError::Internal(e.into()))?;
    String::from_utf8(buffer).map_err(|e| crate::error::AppError::Internal(e.into()))
}
