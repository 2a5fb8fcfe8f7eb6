//! Prometheus metrics for the faucet

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

lazy_static! {
    pub static ref CLAIMS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("faucet_claims_total", "Claim requests by outcome"),
        &["outcome"]  // dispatched | throttled | underfunded | transfer_failed | error
    ).unwrap();

    pub static ref RECONCILIATION_ALERTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("faucet_reconciliation_alerts_total", "Claim states that need manual reconciliation"),
        &["kind"]  // ambiguous_transfer | commit_lost | release_failed
    ).unwrap();

    pub static ref SUBMIT_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("faucet_submit_duration_seconds", "Transfer submission duration in seconds")
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0])
    ).unwrap();

    pub static ref FUNDING_LEVEL: Gauge = Gauge::new(
        "faucet_funding_level",
        "Last observed faucet balance in token base units"
    ).unwrap();
}

/// Metrics collector
#[derive(Clone)]
pub struct MetricsCollector {
    registry: Arc<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        registry.register(Box::new(CLAIMS_TOTAL.clone()))?;
        registry.register(Box::new(RECONCILIATION_ALERTS_TOTAL.clone()))?;
        registry.register(Box::new(SUBMIT_DURATION.clone()))?;
        registry.register(Box::new(FUNDING_LEVEL.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
        })
    }

    /// Gather metrics as Prometheus text format
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub fn record_outcome(outcome: &str) {
    CLAIMS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_reconciliation(kind: &str) {
    RECONCILIATION_ALERTS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_funding_level(base_units: u128) {
    FUNDING_LEVEL.set(base_units as f64);
}
