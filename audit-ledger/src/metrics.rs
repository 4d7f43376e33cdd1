//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `audit_ledger_events_registered_total` - Events committed
//! - `audit_ledger_duplicates_rejected_total` - Registrations refused as duplicates
//! - `audit_ledger_register_duration_seconds` - Histogram of registration latencies
//! - `audit_ledger_history_duration_seconds` - Histogram of history query latencies
//! - `audit_ledger_scan_fallback_total` - History queries answered by full scan
//!
//! Each collector owns its registry, so several ledgers can live in one
//! process without clashing on metric names.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Events committed
    pub events_registered: IntCounter,

    /// Duplicate registrations refused
    pub duplicates_rejected: IntCounter,

    /// Registration latency
    pub register_duration: Histogram,

    /// History query latency
    pub history_duration: Histogram,

    /// History queries answered by scan
    pub scan_fallbacks: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("events_registered", &self.events_registered.get())
            .field("duplicates_rejected", &self.duplicates_rejected.get())
            .finish()
    }
}

const LATENCY_BUCKETS: [f64; 9] = [0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0];

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let events_registered = IntCounter::new(
            "audit_ledger_events_registered_total",
            "Total number of events committed",
        )?;
        registry.register(Box::new(events_registered.clone()))?;

        let duplicates_rejected = IntCounter::new(
            "audit_ledger_duplicates_rejected_total",
            "Registrations refused because the id already exists",
        )?;
        registry.register(Box::new(duplicates_rejected.clone()))?;

        let register_duration = Histogram::with_opts(
            HistogramOpts::new(
                "audit_ledger_register_duration_seconds",
                "Histogram of registration latencies",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(register_duration.clone()))?;

        let history_duration = Histogram::with_opts(
            HistogramOpts::new(
                "audit_ledger_history_duration_seconds",
                "Histogram of history query latencies",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(history_duration.clone()))?;

        let scan_fallbacks = IntCounter::new(
            "audit_ledger_scan_fallback_total",
            "History queries answered by a full scan",
        )?;
        registry.register(Box::new(scan_fallbacks.clone()))?;

        Ok(Self {
            events_registered,
            duplicates_rejected,
            register_duration,
            history_duration,
            scan_fallbacks,
            registry,
        })
    }

    /// Record a committed event
    pub fn record_event_registered(&self) {
        self.events_registered.inc();
    }

    /// Record a duplicate refused
    pub fn record_duplicate(&self) {
        self.duplicates_rejected.inc();
    }

    /// Record registration duration
    pub fn record_register_duration(&self, duration_seconds: f64) {
        self.register_duration.observe(duration_seconds);
    }

    /// Record a history query
    pub fn record_history(&self, duration_seconds: f64, scanned: bool) {
        self.history_duration.observe(duration_seconds);
        if scanned {
            self.scan_fallbacks.inc();
        }
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        // Names are static and the registry is fresh, so registration cannot collide
        Self::new().expect("Failed to create metrics")
    }
}
