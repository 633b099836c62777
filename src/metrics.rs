//! Prometheus metrics for AegisMesh
//!
//! This module provides metrics collection for:
//! - Shield scan lifecycle and findings
//! - Agent control plane traffic
//! - Firewall evaluations
//! - Collective intelligence submissions
//! - System performance

use lazy_static::lazy_static;
use prometheus::{
    Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, TextEncoder,
};

// Global metrics registry
lazy_static! {
    pub static ref METRICS_REGISTRY: prometheus::Registry = {
        let registry = prometheus::Registry::new();

        registry.register(Box::new(SHIELD_SCANS_TOTAL.clone())).unwrap();
        registry.register(Box::new(SHIELD_FINDINGS_TOTAL.clone())).unwrap();
        registry.register(Box::new(SHIELD_SCAN_DURATION_SECONDS.clone())).unwrap();
        registry.register(Box::new(INGEST_REQUESTS_TOTAL.clone())).unwrap();
        registry.register(Box::new(RATE_LIMITED_TOTAL.clone())).unwrap();
        registry.register(Box::new(FIREWALL_EVALUATIONS_TOTAL.clone())).unwrap();
        registry.register(Box::new(COLLECTIVE_SIGNALS_TOTAL.clone())).unwrap();
        registry.register(Box::new(SYSTEM_MEMORY_USAGE_BYTES.clone())).unwrap();
        registry.register(Box::new(SYSTEM_CPU_USAGE_PERCENT.clone())).unwrap();

        registry
    };

    // Shield Metrics
    pub static ref SHIELD_SCANS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("aegis_shield_scans_total", "Total number of shield scans executed"),
        &["depth", "status"]
    ).unwrap();

    pub static ref SHIELD_FINDINGS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("aegis_shield_findings_total", "Total shield findings emitted"),
        &["module", "severity"]
    ).unwrap();

    pub static ref SHIELD_SCAN_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("aegis_shield_scan_duration_seconds", "Wall-clock duration of shield scans")
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0])
    ).unwrap();

    // Control Plane Metrics
    pub static ref INGEST_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("aegis_ingest_requests_total", "Ingest requests received from agents"),
        &["endpoint", "outcome"]
    ).unwrap();

    pub static ref RATE_LIMITED_TOTAL: IntCounter = IntCounter::new(
        "aegis_rate_limited_total",
        "Requests rejected by the per-agent token bucket"
    ).unwrap();

    // Firewall Metrics
    pub static ref FIREWALL_EVALUATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("aegis_firewall_evaluations_total", "Firewall rule engine evaluations"),
        &["verdict"]
    ).unwrap();

    // Collective Intelligence Metrics
    pub static ref COLLECTIVE_SIGNALS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("aegis_collective_signals_total", "Collective threat signals processed"),
        &["outcome"]
    ).unwrap();

    // System Metrics
    pub static ref SYSTEM_MEMORY_USAGE_BYTES: Gauge = Gauge::new(
        "aegis_system_memory_usage_bytes",
        "Current memory usage in bytes"
    ).unwrap();

    pub static ref SYSTEM_CPU_USAGE_PERCENT: Gauge = Gauge::new(
        "aegis_system_cpu_usage_percent",
        "Current CPU usage percentage"
    ).unwrap();
}

/// Encode the registry in Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&METRICS_REGISTRY.gather())
        .unwrap_or_else(|_| "# Error encoding metrics".to_string())
}

/// Initialize metrics with default values
pub fn init_metrics() {
    SHIELD_SCANS_TOTAL.with_label_values(&["quick", "completed"]).inc_by(0);
    FIREWALL_EVALUATIONS_TOTAL.with_label_values(&["allowed"]).inc_by(0);
    FIREWALL_EVALUATIONS_TOTAL.with_label_values(&["blocked"]).inc_by(0);
}

/// Update system metrics
pub fn update_system_metrics() {
    use sysinfo::System;

    let mut sys = System::new_all();
    sys.refresh_all();

    let used_memory = sys.used_memory() as f64 * 1024.0;
    SYSTEM_MEMORY_USAGE_BYTES.set(used_memory);

    let cpu_usage = sys.global_cpu_info().cpu_usage() as f64;
    SYSTEM_CPU_USAGE_PERCENT.set(cpu_usage);
}
