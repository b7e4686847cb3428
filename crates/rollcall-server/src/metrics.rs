//! Prometheus metrics for the rollcall daemon.
//!
//! This module provides:
//! - Cache metrics (hit/miss per tier)
//! - Shared store retry counts
//! - Presence metrics (fleet size, sweep cleanups, live proxies)

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Metric names as constants for consistency.
pub mod names {
    // Cache metrics
    pub const CACHE_HITS_TOTAL: &str = "rollcall_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "rollcall_cache_misses_total";

    // Store metrics
    pub const STORE_RETRIES_TOTAL: &str = "rollcall_store_retries_total";

    // Presence metrics
    pub const NETWORK_PLAYERS: &str = "rollcall_network_players";
    pub const LIVE_PROXIES: &str = "rollcall_live_proxies";
    pub const SWEEP_CLEANED_TOTAL: &str = "rollcall_sweep_cleaned_total";
    pub const BUS_MESSAGES_TOTAL: &str = "rollcall_bus_messages_total";
}

/// Install the Prometheus recorder and serve a scrape endpoint on `listen`.
///
/// Requires a running tokio runtime.
/// Returns `true` if initialization succeeded, `false` if already initialized or failed.
pub fn init_metrics(listen: SocketAddr) -> bool {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    match PrometheusBuilder::new().with_http_listener(listen).install() {
        Ok(()) => {
            tracing::info!(addr = %listen, "Prometheus exporter listening");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, addr = %listen, "Failed to start Prometheus exporter");
            false
        }
    }
}

// =============================================================================
// Cache Metrics
// =============================================================================

/// Record a cache hit. `tier` is one of `platform`, `memory`, `shared`, `authority`.
pub fn record_cache_hit(tier: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

// =============================================================================
// Store Metrics
// =============================================================================

pub fn record_store_retry() {
    counter!(names::STORE_RETRIES_TOTAL).increment(1);
}

// =============================================================================
// Presence Metrics
// =============================================================================

pub fn set_network_players(count: u64) {
    gauge!(names::NETWORK_PLAYERS).set(count as f64);
}

pub fn set_live_proxies(count: usize) {
    gauge!(names::LIVE_PROXIES).set(count as f64);
}

/// Record players released by a reconciliation sweep.
pub fn record_sweep_cleaned(count: usize) {
    counter!(names::SWEEP_CLEANED_TOTAL).increment(count as u64);
}

pub fn record_bus_message(kind: &'static str) {
    counter!(names::BUS_MESSAGES_TOTAL, "type" => kind).increment(1);
}
