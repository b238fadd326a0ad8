//! Prometheus metrics for the agent
//!
//! # Exported metrics
//! - `wireguard_peer_count` (gauge): number of peers configured on the
//!   WireGuard device.
//! - `netlink_route_replace_latency_seconds` (histogram): latency of
//!   netlink route replace calls.

use std::sync::atomic::AtomicI64;

use once_cell::sync::Lazy;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Gauge tracking the number of configured WireGuard peers
pub static WIREGUARD_PEER_COUNT: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

/// Histogram tracking route replace latency (seconds)
pub static ROUTE_REPLACE_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    // 1ms .. ~1s across 10 buckets.
    Histogram::new(exponential_buckets(0.001, 2.0, 10))
});

/// Register all agent metrics with the given registry
pub fn register(registry: &mut Registry) {
    registry.register(
        "wireguard_peer_count",
        "Number of configured WireGuard peers",
        WIREGUARD_PEER_COUNT.clone(),
    );
    registry.register(
        "netlink_route_replace_latency_seconds",
        "Replace latency in seconds",
        ROUTE_REPLACE_LATENCY_SECONDS.clone(),
    );
}
