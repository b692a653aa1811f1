//! Prometheus metrics.
//!
//! Handlers record through the free functions below; the `/metrics` route
//! renders whatever the installed recorder has collected. When no recorder
//! is installed the `metrics` macros are no-ops.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::warn;

static HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the global Prometheus recorder.
///
/// Safe to call repeatedly (every router built in tests calls it); only the
/// first call installs anything.
pub fn install() -> Option<PrometheusHandle> {
    HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to install Prometheus recorder: {}", e);
                None
            }
        })
        .clone()
}

/// Count a finished request. `kind` is `playlist`, `passthrough`, `cache` or `error`.
pub fn record_request(kind: &'static str, status: u16) {
    counter!("relay_requests_total", "kind" => kind, "status" => status.to_string()).increment(1);
}

pub fn record_duration(kind: &'static str, start: Instant) {
    histogram!("relay_request_duration_seconds", "kind" => kind)
        .record(start.elapsed().as_secs_f64());
}

/// An upstream fetch that failed after all retries.
pub fn record_upstream_error() {
    counter!("relay_upstream_errors_total").increment(1);
}

pub fn record_retry() {
    counter!("relay_upstream_retries_total").increment(1);
}

/// Lines changed by one playlist rewrite.
pub fn record_rewritten_lines(count: usize) {
    counter!("relay_rewritten_lines_total").increment(count as u64);
}

pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("relay_playlist_cache_lookups_total", "result" => result).increment(1);
}
