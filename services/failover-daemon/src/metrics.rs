//! Prometheus metrics exposition
//!
//! The failover crates emit their own counters (`usage_poll_cycles_total`,
//! `failover_swaps_total`, `failover_swap_failures_total`,
//! `auth_failures_total`); this module installs the recorder that collects
//! them and returns the handle the `/metrics` route renders.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering
/// metrics.
///
/// The handle's `render()` method produces the Prometheus text exposition
/// format suitable for serving on a `/metrics` endpoint.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

#[cfg(test)]
mod tests {
    #[test]
    fn counter_emission_without_recorder_does_not_panic() {
        // When no recorder is installed, metrics calls are no-ops. The
        // failover crates emit counters unconditionally, so this must hold.
        metrics::counter!("usage_poll_cycles_total").increment(1);
        metrics::counter!("failover_swaps_total").increment(1);
    }
}
