use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_gauge!("rtun_tunnels_active", "Tunnels whose dispatch loop is running.");
    metrics::describe_gauge!(
        "rtun_virtual_active",
        "Virtual connections currently open across all tunnels."
    );
    metrics::describe_counter!("rtun_frames_read_total", "Frames decoded from tunnel peers.");
    metrics::describe_counter!("rtun_frames_written_total", "Frames written to tunnel peers.");
    metrics::describe_counter!(
        "rtun_registrations_total",
        "Register requests handled, by result."
    );
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
