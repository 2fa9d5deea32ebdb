//! Tracing and metrics bootstrap for binaries embedding pilot.

use std::str::FromStr;

use crate::config::Settings;

/// Install a fmt subscriber filtered by `settings.log_filter`. Returns false if one was already set.
pub fn init_tracing(settings: &Settings) -> bool {
    let filter = tracing_subscriber::EnvFilter::from_str(&settings.log_filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init().is_ok()
}

/// Start the Prometheus exporter when `settings.metrics_addr` is set.
pub fn init_metrics(settings: &Settings) {
    if let Some(sock) = settings.metrics_addr {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => tracing::info!(addr = %sock, "Prometheus metrics exporter listening"),
            Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
        }
    }
}
