// ABOUTME: Prometheus metrics for the bot runtime.
// ABOUTME: Counters for reconnects, dispatch errors, sink drops, and command sync pushes.

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and register metric descriptions.
/// Call once at startup; the returned handle renders the scrape payload.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_counter!(
        "chirp_gateway_reconnects_total",
        "Reconnect transitions of the gateway session"
    );
    describe_counter!(
        "chirp_events_dispatched_total",
        "Gateway events handed to extension dispatch"
    );
    describe_counter!(
        "chirp_handler_errors_total",
        "Errors raised by extension event handlers"
    );
    describe_counter!(
        "chirp_sink_dropped_total",
        "Log events dropped by the webhook sink under backpressure"
    );
    describe_counter!(
        "chirp_sync_pushes_total",
        "Remote command registration calls made by the synchronizer"
    );
    describe_gauge!(
        "chirp_loaded_extensions",
        "Number of currently loaded extensions"
    );

    Ok(handle)
}

pub fn record_reconnect() {
    counter!("chirp_gateway_reconnects_total").increment(1);
}

pub fn record_event_dispatched(kind: &str) {
    counter!("chirp_events_dispatched_total", "kind" => kind.to_string()).increment(1);
}

pub fn record_handler_error(extension: &str) {
    counter!("chirp_handler_errors_total", "extension" => extension.to_string()).increment(1);
}

pub fn record_sink_dropped(count: u64) {
    counter!("chirp_sink_dropped_total").increment(count);
}

pub fn record_sync_push(scope: &str) {
    counter!("chirp_sync_pushes_total", "scope" => scope.to_string()).increment(1);
}

pub fn set_loaded_extensions(count: u64) {
    gauge!("chirp_loaded_extensions").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The recorder is process-global, so everything rendering through it
    // lives in this one test.
    #[tokio::test]
    async fn test_handle_renders_recorded_metrics() {
        let handle = init_metrics().expect("recorder installs once per process");

        record_reconnect();
        record_sync_push("global");
        set_loaded_extensions(2);

        let rendered = handle.render();
        assert!(rendered.contains("chirp_gateway_reconnects_total"));
        assert!(rendered.contains("chirp_sync_pushes_total"));
        assert!(rendered.contains("chirp_loaded_extensions"));
    }
}
