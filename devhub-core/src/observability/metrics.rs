//! Prometheus metrics for the resilience and messaging core.
//!
//! Components emit through the `metrics` facade; nothing is recorded until a
//! recorder is installed with [`init_metrics`].

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

pub const BREAKER_REJECTIONS: &str = "devhub_circuit_breaker_rejections_total";
pub const BREAKER_TRANSITIONS: &str = "devhub_circuit_breaker_transitions_total";
pub const POOL_REQUESTS: &str = "devhub_pool_requests_total";
pub const POOL_FAILURES: &str = "devhub_pool_failures_total";
pub const POOL_REQUEST_DURATION: &str = "devhub_pool_request_duration_seconds";
pub const HUB_CONNECTED_CLIENTS: &str = "devhub_hub_connected_clients";
pub const HUB_EVENTS_PUBLISHED: &str = "devhub_hub_events_published_total";
pub const HUB_EVENTS_DROPPED: &str = "devhub_hub_events_dropped_total";
pub const HUB_CLIENTS_REAPED: &str = "devhub_hub_clients_reaped_total";
pub const PANICS: &str = "devhub_panics_total";
pub const PANIC_STORMS: &str = "devhub_panic_storms_total";

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to install metrics recorder: {0}")]
    Installation(String),
}

/// Install the Prometheus recorder and describe every metric.
///
/// Returns the handle used to render the scrape output. Fails if a recorder
/// is already installed in this process.
pub fn init_metrics() -> Result<PrometheusHandle, MetricsError> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(POOL_REQUEST_DURATION.to_string()),
            &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
        )
        .map_err(|e| MetricsError::Installation(e.to_string()))?
        .install_recorder()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;

    describe_metrics();
    Ok(handle)
}

/// Registers descriptions for all metrics emitted by this crate.
pub fn describe_metrics() {
    describe_counter!(
        BREAKER_REJECTIONS,
        Unit::Count,
        "Calls rejected by a circuit breaker without being invoked"
    );
    describe_counter!(
        BREAKER_TRANSITIONS,
        Unit::Count,
        "Circuit breaker state transitions, labelled by target state"
    );

    describe_counter!(POOL_REQUESTS, Unit::Count, "Requests issued through a connection pool");
    describe_counter!(
        POOL_FAILURES,
        Unit::Count,
        "Pooled requests that failed with a transport error, timeout or cancellation"
    );
    describe_histogram!(
        POOL_REQUEST_DURATION,
        Unit::Seconds,
        "Latency of pooled requests until response headers arrive"
    );

    describe_gauge!(HUB_CONNECTED_CLIENTS, Unit::Count, "Clients registered with the event hub");
    describe_counter!(HUB_EVENTS_PUBLISHED, Unit::Count, "Events accepted by the event hub");
    describe_counter!(
        HUB_EVENTS_DROPPED,
        Unit::Count,
        "Events dropped because the hub mailbox was full"
    );
    describe_counter!(
        HUB_CLIENTS_REAPED,
        Unit::Count,
        "Clients evicted because their outbound queue was full or closed"
    );

    describe_counter!(PANICS, Unit::Count, "Panics caught by panic recovery");
    describe_counter!(PANIC_STORMS, Unit::Count, "Panic storms detected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::{counter, with_local_recorder};
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn test_metrics_render_in_prometheus_format() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        with_local_recorder(&recorder, || {
            describe_metrics();
            counter!(POOL_REQUESTS, "pool" => "default").increment(3);
        });

        let output = handle.render();
        assert!(output.contains("devhub_pool_requests_total{pool=\"default\"} 3"));
    }
}
