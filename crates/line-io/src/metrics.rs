//! Prometheus metrics for the line monitor.
//!
//! Poll loops, the alarm path and the UI gateway update these statics; the
//! optional HTTP endpoint serves them in text exposition format.

use prometheus::core::Collector;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Header, Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("static metric definition");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registered once");
    counter
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter =
        IntCounterVec::new(Opts::new(name, help), labels).expect("static metric definition");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registered once");
    counter
}

fn gauge(name: &str, help: &str) -> Gauge {
    let gauge = Gauge::new(name, help).expect("static metric definition");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("metric registered once");
    gauge
}

fn int_gauge(name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("static metric definition");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("metric registered once");
    gauge
}

// ============================================================================
// PLC Link Metrics
// ============================================================================

/// Successful poll cycles per device
pub static POLL_CYCLES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "line_poll_cycles_total",
        "Successful register poll cycles",
        &["device"],
    )
});

/// Failed poll cycles per device (connection dropped afterwards)
pub static POLL_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "line_poll_failures_total",
        "Poll cycles that failed with an I/O error or timeout",
        &["device"],
    )
});

/// Connection attempts after the first one
pub static RECONNECTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "line_reconnect_attempts_total",
        "Connection attempts made while a device was disconnected",
        &["device"],
    )
});

/// 1 while the device link is connected or polling
pub static LINK_CONNECTED: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("line_link_connected", "PLC link status (1=connected, 0=disconnected)"),
        &["device"],
    )
    .expect("static metric definition");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("metric registered once");
    gauge
});

pub static TAG_WRITES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "line_tag_writes_total",
        "Tag writes issued by UI clients",
        &["result"],
    )
});

// ============================================================================
// Tag / Alarm Metrics
// ============================================================================

pub static DECODE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "line_decode_failures_total",
        "Tags skipped because their registers could not be decoded",
    )
});

/// Alarm lifecycle events by kind (raised, cleared, acknowledged)
pub static ALARM_EVENTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec("line_alarm_events_total", "Alarm lifecycle events", &["kind"])
});

pub static ACTIVE_ALARMS: LazyLock<IntGauge> =
    LazyLock::new(|| int_gauge("line_active_alarms", "Currently active alarms"));

// ============================================================================
// OEE Metrics
// ============================================================================

pub static OEE_AVAILABILITY: LazyLock<Gauge> =
    LazyLock::new(|| gauge("line_oee_availability", "OEE availability ratio"));

pub static OEE_PERFORMANCE: LazyLock<Gauge> =
    LazyLock::new(|| gauge("line_oee_performance", "OEE performance ratio (unclamped)"));

pub static OEE_QUALITY: LazyLock<Gauge> =
    LazyLock::new(|| gauge("line_oee_quality", "OEE quality ratio"));

pub static OEE_OVERALL: LazyLock<Gauge> =
    LazyLock::new(|| gauge("line_oee_overall", "Overall equipment effectiveness"));

// ============================================================================
// Gateway Metrics
// ============================================================================

pub static GATEWAY_CLIENTS: LazyLock<IntGauge> =
    LazyLock::new(|| int_gauge("line_gateway_clients", "Connected UI clients"));

/// Requests by request id ("-1" for unknown ids)
pub static GATEWAY_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "line_gateway_requests_total",
        "UI requests dispatched",
        &["request_id"],
    )
});

/// Malformed or oversized lines from UI clients
pub static PROTOCOL_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "line_gateway_protocol_errors_total",
        "UI lines discarded as malformed or oversized",
    )
});

pub fn device_label(device_no: u16) -> String {
    device_no.to_string()
}

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Start the metrics HTTP server on the given address.
///
/// `/ready` answers 200 once any device has completed a poll cycle.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            match request.url() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
                        tracing::warn!("Failed to encode metrics: {}", e);
                        let _ = request.respond(
                            Response::from_string("Internal Server Error").with_status_code(500),
                        );
                        continue;
                    }
                    let mut response = Response::from_data(buffer);
                    if let Ok(header) =
                        Header::from_bytes(&b"Content-Type"[..], &b"text/plain; version=0.0.4"[..])
                    {
                        response = response.with_header(header);
                    }
                    let _ = request.respond(response);
                }
                "/health" => {
                    let _ = request.respond(Response::from_string("OK"));
                }
                "/ready" => {
                    if total_poll_cycles() > 0 {
                        let _ = request.respond(Response::from_string("Ready"));
                    } else {
                        let _ = request
                            .respond(Response::from_string("Not Ready").with_status_code(503));
                    }
                }
                _ => {
                    let _ =
                        request.respond(Response::from_string("Not Found").with_status_code(404));
                }
            }
        }
    })
}

/// Sum of successful poll cycles over all devices.
pub fn total_poll_cycles() -> u64 {
    POLL_CYCLES
        .collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .map(|m| m.get_counter().get_value() as u64)
        .sum()
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    LazyLock::force(&POLL_CYCLES);
    LazyLock::force(&POLL_FAILURES);
    LazyLock::force(&RECONNECTS);
    LazyLock::force(&LINK_CONNECTED);
    LazyLock::force(&TAG_WRITES);
    let _ = DECODE_FAILURES.get();
    LazyLock::force(&ALARM_EVENTS);
    let _ = ACTIVE_ALARMS.get();
    let _ = OEE_AVAILABILITY.get();
    let _ = OEE_PERFORMANCE.get();
    let _ = OEE_QUALITY.get();
    let _ = OEE_OVERALL.get();
    let _ = GATEWAY_CLIENTS.get();
    LazyLock::force(&GATEWAY_REQUESTS);
    let _ = PROTOCOL_ERRORS.get();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_cycles_sum_over_devices() {
        init_metrics();
        let before = total_poll_cycles();
        POLL_CYCLES.with_label_values(&["901"]).inc();
        POLL_CYCLES.with_label_values(&["902"]).inc_by(2);
        assert!(total_poll_cycles() >= before + 3);
    }

    #[test]
    fn registry_exposes_line_metrics() {
        init_metrics();
        PROTOCOL_ERRORS.inc();
        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "line_gateway_protocol_errors_total"));
        assert!(names.iter().any(|n| n == "line_oee_overall"));
    }
}
