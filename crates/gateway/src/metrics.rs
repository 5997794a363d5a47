use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static EVENTS_BROADCAST_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static WS_OBSERVERS: OnceLock<IntGauge> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "urgent_gateway_http_requests_total",
                    "Urgent gateway HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create urgent_gateway_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "urgent_gateway_http_request_duration_seconds",
                    "Urgent gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create urgent_gateway_http_request_duration_seconds"),
        )
    })
}

fn transitions_total() -> &'static IntCounterVec {
    TRANSITIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "urgent_gateway_transitions_total",
                    "Incident lifecycle transitions by outcome.",
                ),
                &["transition", "outcome"],
            )
            .expect("create urgent_gateway_transitions_total"),
        )
    })
}

fn events_broadcast_total() -> &'static IntCounterVec {
    EVENTS_BROADCAST_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "urgent_gateway_events_broadcast_total",
                    "Realtime events handed to the broadcast fan-out.",
                ),
                &["event"],
            )
            .expect("create urgent_gateway_events_broadcast_total"),
        )
    })
}

fn ws_observers() -> &'static IntGauge {
    WS_OBSERVERS.get_or_init(|| {
        register_collector(
            IntGauge::new(
                "urgent_gateway_ws_observers",
                "Currently connected realtime observers.",
            )
            .expect("create urgent_gateway_ws_observers"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_transition(transition: &str, outcome: &str) {
    transitions_total()
        .with_label_values(&[transition, outcome])
        .inc();
}

pub fn observe_transitions(transition: &str, outcome: &str, count: u64) {
    transitions_total()
        .with_label_values(&[transition, outcome])
        .inc_by(count);
}

#[cfg(test)]
pub(crate) fn transition_count(transition: &str, outcome: &str) -> u64 {
    transitions_total()
        .with_label_values(&[transition, outcome])
        .get()
}

pub fn observe_broadcast(event: &str) {
    events_broadcast_total().with_label_values(&[event]).inc();
}

pub fn observer_connected() {
    ws_observers().inc();
}

pub fn observer_disconnected() {
    ws_observers().dec();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = ws_observers();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
