//! Process-wide metrics surface, exported for Prometheus scraping.
//!
//! Every counter/gauge/histogram the core loop and edge processes record
//! goes through the `metrics` facade rather than a hand-rolled atomics
//! struct, so a single exporter (`metrics-exporter-prometheus`) can serve
//! all of them from one `/metrics` endpoint. Naming follows
//! `flowedge_<subsystem>_<thing>[_total]`, the Prometheus convention.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::error::{EngineError, EngineResult};

/// Installs the global recorder and starts the HTTP scrape endpoint. Must be
/// called once, before any `metrics::counter!`/`gauge!`/`histogram!` call;
/// subsequent calls from other threads are then cheap, lock-free macro
/// invocations against the installed recorder.
pub fn install_exporter(listen_addr: SocketAddr) -> EngineResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(listen_addr)
        .install()
        .map_err(|e| EngineError::Startup(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    info!(addr = %listen_addr, "metrics exporter listening");
    Ok(())
}

/// Depth/trade events consumed off the wire, per symbol.
pub fn record_event_received(symbol: &str, kind: &'static str) {
    metrics::counter!("flowedge_events_received_total", "symbol" => symbol.to_string(), "kind" => kind)
        .increment(1);
}

/// Depth events dropped by the core loop's bounded ingest queue
/// (drop-oldest backpressure, §5).
pub fn record_event_dropped(symbol: &str, kind: &'static str) {
    metrics::counter!("flowedge_events_dropped_total", "symbol" => symbol.to_string(), "kind" => kind)
        .increment(1);
}

pub fn record_sequence_gap(symbol: &str) {
    metrics::counter!("flowedge_sequence_gaps_total", "symbol" => symbol.to_string()).increment(1);
}

/// Numeric encoding matches `model::BookState`'s declaration order
/// (uninit=0, recovering=1, ready=2, degraded=3) so one gauge series per
/// symbol tracks the current state without leaving stale 1.0s behind on a
/// transition, the way a one-gauge-per-state-value scheme would.
pub fn record_book_state(symbol: &str, state_code: u8) {
    metrics::gauge!("flowedge_book_state", "symbol" => symbol.to_string()).set(state_code as f64);
}

pub fn record_detector_error(symbol: &str, detector: &'static str) {
    metrics::counter!("flowedge_detector_errors_total", "symbol" => symbol.to_string(), "detector" => detector)
        .increment(1);
}

pub fn record_signal_candidate(symbol: &str, kind: &'static str) {
    metrics::counter!("flowedge_signal_candidates_total", "symbol" => symbol.to_string(), "kind" => kind)
        .increment(1);
}

pub fn record_signal_dropped(symbol: &str, reason: &'static str) {
    metrics::counter!("flowedge_signals_dropped_total", "symbol" => symbol.to_string(), "reason" => reason)
        .increment(1);
}

pub fn record_signal_confirmed(symbol: &str, kind: &'static str) {
    metrics::counter!("flowedge_signals_confirmed_total", "symbol" => symbol.to_string(), "kind" => kind)
        .increment(1);
}

/// End-to-end latency from trade ingest to `ConfirmedSignal` emission, in
/// microseconds, measured with `quanta::Clock` in the core loop.
pub fn record_pipeline_latency_us(symbol: &str, micros: f64) {
    metrics::histogram!("flowedge_pipeline_latency_us", "symbol" => symbol.to_string())
        .record(micros);
}
