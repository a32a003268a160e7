// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market data --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "market data updates").unwrap());

pub static TICKS_BY_SYMBOL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_total_by_symbol", "market data updates per symbol"),
        &["symbol"],
    )
    .unwrap()
});

// -------- Evaluation --------
pub static EVALUATIONS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("evaluations_total", "delta evaluations run").unwrap());

pub static EVALUATIONS_SKIPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("evaluations_skipped_total", "evaluations skipped (label: reason)"),
        &["reason"],
    )
    .unwrap()
});

pub static DELTA: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        Opts::new("portfolio_delta", "cash delta per leg (labels: leg = future|call|put)"),
        &["leg"],
    )
    .unwrap()
});

pub static DELTA_TOTAL: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("portfolio_delta_total", "aggregate cash delta").unwrap());

pub static CORRECTIONS: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("hedge_corrections", "hedge volume indicated by the last evaluation").unwrap());

// -------- Orders & executions --------
pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("orders_sent_total", "hedge orders sent (label: side)"), &["side"]).unwrap()
});

pub static CANCELS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("cancels_sent_total", "cancel requests sent").unwrap());

pub static EXECS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("exec_reports_total", "execution reports (label: status)"),
        &["status"],
    )
    .unwrap()
});

// -------- Levels & PnL --------
pub static LEVELS_DEPTH: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("levels_depth", "entries in the levels stack").unwrap());

pub static PNL_REALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_realized", "cumulative realized PnL").unwrap());

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(TICKS_BY_SYMBOL.clone())),
        REGISTRY.register(Box::new(EVALUATIONS.clone())),
        REGISTRY.register(Box::new(EVALUATIONS_SKIPPED.clone())),
        REGISTRY.register(Box::new(DELTA.clone())),
        REGISTRY.register(Box::new(DELTA_TOTAL.clone())),
        REGISTRY.register(Box::new(CORRECTIONS.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(CANCELS.clone())),
        REGISTRY.register(Box::new(EXECS.clone())),
        REGISTRY.register(Box::new(LEVELS_DEPTH.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps the runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(listener) => listener,
            Err(e) => {
                eprintln!("metrics bind {addr} failed: {e}");
                return;
            }
        };
        eprintln!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {e}"),
            }
        }
    });
}
