// Prometheus metrics for the Overseer worker

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::engine::ExitStatus;
use overseer_common::Phase;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Deliveries taken off the queue
    pub static ref TASKS_RECEIVED: IntCounter = IntCounter::new(
        "overseer_tasks_received_total",
        "Total number of task deliveries received"
    )
    .expect("metric can be created");

    // Terminal outcome per task (success, build_failed, client_fault, server_fault)
    pub static ref TASKS_COMPLETED: CounterVec = CounterVec::new(
        Opts::new("overseer_tasks_completed_total", "Total number of tasks acknowledged"),
        &["outcome"]
    )
    .expect("metric can be created");

    pub static ref PHASE_EXITS: CounterVec = CounterVec::new(
        Opts::new("overseer_phase_exit_total", "Phase exits by result"),
        &["phase", "result"]
    )
    .expect("metric can be created");

    pub static ref PHASE_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "overseer_phase_duration_seconds",
            "Wall-clock time of one container phase"
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
        &["phase"]
    )
    .expect("metric can be created");

    pub static ref RESULTS_PUBLISHED: IntCounter = IntCounter::new(
        "overseer_results_published_total",
        "Total completion records published"
    )
    .expect("metric can be created");
}

/// Initialize metrics registry
pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(TASKS_RECEIVED.clone()))?;
    REGISTRY.register(Box::new(TASKS_COMPLETED.clone()))?;
    REGISTRY.register(Box::new(PHASE_EXITS.clone()))?;
    REGISTRY.register(Box::new(PHASE_DURATION.clone()))?;
    REGISTRY.register(Box::new(RESULTS_PUBLISHED.clone()))?;
    Ok(())
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_task_received() {
    TASKS_RECEIVED.inc();
}

pub fn record_task_completed(outcome: &str) {
    TASKS_COMPLETED.with_label_values(&[outcome]).inc();
}

pub fn record_phase(phase: Phase, exit: ExitStatus, seconds: f64) {
    let result = if exit.timed_out {
        "timeout"
    } else if exit.code == 0 {
        "zero"
    } else {
        "nonzero"
    };
    let phase = phase.to_string();
    PHASE_EXITS.with_label_values(&[phase.as_str(), result]).inc();
    PHASE_DURATION.with_label_values(&[phase.as_str()]).observe(seconds);
}

pub fn record_result_published() {
    RESULTS_PUBLISHED.inc();
}

fn routes() -> Router {
    Router::new()
        .route("/metrics", get(|| async { render_metrics() }))
        .route("/health", get(|| async { "OK" }))
}

/// Serve `/metrics` and `/health` until the process exits
pub async fn serve(port: u16) {
    let addr = format!("0.0.0.0:{}", port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind metrics listener on {}: {}", addr, e);
            return;
        }
    };
    info!("Metrics listening on {}", addr);
    if let Err(e) = axum::serve(listener, routes()).await {
        error!("Metrics server error: {}", e);
    }
}
