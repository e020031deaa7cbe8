//! Prometheus metrics for the worker pipeline.

use std::{future::Future, net::SocketAddr};

use anyhow::Result;
use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};

lazy_static! {
    /// Registry holding all monitor metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total number of processed tasks, by task type.
    pub static ref PROCESSED_TASKS: CounterVec = {
        let c = CounterVec::new(
            Opts::new("processed_tasks_total", "Total number of processed tasks"),
            &["task_type"],
        )
        .expect("metric creation failed");
        REGISTRY
            .register(Box::new(c.clone()))
            .expect("metric registration failed");
        c
    };

    /// Total number of failed tasks, by task type.
    pub static ref FAILED_TASKS: CounterVec = {
        let c = CounterVec::new(
            Opts::new("failed_tasks_total", "Total number of failed tasks processed"),
            &["task_type"],
        )
        .expect("metric creation failed");
        REGISTRY
            .register(Box::new(c.clone()))
            .expect("metric registration failed");
        c
    };

    /// Number of tasks currently being processed, by task type.
    pub static ref IN_PROGRESS_TASKS: GaugeVec = {
        let g = GaugeVec::new(
            Opts::new("in_progress_tasks", "Current number of tasks being processed"),
            &["task_type"],
        )
        .expect("metric creation failed");
        REGISTRY
            .register(Box::new(g.clone()))
            .expect("metric registration failed");
        g
    };
}

/// Render all metrics in the Prometheus text exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

/// Serve `GET /metrics` on `addr` until `shutdown` resolves.
pub async fn serve_metrics(
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = Router::new().route("/metrics", get(|| async { render() }));
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
