//! HTTP request handlers

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    Json,
};
use serde::Serialize;
use tracing::{debug, instrument};

use super::ServerState;
use crate::app::HealthSnapshot;
use crate::error::{AppError, AppResult};

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    /// `starting` before the first iteration, `degraded` with broken
    /// instances, `healthy` otherwise
    status: &'static str,
    version: &'static str,
    #[serde(flatten)]
    agent: HealthSnapshot,
}

/// Root endpoint - displays basic info
pub async fn root(State(state): State<ServerState>) -> Html<String> {
    let metrics_link = if state.exporter.is_some() {
        format!(r#"<li><a href="{0}">Metrics</a></li>"#, state.config.path)
    } else {
        String::new()
    };
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>jmx-collector</title>
</head>
<body>
    <h1>jmx-collector</h1>
    <p>Version: {}</p>
    <ul>
        <li><a href="/health">Health Check</a></li>
        {}
    </ul>
</body>
</html>"#,
        env!("CARGO_PKG_VERSION"),
        metrics_link
    );
    Html(html)
}

/// Health check endpoint
pub async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    let agent = state.health.snapshot();
    let status = if !agent.ready {
        "starting"
    } else if agent.broken_instances.is_empty() {
        "healthy"
    } else {
        "degraded"
    };
    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        agent,
    })
}

/// Metrics endpoint - latest points in Prometheus format
#[instrument(skip(state), name = "metrics_handler")]
pub async fn metrics(State(state): State<ServerState>) -> AppResult<impl IntoResponse> {
    let exporter = state
        .exporter
        .as_ref()
        .ok_or_else(|| AppError::Internal("Prometheus reporter is not enabled".to_string()))?;
    let agent = state.health.snapshot();
    if !agent.ready {
        return Err(AppError::NotReady);
    }

    let mut output = exporter.render();
    output.push_str(&format!(
        r#"# HELP jmx_collector_info jmx-collector information
# TYPE jmx_collector_info gauge
jmx_collector_info{{version="{}"}} 1
# HELP jmx_collector_iterations Completed collection iterations
# TYPE jmx_collector_iterations gauge
jmx_collector_iterations {}
# HELP jmx_collector_instances Instances by state
# TYPE jmx_collector_instances gauge
jmx_collector_instances{{state="active"}} {}
jmx_collector_instances{{state="broken"}} {}
"#,
        env!("CARGO_PKG_VERSION"),
        agent.iterations,
        agent.active_instances,
        agent.broken_instances.len()
    ));

    debug!(series = exporter.len(), "Metrics rendered");

    Ok((
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        output,
    ))
}
