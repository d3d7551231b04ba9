// Copyright (c) 2026 Dawn Mesh
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Health probes and Prometheus exposition over HTTP.
//!
//! `/live` answers while the event loop is responsive, `/ready` once
//! bootstrap completed, `/health` aggregates component self-checks, and
//! `/metrics` exposes the Prometheus registry in text format.

use crate::networking::node::{Lifecycle, P2pNode};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

/// Health server errors.
#[derive(Debug, Error)]
pub enum HealthError {
    /// Could not bind the HTTP listener.
    #[error("health listener bind failed")]
    Bind,
}

/// Aggregate node status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All checks pass.
    Healthy,
    /// Serving, but a non-fatal check fails.
    Degraded,
    /// Not serving.
    Unhealthy,
}

#[derive(Serialize)]
struct HealthReport {
    status: HealthStatus,
    checks: HealthChecks,
    uptime_seconds: u64,
    peers_connected: usize,
}

#[derive(Serialize)]
struct HealthChecks {
    identity_loaded: bool,
    listener_bound: bool,
    registries_readable: bool,
    audit_writable: bool,
    bootstrap_complete: bool,
}

/// Compute the aggregate health report for `node`.
fn report(node: &P2pNode) -> HealthReport {
    let running = node.lifecycle() == Lifecycle::Running;
    let checks = HealthChecks {
        // The node cannot exist without a loaded identity and bound listener.
        identity_loaded: true,
        listener_bound: running,
        registries_readable: !node.peers().write_failed(),
        audit_writable: !node.audit().write_failed() || !node.audit().enabled(),
        bootstrap_complete: node.is_ready(),
    };
    let status = if !running {
        HealthStatus::Unhealthy
    } else if !checks.audit_writable || !checks.registries_readable || !checks.bootstrap_complete {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };
    HealthReport {
        status,
        checks,
        uptime_seconds: node.uptime().as_secs(),
        peers_connected: node.connected_peers().len(),
    }
}

async fn live() -> &'static str {
    "OK"
}

async fn ready(State(node): State<P2pNode>) -> impl IntoResponse {
    if node.is_ready() && node.lifecycle() == Lifecycle::Running {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn health(State(node): State<P2pNode>) -> impl IntoResponse {
    let rep = report(&node);
    let code = match rep.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(rep))
}

async fn metrics(State(node): State<P2pNode>) -> impl IntoResponse {
    let families = node.metrics().registry.gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (StatusCode::OK, String::from_utf8_lossy(&buf).into_owned())
}

/// Bind the observability listener and serve probes until the node stops.
/// `probes_enabled` gates the health routes; `/metrics` is always served.
pub async fn spawn(node: P2pNode, port: u16, probes_enabled: bool) -> Result<JoinHandle<()>, HealthError> {
    let mut app = Router::new()
        .route("/metrics", get(metrics));
    if probes_enabled {
        app = app
            .route("/live", get(live))
            .route("/ready", get(ready))
            .route("/health", get(health));
    }
    let app = app.with_state(node.clone());

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|_| HealthError::Bind)?;
    let addr = listener.local_addr().map_err(|_| HealthError::Bind)?;
    info!(%addr, "observability listener bound");

    let mut shutdown = node.shutdown_signal();
    Ok(tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await;
    }))
}
