//! Inbound control API.
//!
//! Ad hoc requests are served on their own tasks. A reconcile request goes
//! through the same single-flight guard as the timer, and its cycle runs on a
//! detached task so a client that disconnects cannot cancel a launch halfway.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::reconciler::{CycleOutcome, Reconciler};

#[derive(Clone)]
struct ControlState {
    reconciler: Arc<Reconciler>,
}

/// Build the control API router.
pub fn router(reconciler: Arc<Reconciler>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/ping", post(ping))
        .route("/v1/reconcile", post(reconcile))
        .route("/v1/status", get(status))
        .with_state(ControlState { reconciler })
}

/// Serve the control API until shutdown is signalled.
pub async fn serve(
    addr: SocketAddr,
    reconciler: Arc<Reconciler>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Control API listening");

    axum::serve(listener, router(reconciler))
        .with_graceful_shutdown(async move {
            let mut shutdown_rx = shutdown_rx;
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
            info!("Control API shutting down");
        })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
    host_id: &'a str,
}

async fn healthz(State(state): State<ControlState>) -> Response {
    Json(HealthResponse {
        status: "ok",
        host_id: state.reconciler.host_id(),
    })
    .into_response()
}

async fn ping(State(state): State<ControlState>) -> impl IntoResponse {
    Json(json!({
        "host_id": state.reconciler.host_id(),
        "reply": "pong",
    }))
}

async fn reconcile(State(state): State<ControlState>) -> Response {
    let reconciler = Arc::clone(&state.reconciler);
    let cycle = tokio::spawn(async move { reconciler.run_once().await });

    let result = match cycle.await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Requested reconciliation task failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    match result {
        Ok(CycleOutcome::Completed(summary)) => (StatusCode::OK, Json(summary)).into_response(),
        Ok(CycleOutcome::Skipped) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "reconciliation already in flight" })),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Requested reconciliation failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn status(State(state): State<ControlState>) -> Response {
    match state.reconciler.last_report().await {
        Some(report) => Json(report).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no reconciliation has completed yet" })),
        )
            .into_response(),
    }
}
