//! Axum server setup and router configuration.

use crate::api;
use crate::state::AppState;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Build the main application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(api::router())
        .with_state(state)
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    database: &'static str,
    lifecycle: &'static str,
}

/// Reports database reachability and whether lifecycle settings are loaded.
/// An unreachable database answers 503.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database_ok = sqlx::query("SELECT 1")
        .execute(&state.db.pool)
        .await
        .inspect_err(|e| tracing::warn!(error = %e, "Health check could not reach the database"))
        .is_ok();
    let lifecycle_loaded = state.lifecycle.is_some();

    let status = if database_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        status: if database_ok { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        database: if database_ok { "reachable" } else { "unreachable" },
        lifecycle: if lifecycle_loaded { "configured" } else { "missing" },
    };
    (status, Json(body))
}

/// Run the server until `shutdown` resolves.
pub async fn run_server(
    router: Router,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
