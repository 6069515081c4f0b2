//! HTTP and WebSocket surface.
//!
//! # Endpoints
//!
//! - `GET  /registrations/{id}`            – status projection with derived permissions
//! - `POST /registrations/{id}/events`     – append an event
//! - `POST /registrations/{id}/finalize`   – finalize an active registration
//! - `POST /registrations/{id}/cancel`     – cancel an active registration
//! - `POST /registrations/{id}/panel-sync` – queue an upsert on the panels
//! - `GET  /registrations/{id}/validity`   – gate-side validity check
//! - `POST /panels/events`                 – panel relay ingestion
//! - `GET  /ws/access-events`              – state-changed stream
//!
//! Failures are answered with `{"ok":false,"reason":"..."}`.

use axum::{Json, Router, http::StatusCode, response::IntoResponse};
use garita_core::ingest::IngestError;
use garita_core::ledger::{LedgerError, StoreError};
use garita_sdk::objects::ErrorResponse;

use crate::state::AppState;

pub mod extractors;
mod panels;
mod registrations;
mod ws;

/// Build the API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(registrations::router())
        .merge(panels::router())
        .merge(ws::router())
}

/// Errors that can occur in API handlers.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    Unauthorized(String),
    NotFound(String),
    /// The registration is no longer active.
    Inactive,
    /// Concurrent appends kept winning; the client may retry.
    Conflict,
    Unavailable(&'static str),
    Store(StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, reason) = match self {
            ApiError::Validation(reason) => (StatusCode::BAD_REQUEST, reason),
            ApiError::Unauthorized(reason) => (StatusCode::UNAUTHORIZED, reason),
            ApiError::NotFound(reason) => (StatusCode::NOT_FOUND, reason),
            ApiError::Inactive => (
                StatusCode::CONFLICT,
                "registration is no longer active".to_string(),
            ),
            ApiError::Conflict => (
                StatusCode::CONFLICT,
                "registration is being modified concurrently".to_string(),
            ),
            ApiError::Unavailable(reason) => (StatusCode::SERVICE_UNAVAILABLE, reason.to_string()),
            ApiError::Store(e) => {
                tracing::error!(error = %e, "API storage error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse::new(reason))).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(_) => ApiError::NotFound("registration not found".into()),
            LedgerError::Inactive(_) => ApiError::Inactive,
            LedgerError::Conflict { .. } | LedgerError::DuplicateReport(_) => ApiError::Conflict,
            LedgerError::Store(e) => ApiError::Store(e),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Ledger(e) => e.into(),
            IngestError::Store(e) => ApiError::Store(e),
            IngestError::PanelNotFound(_) => ApiError::NotFound(err.to_string()),
            IngestError::InvalidPanelTime(_) | IngestError::UnknownCode(_) => {
                ApiError::Validation(err.to_string())
            }
        }
    }
}
