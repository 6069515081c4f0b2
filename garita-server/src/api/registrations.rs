//! Registration endpoints.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use garita_core::entities::{CheckType, Event};
use garita_core::ledger::EventDraft;
use garita_sdk::objects::{
    AppendEventRequest, CloseRegistrationRequest, EventResponse, PanelSyncResponse,
    Validity, ValidityResponse,
};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use super::ApiError;
use super::extractors::{Caller, Lifecycle};
use crate::state::AppState;

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/registrations/{id}", get(get_status))
        .route("/registrations/{id}/events", post(append_event))
        .route("/registrations/{id}/finalize", post(finalize))
        .route("/registrations/{id}/cancel", post(cancel))
        .route("/registrations/{id}/panel-sync", post(panel_sync))
        .route("/registrations/{id}/validity", get(validity))
}

fn to_response(event: &Event) -> EventResponse {
    EventResponse {
        id: event.id,
        id_registro: event.registration_id(),
        tipo_check: event.tipo_check,
        tipo_dispositivo: event.tipo_dispositivo,
        id_acceso: event.id_acceso,
        id_panel: event.id_panel,
        comentario: event.comentario.clone(),
        fecha_creacion: event.fecha_creacion.unix_timestamp(),
    }
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    access_point: Option<Uuid>,
}

/// `GET /registrations/{id}?access_point=`
async fn get_status(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Query(query): Query<StatusQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state
        .registrations
        .status(id, &caller.roles, query.access_point)
        .await?;
    Ok(Json(status))
}

/// `POST /registrations/{id}/events`
async fn append_event(
    State(state): State<AppState>,
    caller: Caller,
    Lifecycle(config): Lifecycle,
    Path(id): Path<Uuid>,
    Json(payload): Json<AppendEventRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let draft = EventDraft {
        tipo_check: payload.tipo_check,
        tipo_dispositivo: payload.tipo_dispositivo,
        id_acceso: payload.id_acceso,
        id_panel: payload.id_panel,
        comentario: payload.comentario,
        skew: None,
    };
    let appended = state
        .registrations
        .append(id, draft, &config, OffsetDateTime::now_utc())
        .await?;
    tracing::debug!(
        registration_id = %id,
        caller = ?caller.id,
        tipo_check = payload.tipo_check.code(),
        "Event appended through the API"
    );
    Ok((StatusCode::CREATED, Json(to_response(&appended.event))))
}

/// `POST /registrations/{id}/finalize`
async fn finalize(
    state: State<AppState>,
    lifecycle: Lifecycle,
    path: Path<Uuid>,
    body: Json<CloseRegistrationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    close(state, lifecycle, path, body, CheckType::Finalized).await
}

/// `POST /registrations/{id}/cancel`
async fn cancel(
    state: State<AppState>,
    lifecycle: Lifecycle,
    path: Path<Uuid>,
    body: Json<CloseRegistrationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    close(state, lifecycle, path, body, CheckType::Cancelled).await
}

async fn close(
    State(state): State<AppState>,
    Lifecycle(config): Lifecycle,
    Path(id): Path<Uuid>,
    Json(payload): Json<CloseRegistrationRequest>,
    tipo_check: CheckType,
) -> Result<(StatusCode, Json<EventResponse>), ApiError> {
    let appended = state
        .registrations
        .close(
            id,
            tipo_check,
            payload.comentario,
            &config,
            OffsetDateTime::now_utc(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(to_response(&appended.event))))
}

/// `POST /registrations/{id}/panel-sync`
async fn panel_sync(
    State(state): State<AppState>,
    Lifecycle(config): Lifecycle,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let queued = state
        .registrations
        .request_upsert(id, &config, OffsetDateTime::now_utc())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(PanelSyncResponse { queued })))
}

/// `GET /registrations/{id}/validity`
async fn validity(
    State(state): State<AppState>,
    Lifecycle(config): Lifecycle,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let validity = state
        .registrations
        .validity(id, &config, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(ValidityResponse {
        id,
        valid: validity == Validity::Valid,
        validity,
    }))
}
