//! Panel relay endpoints.

use axum::{Json, Router, extract::State, response::IntoResponse, routing::post};
use garita_sdk::objects::PanelEventReport;
use time::OffsetDateTime;

use super::ApiError;
use super::extractors::{IngestAuthorized, Lifecycle};
use crate::state::AppState;

pub(super) fn router() -> Router<AppState> {
    Router::new().route("/panels/events", post(ingest_event))
}

/// `POST /panels/events`: record one event read from a panel log.
///
/// Duplicates are acknowledged with their status so the relay can advance
/// its cursor.
async fn ingest_event(
    State(state): State<AppState>,
    _authorized: IngestAuthorized,
    Lifecycle(config): Lifecycle,
    Json(report): Json<PanelEventReport>,
) -> Result<impl IntoResponse, ApiError> {
    let received = OffsetDateTime::now_utc();
    let ack = state.ingestor.ingest(report, &config, received).await?;
    Ok(Json(ack))
}
