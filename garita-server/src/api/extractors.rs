//! Custom Axum extractors for caller identity and relay authentication.
//!
//! Provides:
//! - `Caller`: identity and roles forwarded by the upstream auth layer in
//!   `Garita-Caller-Id` / `Garita-Caller-Roles`.
//! - `IngestAuthorized`: verifies `Garita-Ingest-Secret` against the
//!   argon2-hashed secret of the configuration (used by panel relays).
//! - `Lifecycle`: the current lifecycle settings, or 503 when the
//!   configuration has none.

use axum::{
    extract::FromRequestParts,
    http::request::Parts,
    response::{IntoResponse, Response},
};
use garita_core::config::LifecycleConfig;
use garita_sdk::headers::{
    CALLER_ID_HEADER, CALLER_ROLES_HEADER, INGEST_SECRET_HEADER, parse_roles,
};
use garita_sdk::objects::Role;
use uuid::Uuid;

use super::ApiError;
use crate::state::AppState;

/// The caller as identified upstream. Both headers are optional; a missing
/// roles header means no role.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    pub id: Option<Uuid>,
    pub roles: Vec<Role>,
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let id = header_str(parts, CALLER_ID_HEADER)?
            .map(|v| {
                Uuid::parse_str(v.trim()).map_err(|_| {
                    ApiError::Validation(format!("invalid {CALLER_ID_HEADER} header"))
                })
            })
            .transpose()?;
        let roles = match header_str(parts, CALLER_ROLES_HEADER)? {
            Some(v) => parse_roles(v).map_err(|e| ApiError::Validation(e.to_string()))?,
            None => Vec::new(),
        };
        Ok(Caller { id, roles })
    }
}

fn header_str<'a>(parts: &'a Parts, name: &str) -> Result<Option<&'a str>, ApiError> {
    parts
        .headers
        .get(name)
        .map(|v| {
            v.to_str()
                .map_err(|_| ApiError::Validation(format!("invalid {name} header")))
        })
        .transpose()
}

/// Marker for requests carrying a valid `Garita-Ingest-Secret`.
pub struct IngestAuthorized;

#[derive(Debug)]
pub enum IngestAuthError {
    MissingHeader,
    InvalidHeader,
    VerificationFailed,
}

impl IntoResponse for IngestAuthError {
    fn into_response(self) -> Response {
        let reason = match self {
            IngestAuthError::MissingHeader => "missing Garita-Ingest-Secret header",
            IngestAuthError::InvalidHeader => "invalid Garita-Ingest-Secret header",
            IngestAuthError::VerificationFailed => "ingest secret verification failed",
        };
        ApiError::Unauthorized(reason.into()).into_response()
    }
}

impl FromRequestParts<AppState> for IngestAuthorized {
    type Rejection = IngestAuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let secret = parts
            .headers
            .get(INGEST_SECRET_HEADER)
            .ok_or(IngestAuthError::MissingHeader)?
            .to_str()
            .map_err(|_| IngestAuthError::InvalidHeader)?;

        let verified = state.ingest_secret.read().await.verify_secret(secret);
        if !verified {
            tracing::warn!("Rejected panel event with a wrong ingest secret");
            return Err(IngestAuthError::VerificationFailed);
        }
        Ok(IngestAuthorized)
    }
}

/// Snapshot of the lifecycle settings taken for this request.
pub struct Lifecycle(pub LifecycleConfig);

impl FromRequestParts<AppState> for Lifecycle {
    type Rejection = ApiError;

    async fn from_request_parts(
        _parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        state
            .lifecycle()
            .await
            .map(Lifecycle)
            .ok_or(ApiError::Unavailable("lifecycle settings are not configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_ingest_auth_errors_are_unauthorized() {
        let response = IngestAuthError::VerificationFailed.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = IngestAuthError::MissingHeader.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
