//! Request and response bodies of the registration endpoints.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::codes::{CheckType, DeviceKind};

/// `POST /registrations/{id}/events`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEventRequest {
    pub tipo_check: CheckType,
    pub tipo_dispositivo: DeviceKind,
    #[serde(default)]
    pub id_acceso: Option<Uuid>,
    #[serde(default)]
    pub id_panel: Option<Uuid>,
    #[serde(default)]
    pub comentario: Option<String>,
}

/// `POST /registrations/{id}/finalize` and `/cancel`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseRegistrationRequest {
    #[serde(default)]
    pub comentario: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventResponse {
    pub id: Uuid,
    pub id_registro: Option<Uuid>,
    pub tipo_check: CheckType,
    pub tipo_dispositivo: DeviceKind,
    pub id_acceso: Option<Uuid>,
    pub id_panel: Option<Uuid>,
    pub comentario: Option<String>,
    /// Unix timestamp (seconds).
    pub fecha_creacion: i64,
}

/// Projection returned by `GET /registrations/{id}`.
///
/// `permitir_acceso` and `se_puede_finalizar` are derived on every read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationStatusResponse {
    pub id: Uuid,
    pub codigo: String,
    pub activo: bool,
    pub estatus_actual: Option<CheckType>,
    pub total_eventos: usize,
    pub permitir_acceso: bool,
    pub se_puede_finalizar: bool,
}

/// Outcome of a gate-side validity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    Valid,
    NotAuthorized,
    Rejected,
    AwaitingValidation,
    Invalid,
    Cancelled,
    Finalized,
    NotYetOpen,
    EntryExpired,
    WindowClosed,
    NoHistory,
}

/// `POST /registrations/{id}/panel-sync`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelSyncResponse {
    /// `false` when the panel integration is disabled.
    pub queued: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityResponse {
    pub id: Uuid,
    pub valid: bool,
    pub validity: Validity,
}

/// `POST /panels/events`, sent by the relay that reads panel event logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelEventReport {
    #[serde(default)]
    pub id_panel: Option<Uuid>,
    /// Registration code the panel knows the person by.
    pub codigo: String,
    pub tipo_check: CheckType,
    #[serde(default = "panel_device")]
    pub tipo_dispositivo: DeviceKind,
    /// Panel wall clock, e.g. `2026-03-01 08:15:00` or `03-01-2026 08:15:00 AM`.
    pub fecha_panel: String,
}

fn panel_device() -> DeviceKind {
    DeviceKind::Panel
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Recorded,
    Duplicate,
    LogicalDuplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelEventAck {
    pub status: IngestStatus,
    pub event_id: Option<Uuid>,
    pub desfase_reloj_segundos: i64,
    pub desfase_reloj_alerta: bool,
}

/// Structured failure body: `{"ok":false,"reason":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub reason: String,
}

impl ErrorResponse {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panel_report_defaults_to_panel_device() {
        let report: PanelEventReport = serde_json::from_str(
            r#"{"codigo":"VST0001","tipo_check":5,"fecha_panel":"2026-03-01 08:15:00"}"#,
        )
        .unwrap();
        assert_eq!(report.tipo_dispositivo, DeviceKind::Panel);
        assert_eq!(report.tipo_check, CheckType::Entry);
        assert!(report.id_panel.is_none());
    }

    #[test]
    fn test_error_response_is_not_ok() {
        let body = serde_json::to_value(ErrorResponse::new("registration not found")).unwrap();
        assert_eq!(body["ok"], false);
        assert_eq!(body["reason"], "registration not found");
    }
}
