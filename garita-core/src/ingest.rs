//! Panel event ingestion.
//!
//! A relay reading the panels' event logs posts one [`PanelEventReport`]
//! per recognised face. Each report yields a clock-skew sample for the
//! panel, is checked against what was already recorded and, unless it is a
//! duplicate, is appended to the registration's ledger with sequence
//! remarks attached.

use crate::config::LifecycleConfig;
use crate::entities::{AccessPanel, CheckType, ClockSkewSample, PanelEventKey, Registration};
use crate::events::{StateChangedSender, publish_state_changed};
use crate::ledger::{
    AppendPrecondition, EventDraft, Ledger, LedgerError, LedgerStore, PanelStore, StoreError,
};
use crate::utils::clock::{SkewObservation, detect_auto_offset, is_alert, saturate};
use crate::utils::schedule::start_of_local_day;
use garita_sdk::objects::{IngestStatus, PanelEventAck, PanelEventReport};
use itertools::Itertools;
use thiserror::Error;
use time::{Date, Duration, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Same-type movements closer than this are the panel re-reading one face.
pub const LOGICAL_DUPLICATE_WINDOW: Duration = Duration::seconds(20);

pub const REPEATED_ENTRY: &str = "SECUENCIA_REPETIDA_IN";
pub const REPEATED_EXIT: &str = "SECUENCIA_REPETIDA_OUT";
pub const EXIT_WITHOUT_ENTRY: &str = "OUT_SIN_IN_DIA";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unrecognised panel time {0:?}")]
    InvalidPanelTime(String),
    #[error("unknown registration code {0:?}")]
    UnknownCode(String),
    #[error("panel not found: {0}")]
    PanelNotFound(Uuid),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    /// Errors caused by the report itself rather than the backend.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            IngestError::InvalidPanelTime(_)
                | IngestError::UnknownCode(_)
                | IngestError::PanelNotFound(_)
        )
    }
}

/// Parse a panel wall-clock reading in the site offset.
///
/// Accepts `YYYY-MM-DD HH:mm[:ss]` and `MM-DD-YYYY HH:mm[:ss]`, with `-` or
/// `/` between date parts, a space or `T` before the time and an optional
/// `AM`/`PM` suffix.
pub fn parse_panel_time(raw: &str, offset: UtcOffset) -> Option<OffsetDateTime> {
    let normalized = raw.trim().replace('/', "-").replacen(['T', 't'], " ", 1);
    let mut parts = normalized.split_whitespace();
    let date = parse_date(parts.next()?)?;
    let (mut hour, minute, second) = parse_clock(parts.next()?)?;

    match parts.next().map(str::to_ascii_uppercase).as_deref() {
        None => {}
        Some("AM") if (1..=12).contains(&hour) => hour %= 12,
        Some("PM") if (1..=12).contains(&hour) => hour = hour % 12 + 12,
        Some(_) => return None,
    }
    if parts.next().is_some() {
        return None;
    }

    let time = Time::from_hms(hour, minute, second).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_offset(offset))
}

fn parse_date(raw: &str) -> Option<Date> {
    let fields: Vec<&str> = raw.split('-').collect();
    let [a, b, c] = fields.as_slice() else {
        return None;
    };
    let (year, month, day) = if a.len() == 4 {
        (a, b, c)
    } else if c.len() == 4 {
        (c, a, b)
    } else {
        return None;
    };
    let month = Month::try_from(month.parse::<u8>().ok()?).ok()?;
    Date::from_calendar_date(year.parse().ok()?, month, day.parse().ok()?).ok()
}

fn parse_clock(raw: &str) -> Option<(u8, u8, u8)> {
    let mut fields = raw.split(':');
    let hour = fields.next()?.parse().ok()?;
    let minute = fields.next()?.parse().ok()?;
    let second = match fields.next() {
        // Fractional seconds are dropped.
        Some(s) => s.split('.').next()?.parse().ok()?,
        None => 0,
    };
    if fields.next().is_some() {
        return None;
    }
    Some((hour, minute, second))
}

fn sequence_remark(tipo_check: CheckType) -> Option<&'static str> {
    match tipo_check {
        CheckType::Entry => Some(REPEATED_ENTRY),
        CheckType::Exit => Some(REPEATED_EXIT),
        _ => None,
    }
}

#[derive(Clone)]
pub struct PanelEventIngestor<S> {
    ledger: Ledger<S>,
    notify_tx: StateChangedSender,
}

impl<S> PanelEventIngestor<S>
where
    S: LedgerStore + PanelStore,
{
    pub fn new(store: S, notify_tx: StateChangedSender) -> Self {
        Self {
            ledger: Ledger::new(store),
            notify_tx,
        }
    }

    fn store(&self) -> &S {
        self.ledger.store()
    }

    /// Record one panel report received at `received`.
    pub async fn ingest(
        &self,
        report: PanelEventReport,
        config: &LifecycleConfig,
        received: OffsetDateTime,
    ) -> Result<PanelEventAck, IngestError> {
        let panel_time = parse_panel_time(&report.fecha_panel, config.utc_offset)
            .ok_or_else(|| IngestError::InvalidPanelTime(report.fecha_panel.clone()))?;
        let registration = self
            .store()
            .registration_by_code(&report.codigo)
            .await?
            .ok_or_else(|| IngestError::UnknownCode(report.codigo.clone()))?;
        let panel = match report.id_panel {
            Some(id) => Some(
                self.store()
                    .panel(id)
                    .await?
                    .ok_or(IngestError::PanelNotFound(id))?,
            ),
            None => None,
        };

        let desfase = (panel_time - received).whole_seconds();
        let alerta = is_alert(desfase);
        if let Some(panel) = &panel {
            self.record_skew(panel, desfase, alerta, received).await?;
        }
        let ack = |status, event_id| PanelEventAck {
            status,
            event_id,
            desfase_reloj_segundos: desfase,
            desfase_reloj_alerta: alerta,
        };

        let key = PanelEventKey {
            id_panel: report.id_panel,
            id_registro: registration.id,
            tipo_check: report.tipo_check,
            tipo_dispositivo: report.tipo_dispositivo,
            fecha_panel: panel_time,
        };
        if self.store().panel_event_exists(&key).await? {
            debug!(registration_id = %registration.id, codigo = %report.codigo, "Duplicate panel event ignored");
            return Ok(ack(IngestStatus::Duplicate, None));
        }

        let Some(remarks) = self
            .sequence_remarks(&registration, &key, config.utc_offset)
            .await?
        else {
            debug!(registration_id = %registration.id, codigo = %report.codigo, "Logical duplicate panel event ignored");
            return Ok(ack(IngestStatus::LogicalDuplicate, None));
        };

        let draft = EventDraft {
            tipo_check: report.tipo_check,
            tipo_dispositivo: report.tipo_dispositivo,
            id_acceso: panel.as_ref().map(|p| p.id_acceso),
            id_panel: report.id_panel,
            comentario: (!remarks.is_empty()).then(|| remarks.iter().unique().join(";")),
            skew: Some(ClockSkewSample {
                fecha_panel: panel_time,
                fecha_servidor_recepcion: received,
                desfase_segundos: saturate(desfase),
            }),
        };
        let appended = match self
            .ledger
            .append_event(registration.id, draft, AppendPrecondition::Any, received)
            .await
        {
            Ok(appended) => appended,
            Err(LedgerError::DuplicateReport(_)) => {
                debug!(registration_id = %registration.id, codigo = %report.codigo, "Concurrent duplicate panel event ignored");
                return Ok(ack(IngestStatus::Duplicate, None));
            }
            Err(e) => return Err(e.into()),
        };
        publish_state_changed(&self.notify_tx, registration.id);

        info!(
            registration_id = %registration.id,
            event_id = %appended.event.id,
            tipo_check = report.tipo_check.code(),
            desfase_secs = desfase,
            "Panel event recorded"
        );
        Ok(ack(IngestStatus::Recorded, Some(appended.event.id)))
    }

    async fn record_skew(
        &self,
        panel: &AccessPanel,
        desfase: i64,
        alerta: bool,
        received: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let offset_detectado = detect_auto_offset(desfase, i64::from(panel.reloj_offset_segundos));
        if alerta {
            warn!(panel_id = %panel.id, panel = %panel.nombre, desfase_secs = desfase, "Panel clock skew above alert threshold");
        }
        if let Some(offset) = offset_detectado {
            info!(panel_id = %panel.id, offset_secs = offset, "Detected whole-hour panel clock offset");
        }
        self.store()
            .record_skew(
                panel.id,
                SkewObservation {
                    alerta,
                    desfase_segundos: saturate(desfase),
                    muestra: received,
                    offset_detectado: offset_detectado.map(saturate),
                },
            )
            .await
    }

    /// Remarks for an entry or exit, or `None` for a logical duplicate.
    async fn sequence_remarks(
        &self,
        registration: &Registration,
        key: &PanelEventKey,
        utc_offset: UtcOffset,
    ) -> Result<Option<Vec<&'static str>>, StoreError> {
        let mut remarks = Vec::new();
        if !key.tipo_check.is_movement() {
            return Ok(Some(remarks));
        }

        let last = self
            .store()
            .last_panel_movement(registration.id, key.id_panel, key.fecha_panel)
            .await?;
        if let Some(last) = last.filter(|e| e.tipo_check == key.tipo_check) {
            let gap = last.skew.map(|s| key.fecha_panel - s.fecha_panel);
            if gap.is_some_and(|gap| gap <= LOGICAL_DUPLICATE_WINDOW) {
                return Ok(None);
            }
            remarks.extend(sequence_remark(key.tipo_check));
        }

        if key.tipo_check == CheckType::Exit {
            let day_start = start_of_local_day(key.fecha_panel, utc_offset);
            let entered_today = self
                .store()
                .has_entry_between(registration.id, key.id_panel, day_start, key.fecha_panel)
                .await?;
            if !entered_today {
                remarks.push(EXIT_WITHOUT_ENTRY);
            }
        }
        Ok(Some(remarks))
    }
}
