use crate::entities::{CheckType, DeviceKind, RowError};
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use time::OffsetDateTime;
use uuid::Uuid;

/// Who an event is about. The two scopes are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSubject {
    Registration(Uuid),
    /// An employee or user identity, outside any registration.
    Identity(Uuid),
}

impl EventSubject {
    pub fn registration_id(&self) -> Option<Uuid> {
        match self {
            EventSubject::Registration(id) => Some(*id),
            EventSubject::Identity(_) => None,
        }
    }
}

/// Panel clock reading captured when a panel reported the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSkewSample {
    pub fecha_panel: OffsetDateTime,
    pub fecha_servidor_recepcion: OffsetDateTime,
    /// Panel time minus server-received time, in seconds.
    pub desfase_segundos: i32,
}

/// Immutable fact: a check of some type happened for a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: Uuid,
    pub subject: EventSubject,
    pub tipo_check: CheckType,
    pub tipo_dispositivo: DeviceKind,
    pub id_acceso: Option<Uuid>,
    pub id_panel: Option<Uuid>,
    pub comentario: Option<String>,
    pub skew: Option<ClockSkewSample>,
    pub fecha_creacion: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    id_registro: Option<Uuid>,
    id_usuario: Option<Uuid>,
    tipo_check: i16,
    tipo_dispositivo: i16,
    id_acceso: Option<Uuid>,
    id_panel: Option<Uuid>,
    comentario: Option<String>,
    fecha_panel: Option<OffsetDateTime>,
    fecha_servidor_recepcion: Option<OffsetDateTime>,
    desfase_reloj_segundos: Option<i32>,
    fecha_creacion: OffsetDateTime,
}

impl TryFrom<EventRow> for Event {
    type Error = RowError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let subject = match (row.id_registro, row.id_usuario) {
            (Some(id), _) => EventSubject::Registration(id),
            (None, Some(id)) => EventSubject::Identity(id),
            (None, None) => return Err(RowError::MissingSubject(row.id)),
        };
        let skew = match (
            row.fecha_panel,
            row.fecha_servidor_recepcion,
            row.desfase_reloj_segundos,
        ) {
            (Some(fecha_panel), Some(fecha_servidor_recepcion), Some(desfase_segundos)) => {
                Some(ClockSkewSample {
                    fecha_panel,
                    fecha_servidor_recepcion,
                    desfase_segundos,
                })
            }
            _ => None,
        };
        Ok(Self {
            id: row.id,
            subject,
            tipo_check: CheckType::try_from(row.tipo_check)?,
            tipo_dispositivo: DeviceKind::try_from(row.tipo_dispositivo)?,
            id_acceso: row.id_acceso,
            id_panel: row.id_panel,
            comentario: row.comentario,
            skew,
            fecha_creacion: row.fecha_creacion,
        })
    }
}

fn decode_rows(rows: Vec<EventRow>) -> Result<Vec<Event>, sqlx::Error> {
    rows.into_iter()
        .map(|row| Event::try_from(row).map_err(sqlx::Error::from))
        .collect()
}

const EVENT_COLUMNS: &str = "e.id, e.id_registro, e.id_usuario, e.tipo_check, e.tipo_dispositivo, \
     e.id_acceso, e.id_panel, e.comentario, e.fecha_panel, e.fecha_servidor_recepcion, \
     e.desfase_reloj_segundos, e.fecha_creacion";

impl Event {
    pub fn registration_id(&self) -> Option<Uuid> {
        self.subject.registration_id()
    }

    pub async fn insert_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<(), sqlx::Error> {
        let (id_registro, id_usuario) = match self.subject {
            EventSubject::Registration(id) => (Some(id), None),
            EventSubject::Identity(id) => (None, Some(id)),
        };
        sqlx::query(
            r#"
            INSERT INTO events (
                id, id_registro, id_usuario, tipo_check, tipo_dispositivo, id_acceso, id_panel,
                comentario, fecha_panel, fecha_servidor_recepcion, desfase_reloj_segundos,
                fecha_creacion
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(self.id)
        .bind(id_registro)
        .bind(id_usuario)
        .bind(self.tipo_check.code())
        .bind(self.tipo_dispositivo.code())
        .bind(self.id_acceso)
        .bind(self.id_panel)
        .bind(self.comentario.as_deref())
        .bind(self.skew.map(|s| s.fecha_panel))
        .bind(self.skew.map(|s| s.fecha_servidor_recepcion))
        .bind(self.skew.map(|s| s.desfase_segundos))
        .bind(self.fecha_creacion)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
/// Events linked to a registration, in `estatus` order.
///
/// With `newest_first` and a `limit` this is the "last N events" read used
/// by the expiration sweep.
pub struct ListRegistrationEvents {
    pub id_registro: Uuid,
    pub newest_first: bool,
    pub limit: Option<i64>,
}

impl Processor<ListRegistrationEvents> for DatabaseProcessor {
    type Output = Vec<Event>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListRegistrationEvents")]
    async fn process(&self, query: ListRegistrationEvents) -> Result<Vec<Event>, sqlx::Error> {
        let direction = if query.newest_first { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM registrations r \
             JOIN events e ON e.id = ANY(r.estatus) \
             WHERE r.id = $1 \
             ORDER BY array_position(r.estatus, e.id) {direction} \
             LIMIT $2"
        );
        let rows = sqlx::query_as::<_, EventRow>(&sql)
            .bind(query.id_registro)
            .bind(query.limit)
            .fetch_all(&self.pool)
            .await?;
        decode_rows(rows)
    }
}

/// Natural key of a panel-reported event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelEventKey {
    pub id_panel: Option<Uuid>,
    pub id_registro: Uuid,
    pub tipo_check: CheckType,
    pub tipo_dispositivo: DeviceKind,
    pub fecha_panel: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct PanelEventExists {
    pub key: PanelEventKey,
}

impl Processor<PanelEventExists> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:PanelEventExists")]
    async fn process(&self, query: PanelEventExists) -> Result<bool, sqlx::Error> {
        let key = query.key;
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM events
                WHERE id_panel IS NOT DISTINCT FROM $1
                  AND id_registro = $2
                  AND tipo_check = $3
                  AND tipo_dispositivo = $4
                  AND fecha_panel = $5
            )
            "#,
        )
        .bind(key.id_panel)
        .bind(key.id_registro)
        .bind(key.tipo_check.code())
        .bind(key.tipo_dispositivo.code())
        .bind(key.fecha_panel)
        .fetch_one(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
/// Latest panel-reported entry or exit at or before `until`.
pub struct GetLastPanelMovement {
    pub id_registro: Uuid,
    pub id_panel: Option<Uuid>,
    pub until: OffsetDateTime,
}

impl Processor<GetLastPanelMovement> for DatabaseProcessor {
    type Output = Option<Event>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetLastPanelMovement")]
    async fn process(&self, query: GetLastPanelMovement) -> Result<Option<Event>, sqlx::Error> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events e \
             WHERE e.id_registro = $1 \
               AND ($2::uuid IS NULL OR e.id_panel = $2) \
               AND e.tipo_check IN ($3, $4) \
               AND e.fecha_panel <= $5 \
             ORDER BY e.fecha_panel DESC \
             LIMIT 1"
        );
        let row = sqlx::query_as::<_, EventRow>(&sql)
            .bind(query.id_registro)
            .bind(query.id_panel)
            .bind(CheckType::Entry.code())
            .bind(CheckType::Exit.code())
            .bind(query.until)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Event::try_from(r).map_err(sqlx::Error::from))
            .transpose()
    }
}

#[derive(Debug, Clone)]
/// Whether a panel-reported entry exists in `[since, until]`.
pub struct HasPanelEntryBetween {
    pub id_registro: Uuid,
    pub id_panel: Option<Uuid>,
    pub since: OffsetDateTime,
    pub until: OffsetDateTime,
}

impl Processor<HasPanelEntryBetween> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:HasPanelEntryBetween")]
    async fn process(&self, query: HasPanelEntryBetween) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM events
                WHERE id_registro = $1
                  AND ($2::uuid IS NULL OR id_panel = $2)
                  AND tipo_check = $3
                  AND fecha_panel BETWEEN $4 AND $5
            )
            "#,
        )
        .bind(query.id_registro)
        .bind(query.id_panel)
        .bind(CheckType::Entry.code())
        .bind(query.since)
        .bind(query.until)
        .fetch_one(&self.pool)
        .await
    }
}

/// One clock-skew reading used by the recalibrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct ClockSample {
    pub desfase_reloj_segundos: i32,
    pub fecha_servidor_recepcion: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct ListClockSamples {
    pub id_panel: Uuid,
    pub since: OffsetDateTime,
}

impl Processor<ListClockSamples> for DatabaseProcessor {
    type Output = Vec<ClockSample>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListClockSamples")]
    async fn process(&self, query: ListClockSamples) -> Result<Vec<ClockSample>, sqlx::Error> {
        sqlx::query_as::<_, ClockSample>(
            r#"
            SELECT desfase_reloj_segundos, fecha_servidor_recepcion
            FROM events
            WHERE id_panel = $1
              AND desfase_reloj_segundos IS NOT NULL
              AND fecha_servidor_recepcion >= $2
            "#,
        )
        .bind(query.id_panel)
        .bind(query.since)
        .fetch_all(&self.pool)
        .await
    }
}
