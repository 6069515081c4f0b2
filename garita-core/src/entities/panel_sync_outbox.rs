//! Desired device state per registration and panel.
//!
//! A row exists while a panel has not yet confirmed the latest action
//! requested for a registration.

use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncAction {
    Upsert,
    Delete,
}

impl SyncAction {
    pub const fn code(self) -> i16 {
        match self {
            SyncAction::Upsert => 1,
            SyncAction::Delete => 2,
        }
    }

    pub const fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(SyncAction::Upsert),
            2 => Some(SyncAction::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncAction::Upsert => write!(f, "upsert"),
            SyncAction::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncIntent {
    pub id_registro: Uuid,
    pub id_panel: Uuid,
    pub accion: SyncAction,
    pub intentos: i32,
    pub ultimo_error: Option<String>,
    pub siguiente_intento: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct SyncIntentRow {
    id_registro: Uuid,
    id_panel: Uuid,
    accion: i16,
    intentos: i32,
    ultimo_error: Option<String>,
    siguiente_intento: OffsetDateTime,
}

#[derive(Debug, Clone)]
/// Record (or replace) the action wanted on a panel. Resets the attempt
/// counter.
pub struct RecordSyncIntent {
    pub id_registro: Uuid,
    pub id_panel: Uuid,
    pub accion: SyncAction,
    pub now: OffsetDateTime,
}

impl Processor<RecordSyncIntent> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:RecordSyncIntent")]
    async fn process(&self, query: RecordSyncIntent) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO panel_sync_outbox
                (id_registro, id_panel, accion, intentos, ultimo_error, siguiente_intento, fecha_modificacion)
            VALUES ($1, $2, $3, 0, NULL, $4, $4)
            ON CONFLICT (id_registro, id_panel) DO UPDATE
            SET accion = EXCLUDED.accion,
                intentos = 0,
                ultimo_error = NULL,
                siguiente_intento = EXCLUDED.siguiente_intento,
                fecha_modificacion = EXCLUDED.fecha_modificacion
            "#,
        )
        .bind(query.id_registro)
        .bind(query.id_panel)
        .bind(query.accion.code())
        .bind(query.now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
/// Remove the row if it still asks for `accion`. A newer, different
/// request is left in place.
pub struct ConfirmSyncIntent {
    pub id_registro: Uuid,
    pub id_panel: Uuid,
    pub accion: SyncAction,
}

impl Processor<ConfirmSyncIntent> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ConfirmSyncIntent")]
    async fn process(&self, query: ConfirmSyncIntent) -> Result<(), sqlx::Error> {
        sqlx::query(
            "DELETE FROM panel_sync_outbox WHERE id_registro = $1 AND id_panel = $2 AND accion = $3",
        )
        .bind(query.id_registro)
        .bind(query.id_panel)
        .bind(query.accion.code())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DeferSyncIntent {
    pub id_registro: Uuid,
    pub id_panel: Uuid,
    pub error: String,
    pub next_attempt: OffsetDateTime,
}

impl Processor<DeferSyncIntent> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:DeferSyncIntent")]
    async fn process(&self, query: DeferSyncIntent) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE panel_sync_outbox
            SET intentos = intentos + 1,
                ultimo_error = $3,
                siguiente_intento = $4,
                fecha_modificacion = now()
            WHERE id_registro = $1 AND id_panel = $2
            "#,
        )
        .bind(query.id_registro)
        .bind(query.id_panel)
        .bind(query.error)
        .bind(query.next_attempt)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DropSyncIntent {
    pub id_registro: Uuid,
    pub id_panel: Uuid,
}

impl Processor<DropSyncIntent> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:DropSyncIntent")]
    async fn process(&self, query: DropSyncIntent) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM panel_sync_outbox WHERE id_registro = $1 AND id_panel = $2")
            .bind(query.id_registro)
            .bind(query.id_panel)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ListDueSyncIntents {
    pub now: OffsetDateTime,
    pub limit: i64,
}

impl Processor<ListDueSyncIntents> for DatabaseProcessor {
    type Output = Vec<SyncIntent>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListDueSyncIntents")]
    async fn process(&self, query: ListDueSyncIntents) -> Result<Vec<SyncIntent>, sqlx::Error> {
        let rows = sqlx::query_as::<_, SyncIntentRow>(
            r#"
            SELECT id_registro, id_panel, accion, intentos, ultimo_error, siguiente_intento
            FROM panel_sync_outbox
            WHERE siguiente_intento <= $1
            ORDER BY siguiente_intento
            LIMIT $2
            "#,
        )
        .bind(query.now)
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let accion = SyncAction::from_code(row.accion).ok_or_else(|| {
                    sqlx::Error::Decode(format!("unknown sync action {}", row.accion).into())
                })?;
                Ok(SyncIntent {
                    id_registro: row.id_registro,
                    id_panel: row.id_panel,
                    accion,
                    intentos: row.intentos,
                    ultimo_error: row.ultimo_error,
                    siguiente_intento: row.siguiente_intento,
                })
            })
            .collect()
    }
}
