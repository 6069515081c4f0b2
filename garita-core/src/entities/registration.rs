use crate::entities::AccessMode;
use crate::framework::DatabaseProcessor;
use bytes::Bytes;
use compact_str::CompactString;
use itertools::Itertools;
use kanau::processor::Processor;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use sqlx::types::Json;
use time::OffsetDateTime;
use uuid::Uuid;

/// An access point a registration may use, and how it is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessGrant {
    pub id_acceso: Uuid,
    pub modo: AccessMode,
}

/// One appointment or walk-in visit.
///
/// `estatus` lists event ids in append order and is only ever extended by
/// [`Registration::link_event_tx`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: Uuid,
    pub codigo: CompactString,
    pub nombre: String,
    pub img_usuario: Option<Bytes>,
    pub accesos: SmallVec<[AccessGrant; 4]>,
    pub estatus: Vec<Uuid>,
    pub activo: bool,
    pub fecha_entrada: OffsetDateTime,
    pub fecha_salida: Option<OffsetDateTime>,
    pub fecha_modificacion: OffsetDateTime,
    pub version: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct RegistrationRow {
    id: Uuid,
    codigo: CompactString,
    nombre: String,
    img_usuario: Option<Vec<u8>>,
    accesos: Json<Vec<AccessGrant>>,
    estatus: Vec<Uuid>,
    activo: bool,
    fecha_entrada: OffsetDateTime,
    fecha_salida: Option<OffsetDateTime>,
    fecha_modificacion: OffsetDateTime,
    version: i64,
}

impl From<RegistrationRow> for Registration {
    fn from(row: RegistrationRow) -> Self {
        Self {
            id: row.id,
            codigo: row.codigo,
            nombre: row.nombre,
            img_usuario: row.img_usuario.map(Bytes::from),
            accesos: row.accesos.0.into_iter().collect(),
            estatus: row.estatus,
            activo: row.activo,
            fecha_entrada: row.fecha_entrada,
            fecha_salida: row.fecha_salida,
            fecha_modificacion: row.fecha_modificacion,
            version: row.version,
        }
    }
}

const REGISTRATION_COLUMNS: &str = "id, codigo, nombre, img_usuario, accesos, estatus, activo, \
     fecha_entrada, fecha_salida, fecha_modificacion, version";

impl Registration {
    /// Access points backed by a panel, without repeats.
    pub fn panel_access_ids(&self) -> Vec<Uuid> {
        self.accesos
            .iter()
            .filter(|a| a.modo == AccessMode::Panel)
            .map(|a| a.id_acceso)
            .unique()
            .collect()
    }

    /// Lock the row for the rest of the transaction and return its version.
    pub async fn lock_version_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        id: Uuid,
    ) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT version FROM registrations WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
    }

    /// Push an event id onto `estatus`, bump the version and, for terminal
    /// events, deactivate. `record_exit` stamps `fecha_salida` with `at`.
    pub async fn link_event_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        id: Uuid,
        event_id: Uuid,
        deactivate: bool,
        record_exit: bool,
        at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE registrations
            SET estatus = array_append(estatus, $2),
                activo = CASE WHEN $3 THEN FALSE ELSE activo END,
                fecha_salida = CASE WHEN $4 THEN $5 ELSE fecha_salida END,
                fecha_modificacion = $5,
                version = version + 1
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(event_id)
        .bind(deactivate)
        .bind(record_exit)
        .bind(at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GetRegistrationById {
    pub id: Uuid,
}

impl Processor<GetRegistrationById> for DatabaseProcessor {
    type Output = Option<Registration>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetRegistrationById")]
    async fn process(&self, query: GetRegistrationById) -> Result<Option<Registration>, sqlx::Error> {
        let sql = format!("SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE id = $1");
        let row = sqlx::query_as::<_, RegistrationRow>(&sql)
            .bind(query.id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Registration::from))
    }
}

#[derive(Debug, Clone)]
pub struct GetRegistrationByCode {
    pub codigo: String,
}

impl Processor<GetRegistrationByCode> for DatabaseProcessor {
    type Output = Option<Registration>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetRegistrationByCode")]
    async fn process(
        &self,
        query: GetRegistrationByCode,
    ) -> Result<Option<Registration>, sqlx::Error> {
        let sql = format!("SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE codigo = $1");
        let row = sqlx::query_as::<_, RegistrationRow>(&sql)
            .bind(query.codigo)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Registration::from))
    }
}

#[derive(Debug, Clone)]
pub struct ListActiveRegistrations;

impl Processor<ListActiveRegistrations> for DatabaseProcessor {
    type Output = Vec<Registration>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListActiveRegistrations")]
    async fn process(&self, _query: ListActiveRegistrations) -> Result<Vec<Registration>, sqlx::Error> {
        let sql = format!(
            "SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE activo ORDER BY fecha_entrada"
        );
        let rows = sqlx::query_as::<_, RegistrationRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Registration::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panel_access_ids_skip_entry_only_and_repeats() {
        let panel_gate = Uuid::from_u128(1);
        let reception = Uuid::from_u128(2);
        let registration = Registration {
            id: Uuid::from_u128(10),
            codigo: "VST0001".into(),
            nombre: "Visitante".into(),
            img_usuario: None,
            accesos: smallvec::smallvec![
                AccessGrant { id_acceso: panel_gate, modo: AccessMode::Panel },
                AccessGrant { id_acceso: reception, modo: AccessMode::EntryOnly },
                AccessGrant { id_acceso: panel_gate, modo: AccessMode::Panel },
            ],
            estatus: vec![],
            activo: true,
            fecha_entrada: OffsetDateTime::UNIX_EPOCH,
            fecha_salida: None,
            fecha_modificacion: OffsetDateTime::UNIX_EPOCH,
            version: 0,
        };
        assert_eq!(registration.panel_access_ids(), vec![panel_gate]);
    }
}
