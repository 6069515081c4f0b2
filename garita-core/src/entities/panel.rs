use crate::framework::DatabaseProcessor;
use crate::utils::clock::{ClockCalibration, SkewObservation};
use kanau::processor::Processor;
use time::OffsetDateTime;
use uuid::Uuid;

/// A facial-recognition access panel.
///
/// `contrasena` is sealed; it is opened per device call and never kept.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct AccessPanel {
    pub id: Uuid,
    pub nombre: String,
    pub id_acceso: Uuid,
    pub direccion_ip: String,
    pub usuario: String,
    pub contrasena: String,
    pub activo: bool,
    pub habilitar_citas: bool,
    pub reloj_offset_segundos: i32,
    pub reloj_alerta_activa: bool,
    pub reloj_ultimo_desfase_segundos: Option<i32>,
    pub reloj_ultima_muestra: Option<OffsetDateTime>,
}

impl AccessPanel {
    /// Whether registrations for `access_ids` are mirrored to this panel.
    pub fn syncs_for(&self, access_ids: &[Uuid]) -> bool {
        self.activo && self.habilitar_citas && access_ids.contains(&self.id_acceso)
    }
}

const PANEL_COLUMNS: &str = "id, nombre, id_acceso, direccion_ip, usuario, contrasena, activo, \
     habilitar_citas, reloj_offset_segundos, reloj_alerta_activa, reloj_ultimo_desfase_segundos, \
     reloj_ultima_muestra";

#[derive(Debug, Clone)]
pub struct ListPanels;

impl Processor<ListPanels> for DatabaseProcessor {
    type Output = Vec<AccessPanel>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListPanels")]
    async fn process(&self, _query: ListPanels) -> Result<Vec<AccessPanel>, sqlx::Error> {
        let sql = format!("SELECT {PANEL_COLUMNS} FROM access_panels ORDER BY nombre");
        sqlx::query_as::<_, AccessPanel>(&sql)
            .fetch_all(&self.pool)
            .await
    }
}

#[derive(Debug, Clone)]
pub struct GetPanelById {
    pub id: Uuid,
}

impl Processor<GetPanelById> for DatabaseProcessor {
    type Output = Option<AccessPanel>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetPanelById")]
    async fn process(&self, query: GetPanelById) -> Result<Option<AccessPanel>, sqlx::Error> {
        let sql = format!("SELECT {PANEL_COLUMNS} FROM access_panels WHERE id = $1");
        sqlx::query_as::<_, AccessPanel>(&sql)
            .bind(query.id)
            .fetch_optional(&self.pool)
            .await
    }
}

#[derive(Debug, Clone)]
/// Active, appointment-enabled panels guarding any of `access_ids`.
pub struct ListSyncPanels {
    pub access_ids: Vec<Uuid>,
}

impl Processor<ListSyncPanels> for DatabaseProcessor {
    type Output = Vec<AccessPanel>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListSyncPanels")]
    async fn process(&self, query: ListSyncPanels) -> Result<Vec<AccessPanel>, sqlx::Error> {
        if query.access_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {PANEL_COLUMNS} FROM access_panels \
             WHERE activo AND habilitar_citas AND id_acceso = ANY($1) \
             ORDER BY nombre"
        );
        sqlx::query_as::<_, AccessPanel>(&sql)
            .bind(query.access_ids)
            .fetch_all(&self.pool)
            .await
    }
}

#[derive(Debug, Clone)]
pub struct SaveClockCalibration {
    pub id: Uuid,
    pub calibration: ClockCalibration,
}

impl Processor<SaveClockCalibration> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:SaveClockCalibration")]
    async fn process(&self, query: SaveClockCalibration) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE access_panels
            SET reloj_offset_segundos = $2,
                reloj_alerta_activa = $3,
                reloj_ultimo_desfase_segundos = $4,
                reloj_ultima_muestra = $5
            WHERE id = $1
            "#,
        )
        .bind(query.id)
        .bind(query.calibration.offset_segundos)
        .bind(query.calibration.alerta)
        .bind(query.calibration.ultimo_desfase_segundos)
        .bind(query.calibration.ultima_muestra)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RecordSkewObservation {
    pub id: Uuid,
    pub observation: SkewObservation,
}

impl Processor<RecordSkewObservation> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:RecordSkewObservation")]
    async fn process(&self, query: RecordSkewObservation) -> Result<(), sqlx::Error> {
        let observation = query.observation;
        sqlx::query(
            r#"
            UPDATE access_panels
            SET reloj_alerta_activa = $2,
                reloj_ultimo_desfase_segundos = $3,
                reloj_ultima_muestra = $4,
                reloj_offset_segundos = COALESCE($5, reloj_offset_segundos)
            WHERE id = $1
            "#,
        )
        .bind(query.id)
        .bind(observation.alerta)
        .bind(observation.desfase_segundos)
        .bind(observation.muestra)
        .bind(observation.offset_detectado)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
