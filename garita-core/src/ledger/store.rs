//! Storage seams used by the ledger, the jobs and ingestion.

use crate::entities::{AccessPanel, Event, PanelEventKey, Registration, SyncAction, SyncIntent};
use crate::entities::event::ClockSample;
use crate::utils::clock::{ClockCalibration, SkewObservation};
use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Failures worth retrying immediately: pool exhaustion and I/O.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) => true,
            StoreError::Database(_) => false,
            StoreError::Unavailable(_) => true,
        }
    }
}

/// An event ready to be persisted, guarded by the registration version the
/// caller observed.
#[derive(Debug, Clone)]
pub struct AppendCommit {
    pub event: Event,
    pub expected_version: i64,
    pub deactivate: bool,
    /// Stamp `fecha_salida` with the event time.
    pub record_exit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The registration moved past `expected_version`; nothing was written.
    VersionConflict,
    Missing,
    /// Another event already carries the same panel report key; nothing was
    /// written.
    DuplicateReport,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn registration(&self, id: Uuid) -> Result<Option<Registration>, StoreError>;

    async fn registration_by_code(&self, codigo: &str)
    -> Result<Option<Registration>, StoreError>;

    async fn active_registrations(&self) -> Result<Vec<Registration>, StoreError>;

    /// Up to `limit` events of a registration, newest first.
    async fn recent_events(&self, id_registro: Uuid, limit: usize)
    -> Result<Vec<Event>, StoreError>;

    /// All events of a registration in `estatus` order.
    async fn registration_events(&self, id_registro: Uuid) -> Result<Vec<Event>, StoreError>;

    async fn panel_event_exists(&self, key: &PanelEventKey) -> Result<bool, StoreError>;

    async fn last_panel_movement(
        &self,
        id_registro: Uuid,
        id_panel: Option<Uuid>,
        until: OffsetDateTime,
    ) -> Result<Option<Event>, StoreError>;

    async fn has_entry_between(
        &self,
        id_registro: Uuid,
        id_panel: Option<Uuid>,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> Result<bool, StoreError>;

    /// Insert the event and link it onto `estatus` in one atomic step.
    async fn commit_append(&self, commit: AppendCommit) -> Result<CommitOutcome, StoreError>;
}

#[async_trait]
pub trait PanelStore: Send + Sync {
    async fn panels(&self) -> Result<Vec<AccessPanel>, StoreError>;

    async fn panel(&self, id: Uuid) -> Result<Option<AccessPanel>, StoreError>;

    /// Active, appointment-enabled panels guarding any of `access_ids`.
    async fn sync_panels_for(&self, access_ids: &[Uuid]) -> Result<Vec<AccessPanel>, StoreError>;

    async fn clock_samples(
        &self,
        id_panel: Uuid,
        since: OffsetDateTime,
    ) -> Result<Vec<ClockSample>, StoreError>;

    async fn save_calibration(
        &self,
        id_panel: Uuid,
        calibration: ClockCalibration,
    ) -> Result<(), StoreError>;

    async fn record_skew(
        &self,
        id_panel: Uuid,
        observation: SkewObservation,
    ) -> Result<(), StoreError>;

    async fn record_sync_intent(
        &self,
        id_registro: Uuid,
        id_panel: Uuid,
        accion: SyncAction,
        now: OffsetDateTime,
    ) -> Result<(), StoreError>;

    async fn confirm_sync_intent(
        &self,
        id_registro: Uuid,
        id_panel: Uuid,
        accion: SyncAction,
    ) -> Result<(), StoreError>;

    async fn defer_sync_intent(
        &self,
        id_registro: Uuid,
        id_panel: Uuid,
        error: String,
        next_attempt: OffsetDateTime,
    ) -> Result<(), StoreError>;

    async fn drop_sync_intent(&self, id_registro: Uuid, id_panel: Uuid) -> Result<(), StoreError>;

    async fn due_sync_intents(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<SyncIntent>, StoreError>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Deactivate every expired document; returns how many changed.
    async fn expire_documents(&self, now: OffsetDateTime) -> Result<u64, StoreError>;
}
