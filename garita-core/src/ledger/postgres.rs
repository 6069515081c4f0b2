//! PostgreSQL implementation of the storage seams.

use super::store::{
    AppendCommit, CommitOutcome, DocumentStore, LedgerStore, PanelStore, StoreError,
};
use crate::entities::document::ExpireDocuments;
use crate::entities::event::{
    ClockSample, GetLastPanelMovement, HasPanelEntryBetween, ListClockSamples,
    ListRegistrationEvents, PanelEventExists,
};
use crate::entities::panel::{
    GetPanelById, ListPanels, ListSyncPanels, RecordSkewObservation, SaveClockCalibration,
};
use crate::entities::panel_sync_outbox::{
    ConfirmSyncIntent, DeferSyncIntent, DropSyncIntent, ListDueSyncIntents, RecordSyncIntent,
};
use crate::entities::registration::{
    GetRegistrationByCode, GetRegistrationById, ListActiveRegistrations,
};
use crate::entities::{AccessPanel, Event, PanelEventKey, Registration, SyncAction, SyncIntent};
use crate::framework::DatabaseProcessor;
use crate::utils::clock::{ClockCalibration, SkewObservation};
use async_trait::async_trait;
use kanau::processor::Processor;
use time::OffsetDateTime;
use uuid::Uuid;

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl LedgerStore for DatabaseProcessor {
    async fn registration(&self, id: Uuid) -> Result<Option<Registration>, StoreError> {
        Ok(self.process(GetRegistrationById { id }).await?)
    }

    async fn registration_by_code(
        &self,
        codigo: &str,
    ) -> Result<Option<Registration>, StoreError> {
        Ok(self
            .process(GetRegistrationByCode {
                codigo: codigo.to_owned(),
            })
            .await?)
    }

    async fn active_registrations(&self) -> Result<Vec<Registration>, StoreError> {
        Ok(self.process(ListActiveRegistrations).await?)
    }

    async fn recent_events(
        &self,
        id_registro: Uuid,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .process(ListRegistrationEvents {
                id_registro,
                newest_first: true,
                limit: Some(to_limit(limit)),
            })
            .await?)
    }

    async fn registration_events(&self, id_registro: Uuid) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .process(ListRegistrationEvents {
                id_registro,
                newest_first: false,
                limit: None,
            })
            .await?)
    }

    async fn panel_event_exists(&self, key: &PanelEventKey) -> Result<bool, StoreError> {
        Ok(self.process(PanelEventExists { key: key.clone() }).await?)
    }

    async fn last_panel_movement(
        &self,
        id_registro: Uuid,
        id_panel: Option<Uuid>,
        until: OffsetDateTime,
    ) -> Result<Option<Event>, StoreError> {
        Ok(self
            .process(GetLastPanelMovement {
                id_registro,
                id_panel,
                until,
            })
            .await?)
    }

    async fn has_entry_between(
        &self,
        id_registro: Uuid,
        id_panel: Option<Uuid>,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        Ok(self
            .process(HasPanelEntryBetween {
                id_registro,
                id_panel,
                since,
                until,
            })
            .await?)
    }

    #[tracing::instrument(skip_all, err, name = "SQL:CommitAppend")]
    async fn commit_append(&self, commit: AppendCommit) -> Result<CommitOutcome, StoreError> {
        let Some(id_registro) = commit.event.registration_id() else {
            return Ok(CommitOutcome::Missing);
        };

        let mut tx = self.begin().await?;
        let Some(version) = Registration::lock_version_tx(&mut tx, id_registro).await? else {
            tx.rollback().await?;
            return Ok(CommitOutcome::Missing);
        };
        if version != commit.expected_version {
            tx.rollback().await?;
            return Ok(CommitOutcome::VersionConflict);
        }

        if let Err(e) = commit.event.insert_tx(&mut tx).await {
            if is_duplicate_report(&e) {
                tx.rollback().await?;
                return Ok(CommitOutcome::DuplicateReport);
            }
            return Err(e.into());
        }
        Registration::link_event_tx(
            &mut tx,
            id_registro,
            commit.event.id,
            commit.deactivate,
            commit.record_exit,
            commit.event.fecha_creacion,
        )
        .await?;
        tx.commit().await?;
        Ok(CommitOutcome::Committed)
    }
}

/// Unique index over the panel report key of an event.
const PANEL_REPORT_INDEX: &str = "events_panel_report_idx";

fn is_duplicate_report(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation() && db.constraint() == Some(PANEL_REPORT_INDEX))
}

#[async_trait]
impl PanelStore for DatabaseProcessor {
    async fn panels(&self) -> Result<Vec<AccessPanel>, StoreError> {
        Ok(self.process(ListPanels).await?)
    }

    async fn panel(&self, id: Uuid) -> Result<Option<AccessPanel>, StoreError> {
        Ok(self.process(GetPanelById { id }).await?)
    }

    async fn sync_panels_for(&self, access_ids: &[Uuid]) -> Result<Vec<AccessPanel>, StoreError> {
        Ok(self
            .process(ListSyncPanels {
                access_ids: access_ids.to_vec(),
            })
            .await?)
    }

    async fn clock_samples(
        &self,
        id_panel: Uuid,
        since: OffsetDateTime,
    ) -> Result<Vec<ClockSample>, StoreError> {
        Ok(self.process(ListClockSamples { id_panel, since }).await?)
    }

    async fn save_calibration(
        &self,
        id_panel: Uuid,
        calibration: ClockCalibration,
    ) -> Result<(), StoreError> {
        Ok(self
            .process(SaveClockCalibration {
                id: id_panel,
                calibration,
            })
            .await?)
    }

    async fn record_skew(
        &self,
        id_panel: Uuid,
        observation: SkewObservation,
    ) -> Result<(), StoreError> {
        Ok(self
            .process(RecordSkewObservation {
                id: id_panel,
                observation,
            })
            .await?)
    }

    async fn record_sync_intent(
        &self,
        id_registro: Uuid,
        id_panel: Uuid,
        accion: SyncAction,
        now: OffsetDateTime,
    ) -> Result<(), StoreError> {
        Ok(self
            .process(RecordSyncIntent {
                id_registro,
                id_panel,
                accion,
                now,
            })
            .await?)
    }

    async fn confirm_sync_intent(
        &self,
        id_registro: Uuid,
        id_panel: Uuid,
        accion: SyncAction,
    ) -> Result<(), StoreError> {
        Ok(self
            .process(ConfirmSyncIntent {
                id_registro,
                id_panel,
                accion,
            })
            .await?)
    }

    async fn defer_sync_intent(
        &self,
        id_registro: Uuid,
        id_panel: Uuid,
        error: String,
        next_attempt: OffsetDateTime,
    ) -> Result<(), StoreError> {
        Ok(self
            .process(DeferSyncIntent {
                id_registro,
                id_panel,
                error,
                next_attempt,
            })
            .await?)
    }

    async fn drop_sync_intent(&self, id_registro: Uuid, id_panel: Uuid) -> Result<(), StoreError> {
        Ok(self
            .process(DropSyncIntent {
                id_registro,
                id_panel,
            })
            .await?)
    }

    async fn due_sync_intents(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<SyncIntent>, StoreError> {
        Ok(self
            .process(ListDueSyncIntents {
                now,
                limit: to_limit(limit),
            })
            .await?)
    }
}

#[async_trait]
impl DocumentStore for DatabaseProcessor {
    async fn expire_documents(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        Ok(self.process(ExpireDocuments { now }).await?)
    }
}
