//! Registration operations behind the HTTP surface.
//!
//! Appends go through the [`Ledger`]. Panel mirroring follows each append
//! when the integration is enabled: a terminal event queues a Delete and a
//! grant queues an Upsert. A failure to queue is logged and never fails the
//! business operation.

use crate::config::LifecycleConfig;
use crate::entities::{CheckType, Registration, Role, SyncAction};
use crate::events::{PanelSyncJobSender, StateChangedSender, publish_state_changed};
use crate::ledger::{
    AppendPrecondition, Appended, EventDraft, Ledger, LedgerError, LedgerStore, PanelStore,
};
use crate::permissions::{check_validity, permitir_acceso, se_puede_finalizar};
use crate::processors::panel_sync::request_panel_sync;
use garita_sdk::objects::{RegistrationStatusResponse, Validity};
use time::OffsetDateTime;
use tracing::error;
use uuid::Uuid;

#[derive(Clone)]
pub struct RegistrationService<S> {
    ledger: Ledger<S>,
    sync_tx: PanelSyncJobSender,
    notify_tx: StateChangedSender,
}

impl<S> RegistrationService<S>
where
    S: LedgerStore + PanelStore,
{
    pub fn new(store: S, sync_tx: PanelSyncJobSender, notify_tx: StateChangedSender) -> Self {
        Self {
            ledger: Ledger::new(store),
            sync_tx,
            notify_tx,
        }
    }

    /// Status projection with the derived permissions of the caller.
    pub async fn status(
        &self,
        id: Uuid,
        roles: &[Role],
        access_point: Option<Uuid>,
    ) -> Result<RegistrationStatusResponse, LedgerError> {
        let view = self.ledger.view(id).await?;
        let accesos = &view.registration.accesos;
        Ok(RegistrationStatusResponse {
            id,
            codigo: view.registration.codigo.to_string(),
            activo: view.registration.activo,
            estatus_actual: view.current_status(),
            total_eventos: view.events.len(),
            permitir_acceso: access_point
                .is_some_and(|point| permitir_acceso(accesos, roles, point)),
            se_puede_finalizar: se_puede_finalizar(accesos, &view.events),
        })
    }

    pub async fn validity(
        &self,
        id: Uuid,
        config: &LifecycleConfig,
        now: OffsetDateTime,
    ) -> Result<Validity, LedgerError> {
        let view = self.ledger.view(id).await?;
        Ok(check_validity(
            &view.registration,
            &view.events,
            config,
            now,
        ))
    }

    /// Append an operator or gate event.
    pub async fn append(
        &self,
        id: Uuid,
        draft: EventDraft,
        config: &LifecycleConfig,
        now: OffsetDateTime,
    ) -> Result<Appended, LedgerError> {
        let appended = self
            .ledger
            .append_event(id, draft, AppendPrecondition::Any, now)
            .await?;
        self.after_append(id, &appended, config, now).await;
        Ok(appended)
    }

    /// Finalize (9) or cancel (8) a registration that is still active.
    pub async fn close(
        &self,
        id: Uuid,
        tipo_check: CheckType,
        comentario: Option<String>,
        config: &LifecycleConfig,
        now: OffsetDateTime,
    ) -> Result<Appended, LedgerError> {
        let draft = EventDraft {
            comentario,
            ..EventDraft::system(tipo_check)
        };
        let appended = self
            .ledger
            .append_event(id, draft, AppendPrecondition::RequireActive, now)
            .await?;
        self.after_append(id, &appended, config, now).await;
        Ok(appended)
    }

    /// Queue an Upsert of an active registration on its panels.
    pub async fn request_upsert(
        &self,
        id: Uuid,
        config: &LifecycleConfig,
        now: OffsetDateTime,
    ) -> Result<bool, LedgerError> {
        let registration = self
            .ledger
            .store()
            .registration(id)
            .await?
            .ok_or(LedgerError::NotFound(id))?;
        if !registration.activo {
            return Err(LedgerError::Inactive(id));
        }
        if !config.panel_integration_enabled {
            return Ok(false);
        }
        request_panel_sync(
            self.ledger.store(),
            &self.sync_tx,
            &registration,
            SyncAction::Upsert,
            now,
        )
        .await?;
        Ok(true)
    }

    async fn after_append(
        &self,
        id: Uuid,
        appended: &Appended,
        config: &LifecycleConfig,
        now: OffsetDateTime,
    ) {
        publish_state_changed(&self.notify_tx, id);

        let action = match appended.event.tipo_check {
            _ if appended.deactivated => SyncAction::Delete,
            CheckType::Granted => SyncAction::Upsert,
            _ => return,
        };
        if !config.panel_integration_enabled {
            return;
        }
        let registration = match self.ledger.store().registration(id).await {
            Ok(Some(registration)) => registration,
            Ok(None) => return,
            Err(e) => {
                error!(registration_id = %id, error = %e, "Failed to reload registration for panel sync");
                return;
            }
        };
        if action == SyncAction::Upsert && !registration.activo {
            return;
        }
        self.queue(&registration, action, now).await;
    }

    async fn queue(&self, registration: &Registration, action: SyncAction, now: OffsetDateTime) {
        if let Err(e) =
            request_panel_sync(self.ledger.store(), &self.sync_tx, registration, action, now).await
        {
            error!(
                registration_id = %registration.id,
                action = %action,
                error = %e,
                "Failed to queue panel sync"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_lifecycle;
    use crate::entities::DeviceKind;
    use crate::events::{panel_sync_channel, state_changed_channel};
    use crate::ledger::memory::{
        MemoryStore, PANEL_GATE, RECEPTION_GATE, panel_fixture, registration_fixture,
    };
    use time::Duration;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-03-01 10:00 UTC);

    struct Fixture {
        store: MemoryStore,
        service: RegistrationService<MemoryStore>,
        jobs: crate::events::PanelSyncJobReceiver,
        notes: crate::events::StateChangedReceiver,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::default();
        store.insert_registration(registration_fixture(1, NOW));
        store.insert_panel(panel_fixture(1, PANEL_GATE, String::new()));
        let (sync_tx, jobs) = panel_sync_channel();
        let (notify_tx, notes) = state_changed_channel();
        let service = RegistrationService::new(store.clone(), sync_tx, notify_tx);
        Fixture {
            store,
            service,
            jobs,
            notes,
        }
    }

    fn movement(tipo_check: CheckType, id_acceso: Uuid) -> EventDraft {
        EventDraft {
            tipo_dispositivo: DeviceKind::Qr,
            id_acceso: Some(id_acceso),
            ..EventDraft::system(tipo_check)
        }
    }

    #[tokio::test]
    async fn test_grant_queues_upsert_and_notifies() {
        let mut f = fixture();
        let id = Uuid::from_u128(1);
        f.service
            .append(id, EventDraft::system(CheckType::Granted), &test_lifecycle(), NOW)
            .await
            .unwrap();

        let job = f.jobs.try_recv().unwrap();
        assert_eq!(job.action, SyncAction::Upsert);
        assert_eq!(f.notes.try_recv().unwrap().registration_id, id);
        let intent = f.store.sync_intent(id, Uuid::from_u128(0xB001)).unwrap();
        assert_eq!(intent.accion, SyncAction::Upsert);
    }

    #[tokio::test]
    async fn test_close_rejects_inactive_and_queues_delete() {
        let mut f = fixture();
        let id = Uuid::from_u128(1);
        let config = test_lifecycle();
        let closed = f
            .service
            .close(id, CheckType::Finalized, Some("salida".into()), &config, NOW)
            .await
            .unwrap();
        assert!(closed.deactivated);
        assert_eq!(closed.event.comentario.as_deref(), Some("salida"));
        assert_eq!(f.jobs.try_recv().unwrap().action, SyncAction::Delete);

        let again = f
            .service
            .close(id, CheckType::Cancelled, None, &config, NOW)
            .await;
        assert!(matches!(again, Err(LedgerError::Inactive(_))));
        assert_eq!(f.store.events_of(id).len(), 1);
        assert!(matches!(
            f.service.request_upsert(id, &config, NOW).await,
            Err(LedgerError::Inactive(_))
        ));
    }

    #[tokio::test]
    async fn test_finalize_stamps_exit_time() {
        let f = fixture();
        let scheduled = NOW + Duration::hours(3);
        f.store.insert_registration(registration_fixture(2, NOW));
        for n in [1, 2] {
            f.store
                .update_registration(Uuid::from_u128(n), |r| r.fecha_salida = Some(scheduled));
        }
        let config = test_lifecycle();
        let at = NOW + Duration::minutes(40);

        f.service
            .close(Uuid::from_u128(1), CheckType::Finalized, None, &config, at)
            .await
            .unwrap();
        f.service
            .close(Uuid::from_u128(2), CheckType::Cancelled, None, &config, at)
            .await
            .unwrap();

        let finalized = f.store.registration_snapshot(Uuid::from_u128(1)).unwrap();
        assert_eq!(finalized.fecha_salida, Some(at));
        let cancelled = f.store.registration_snapshot(Uuid::from_u128(2)).unwrap();
        assert_eq!(cancelled.fecha_salida, Some(scheduled));
    }

    #[tokio::test]
    async fn test_disabled_integration_queues_nothing() {
        let mut f = fixture();
        let mut config = test_lifecycle();
        config.panel_integration_enabled = false;
        let id = Uuid::from_u128(1);
        f.service
            .close(id, CheckType::Cancelled, None, &config, NOW)
            .await
            .unwrap();
        assert!(f.jobs.try_recv().is_err());
        assert_eq!(f.store.outbox_len(), 0);
    }

    #[tokio::test]
    async fn test_status_projection() {
        let f = fixture();
        let id = Uuid::from_u128(1);
        let config = test_lifecycle();
        for (check, point) in [
            (CheckType::Entry, PANEL_GATE),
            (CheckType::Exit, PANEL_GATE),
            (CheckType::Entry, RECEPTION_GATE),
            (CheckType::Exit, RECEPTION_GATE),
        ] {
            f.service
                .append(id, movement(check, point), &config, NOW)
                .await
                .unwrap();
        }

        let status = f
            .service
            .status(id, &[Role::Reception], Some(PANEL_GATE))
            .await
            .unwrap();
        assert!(status.activo);
        assert_eq!(status.codigo, "VST0001");
        assert_eq!(status.estatus_actual, Some(CheckType::Exit));
        assert_eq!(status.total_eventos, 4);
        assert!(status.permitir_acceso);
        assert!(status.se_puede_finalizar);

        let visitor = f
            .service
            .status(id, &[Role::Visitor], Some(PANEL_GATE))
            .await
            .unwrap();
        assert!(!visitor.permitir_acceso);
        let unspecified = f.service.status(id, &[Role::Admin], None).await.unwrap();
        assert!(!unspecified.permitir_acceso);
    }

    #[tokio::test]
    async fn test_validity_and_missing_registration() {
        let f = fixture();
        let config = test_lifecycle();
        let id = Uuid::from_u128(1);
        assert_eq!(
            f.service.validity(id, &config, NOW).await.unwrap(),
            Validity::NoHistory
        );
        f.service
            .append(id, EventDraft::system(CheckType::Granted), &config, NOW)
            .await
            .unwrap();
        assert_eq!(
            f.service.validity(id, &config, NOW).await.unwrap(),
            Validity::Valid
        );
        assert!(matches!(
            f.service.validity(Uuid::from_u128(99), &config, NOW).await,
            Err(LedgerError::NotFound(_))
        ));
    }
}
