//! ExpirationScheduler processor.
//!
//! Every 20 seconds the ExpirationScheduler re-evaluates each active
//! registration from durable state:
//! - No exit yet, still pending past the entry and cancellation tolerances:
//!   auto-cancel (12)
//! - Exit recorded and quiet past the tolerances: auto-finalize (10)
//! - Entry left open for more than 14 hours: auto-cancel (12)
//!
//! Closed registrations are queued for panel deletion and announced on the
//! state-changed channel. Appends require the registration to still be
//! active, so a second pass never adds another terminal event.

use crate::config::{LifecycleConfig, LifecycleStore};
use crate::entities::{CheckType, Event, Registration, SyncAction};
use crate::events::{PanelSyncJobSender, StateChangedSender, publish_state_changed};
use crate::ledger::{
    AppendPrecondition, EventDraft, Ledger, LedgerError, LedgerStore, PanelStore, StoreError,
};
use crate::processors::panel_sync::request_panel_sync;
use time::{Duration, OffsetDateTime};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Hard ceiling for an entry without a matching exit, independent of the
/// configured tolerances.
pub const MAX_OPEN_ENTRY: Duration = Duration::hours(14);
/// Events inspected per registration.
pub const RECENT_EVENT_WINDOW: usize = 10;

const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(20);

/// Decide whether a registration must be closed. `recent` is newest first.
pub fn evaluate(
    registration: &Registration,
    recent: &[Event],
    config: &LifecycleConfig,
    now: OffsetDateTime,
) -> Option<CheckType> {
    let last = recent.first()?;
    let entry_tolerance = config.entry_tolerance.duration();
    let cancellation_tolerance = config.cancellation_tolerance.duration();
    let has_activity = recent.iter().any(|e| e.tipo_check == CheckType::Exit);
    let since_last = now - (last.fecha_creacion + entry_tolerance);

    match (has_activity, last.tipo_check) {
        (false, CheckType::Pending)
            if now - (registration.fecha_entrada + entry_tolerance) > cancellation_tolerance =>
        {
            Some(CheckType::AutoCancelled)
        }
        (true, CheckType::Exit) if since_last > cancellation_tolerance => {
            Some(CheckType::AutoFinalized)
        }
        (_, CheckType::Entry) if since_last > MAX_OPEN_ENTRY => Some(CheckType::AutoCancelled),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evaluated: usize,
    pub auto_cancelled: usize,
    pub auto_finalized: usize,
    pub failed: usize,
}

/// One sweep over the active registrations.
#[derive(Clone)]
pub struct ExpirationSweep<S> {
    ledger: Ledger<S>,
    sync_tx: PanelSyncJobSender,
    notify_tx: StateChangedSender,
}

impl<S> ExpirationSweep<S>
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

    /// Evaluate every active registration. A failure on one registration is
    /// logged and does not stop the others.
    pub async fn sweep(
        &self,
        config: &LifecycleConfig,
        now: OffsetDateTime,
    ) -> Result<SweepReport, StoreError> {
        let registrations = self.ledger.store().active_registrations().await?;
        let mut report = SweepReport {
            evaluated: registrations.len(),
            ..SweepReport::default()
        };

        for registration in &registrations {
            match self.sweep_one(registration, config, now).await {
                Ok(Some(CheckType::AutoFinalized)) => report.auto_finalized += 1,
                Ok(Some(_)) => report.auto_cancelled += 1,
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    error!(
                        registration_id = %registration.id,
                        error = %e,
                        "Failed to evaluate registration expiry"
                    );
                }
            }
        }

        if report.auto_cancelled + report.auto_finalized + report.failed > 0 {
            info!(
                evaluated = report.evaluated,
                auto_cancelled = report.auto_cancelled,
                auto_finalized = report.auto_finalized,
                failed = report.failed,
                "Expiration sweep finished"
            );
        }
        Ok(report)
    }

    async fn sweep_one(
        &self,
        registration: &Registration,
        config: &LifecycleConfig,
        now: OffsetDateTime,
    ) -> Result<Option<CheckType>, LedgerError> {
        let recent = self
            .ledger
            .store()
            .recent_events(registration.id, RECENT_EVENT_WINDOW)
            .await?;
        let Some(check) = evaluate(registration, &recent, config, now) else {
            return Ok(None);
        };

        let appended = match self
            .ledger
            .append_event(
                registration.id,
                EventDraft::system(check),
                AppendPrecondition::RequireActive,
                now,
            )
            .await
        {
            Ok(appended) => appended,
            Err(LedgerError::Inactive(_)) => {
                debug!(registration_id = %registration.id, "Registration closed concurrently");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        info!(
            registration_id = %registration.id,
            codigo = %registration.codigo,
            tipo_check = check.code(),
            "Registration closed by expiration"
        );

        if appended.deactivated && config.panel_integration_enabled {
            if let Err(e) = request_panel_sync(
                self.ledger.store(),
                &self.sync_tx,
                registration,
                SyncAction::Delete,
                now,
            )
            .await
            {
                warn!(
                    registration_id = %registration.id,
                    error = %e,
                    "Failed to queue panel deletion"
                );
            }
        }
        publish_state_changed(&self.notify_tx, registration.id);
        Ok(Some(check))
    }
}

/// ExpirationScheduler runs the sweep on a fixed interval.
pub struct ExpirationScheduler<S> {
    sweep: ExpirationSweep<S>,
    lifecycle: LifecycleStore,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S> ExpirationScheduler<S>
where
    S: LedgerStore + PanelStore,
{
    pub fn new(
        sweep: ExpirationSweep<S>,
        lifecycle: LifecycleStore,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            sweep,
            lifecycle,
            shutdown_rx,
        }
    }

    /// Run the ExpirationScheduler.
    pub async fn run(mut self) {
        info!("ExpirationScheduler started");

        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("ExpirationScheduler received shutdown signal");
                        break;
                    }
                }

                _ = tick.tick() => {
                    let config = self.lifecycle.snapshot().await;
                    if let Err(e) = self.sweep.sweep(&config, OffsetDateTime::now_utc()).await {
                        error!(error = %e, "Expiration sweep failed");
                    }
                }
            }
        }

        info!("ExpirationScheduler shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Tolerance, ToleranceUnit, test_lifecycle};
    use crate::entities::{DeviceKind, EventSubject};
    use crate::events::{panel_sync_channel, state_changed_channel};
    use crate::ledger::memory::{
        MemoryStore, PANEL_GATE, RECEPTION_GATE, panel_fixture, registration_fixture,
    };
    use crate::panel::fake::{Call, RecordingPanelClient};
    use crate::processors::panel_sync::PanelSync;
    use garita_sdk::credentials::CredentialCipher;
    use time::macros::datetime;
    use uuid::Uuid;

    const NOW: OffsetDateTime = datetime!(2026-03-01 10:00 UTC);

    fn event(check: CheckType, at: OffsetDateTime) -> Event {
        Event {
            id: Uuid::now_v7(),
            subject: EventSubject::Registration(Uuid::from_u128(1)),
            tipo_check: check,
            tipo_dispositivo: DeviceKind::System,
            id_acceso: None,
            id_panel: None,
            comentario: None,
            skew: None,
            fecha_creacion: at,
        }
    }

    #[test]
    fn test_pending_past_tolerances_is_cancelled() {
        let config = test_lifecycle();
        let reg = registration_fixture(1, NOW - Duration::hours(2));
        let recent = [event(CheckType::Pending, NOW - Duration::hours(3))];
        assert_eq!(evaluate(&reg, &recent, &config, NOW), Some(CheckType::AutoCancelled));

        let reg = registration_fixture(1, NOW - Duration::hours(1));
        assert_eq!(evaluate(&reg, &recent, &config, NOW), None);
    }

    #[test]
    fn test_quiet_exit_is_finalized() {
        let config = test_lifecycle();
        let reg = registration_fixture(1, NOW - Duration::hours(4));
        let recent = [
            event(CheckType::Exit, NOW - Duration::minutes(91)),
            event(CheckType::Entry, NOW - Duration::hours(3)),
        ];
        assert_eq!(evaluate(&reg, &recent, &config, NOW), Some(CheckType::AutoFinalized));

        let recent = [
            event(CheckType::Exit, NOW - Duration::minutes(89)),
            event(CheckType::Entry, NOW - Duration::hours(3)),
        ];
        assert_eq!(evaluate(&reg, &recent, &config, NOW), None);
    }

    #[test]
    fn test_open_entry_hits_ceiling() {
        let config = test_lifecycle();
        let reg = registration_fixture(1, NOW - Duration::hours(20));
        let stale = [event(CheckType::Entry, NOW - Duration::hours(14) - Duration::minutes(31))];
        assert_eq!(evaluate(&reg, &stale, &config, NOW), Some(CheckType::AutoCancelled));

        let fresh = [event(CheckType::Entry, NOW - Duration::hours(14))];
        assert_eq!(evaluate(&reg, &fresh, &config, NOW), None);

        // Re-entry after an earlier exit is held to the same ceiling.
        let reentry = [
            event(CheckType::Entry, NOW - Duration::hours(15)),
            event(CheckType::Exit, NOW - Duration::hours(16)),
        ];
        assert_eq!(evaluate(&reg, &reentry, &config, NOW), Some(CheckType::AutoCancelled));
    }

    #[test]
    fn test_ceiling_ignores_large_configured_tolerance() {
        let mut config = test_lifecycle();
        config.cancellation_tolerance = Tolerance::new(2, ToleranceUnit::Day);
        let reg = registration_fixture(1, NOW - Duration::hours(20));

        let open_entry = [event(CheckType::Entry, NOW - Duration::hours(15))];
        assert_eq!(evaluate(&reg, &open_entry, &config, NOW), Some(CheckType::AutoCancelled));

        let quiet_exit = [
            event(CheckType::Exit, NOW - Duration::hours(15)),
            event(CheckType::Entry, NOW - Duration::hours(16)),
        ];
        assert_eq!(evaluate(&reg, &quiet_exit, &config, NOW), None);
    }

    #[test]
    fn test_other_states_are_left_alone() {
        let config = test_lifecycle();
        let reg = registration_fixture(1, NOW - Duration::days(3));
        for check in [CheckType::Granted, CheckType::AwaitingValidation, CheckType::Undefined] {
            let recent = [event(check, NOW - Duration::days(3))];
            assert_eq!(evaluate(&reg, &recent, &config, NOW), None);
        }
        assert_eq!(evaluate(&reg, &[], &config, NOW), None);
    }

    async fn stale_pending(store: &MemoryStore, n: u128) -> Registration {
        let reg = registration_fixture(n, NOW - Duration::hours(2));
        store.insert_registration(reg.clone());
        Ledger::new(store.clone())
            .append_event(
                reg.id,
                EventDraft::system(CheckType::Pending),
                AppendPrecondition::Any,
                NOW - Duration::hours(3),
            )
            .await
            .unwrap();
        reg
    }

    #[tokio::test]
    async fn test_stale_pending_is_cancelled_and_removed_from_panels() {
        let store = MemoryStore::default();
        let cipher = CredentialCipher::from_secret("test-key").unwrap();
        let gate = panel_fixture(1, PANEL_GATE, cipher.seal("pw").unwrap());
        store.insert_panel(gate.clone());
        store.insert_panel(panel_fixture(2, RECEPTION_GATE, cipher.seal("pw").unwrap()));
        let reg = stale_pending(&store, 1).await;

        let (sync_tx, mut sync_rx) = panel_sync_channel();
        let (notify_tx, mut notify_rx) = state_changed_channel();
        let sweep = ExpirationSweep::new(store.clone(), sync_tx, notify_tx);
        let config = test_lifecycle();

        let report = sweep.sweep(&config, NOW).await.unwrap();
        assert_eq!(report.auto_cancelled, 1);

        let stored = store.registration_snapshot(reg.id).unwrap();
        assert!(!stored.activo);
        let events = store.events_of(reg.id);
        assert_eq!(events.last().unwrap().tipo_check, CheckType::AutoCancelled);
        assert_eq!(notify_rx.recv().await.unwrap().registration_id, reg.id);

        let job = sync_rx.try_recv().unwrap();
        assert_eq!(job.action, SyncAction::Delete);
        let client = RecordingPanelClient::default();
        PanelSync::new(store.clone(), client.clone(), cipher)
            .sync_registration(&stored, &config, NOW)
            .await
            .unwrap();
        assert_eq!(client.calls(), vec![Call::Delete(gate.id, "VST0001".into())]);
    }

    #[tokio::test]
    async fn test_second_sweep_adds_nothing() {
        let store = MemoryStore::default();
        let reg = stale_pending(&store, 1).await;
        let (sync_tx, _sync_rx) = panel_sync_channel();
        let (notify_tx, _notify_rx) = state_changed_channel();
        let sweep = ExpirationSweep::new(store.clone(), sync_tx, notify_tx);
        let config = test_lifecycle();

        sweep.sweep(&config, NOW).await.unwrap();
        let after_first = store.events_of(reg.id).len();
        let report = sweep.sweep(&config, NOW + Duration::seconds(20)).await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(store.events_of(reg.id).len(), after_first);
    }

    #[tokio::test]
    async fn test_failure_on_one_registration_does_not_stop_sweep() {
        let store = MemoryStore::default();
        let broken = stale_pending(&store, 1).await;
        let healthy = stale_pending(&store, 2).await;
        store.fail_reads_for(broken.id);
        let (sync_tx, _sync_rx) = panel_sync_channel();
        let (notify_tx, _notify_rx) = state_changed_channel();
        let sweep = ExpirationSweep::new(store.clone(), sync_tx, notify_tx);

        let report = sweep.sweep(&test_lifecycle(), NOW).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.auto_cancelled, 1);
        assert!(!store.registration_snapshot(healthy.id).unwrap().activo);
        assert!(store.registration_snapshot(broken.id).unwrap().activo);
    }

    #[tokio::test]
    async fn test_disabled_integration_queues_no_deletion() {
        let store = MemoryStore::default();
        let cipher = CredentialCipher::from_secret("test-key").unwrap();
        store.insert_panel(panel_fixture(1, PANEL_GATE, cipher.seal("pw").unwrap()));
        stale_pending(&store, 1).await;
        let (sync_tx, mut sync_rx) = panel_sync_channel();
        let (notify_tx, _notify_rx) = state_changed_channel();
        let sweep = ExpirationSweep::new(store.clone(), sync_tx, notify_tx);
        let mut config = test_lifecycle();
        config.panel_integration_enabled = false;

        let report = sweep.sweep(&config, NOW).await.unwrap();
        assert_eq!(report.auto_cancelled, 1);
        assert!(sync_rx.try_recv().is_err());
        assert_eq!(store.outbox_len(), 0);
    }
}
