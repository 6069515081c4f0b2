//! PanelSyncDispatcher processor.
//!
//! The PanelSyncDispatcher is responsible for:
//! - Receiving `PanelSyncJob` from the queue
//! - Selecting the active, appointment-enabled panels behind the
//!   registration's panel-mode access points
//! - Recording the wanted action in `panel_sync_outbox` before each call
//! - Calling each panel independently; a failure on one never stops the next
//! - Confirming successes and deferring failures with exponential backoff
//!   (2^1 to 2^11 seconds)
//! - Reconciling due outbox rows every 30 seconds against durable state

use crate::config::{LifecycleConfig, LifecycleStore};
use crate::entities::{AccessPanel, Registration, SyncAction, SyncIntent};
use crate::events::{PanelSyncJob, PanelSyncJobReceiver, PanelSyncJobSender};
use crate::ledger::{LedgerStore, PanelStore, StoreError};
use crate::panel::{AccessRecord, PanelClient, PanelEndpoint, PanelError};
use garita_sdk::credentials::CredentialCipher;
use time::{Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Backoff exponent cap (2^11 = 2048 seconds).
const MAX_RETRY_COUNT: u32 = 11;
/// Failed attempts after which an outbox row is abandoned.
pub const MAX_SYNC_ATTEMPTS: i32 = 12;
/// Closing bound added past `now`, so a panel never locks out a visit that
/// is still active.
pub const UPSERT_WINDOW_PAST_NOW: Duration = Duration::hours(12);

const RECONCILE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);
const RECONCILE_BATCH: usize = 64;

/// Outcome of one `sync_registration` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Panel integration was disabled; nothing was attempted.
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub confirmed: usize,
    pub deferred: usize,
    pub dropped: usize,
    pub abandoned: usize,
}

/// Device mirroring of registrations, shared by the dispatcher loop and
/// direct callers.
#[derive(Clone)]
pub struct PanelSync<S, C> {
    store: S,
    client: C,
    cipher: CredentialCipher,
}

impl<S, C> PanelSync<S, C>
where
    S: LedgerStore + PanelStore,
    C: PanelClient,
{
    pub fn new(store: S, client: C, cipher: CredentialCipher) -> Self {
        Self {
            store,
            client,
            cipher,
        }
    }

    /// Mirror `registration` onto every eligible panel. The action follows
    /// the registration as loaded: an active one is upserted, an inactive one
    /// deleted.
    ///
    /// Device failures are logged and left in the outbox; only storage
    /// failures while selecting panels are returned.
    pub async fn sync_registration(
        &self,
        registration: &Registration,
        config: &LifecycleConfig,
        now: OffsetDateTime,
    ) -> Result<SyncReport, StoreError> {
        let action = desired_action(registration);
        if !config.panel_integration_enabled {
            debug!(registration_id = %registration.id, "Panel integration disabled, skipping sync");
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        }

        let panels = self
            .store
            .sync_panels_for(&registration.panel_access_ids())
            .await?;
        let mut report = SyncReport::default();

        for panel in &panels {
            if let Err(e) = self
                .store
                .record_sync_intent(registration.id, panel.id, action, now)
                .await
            {
                warn!(
                    registration_id = %registration.id,
                    panel_id = %panel.id,
                    error = %e,
                    "Failed to record sync intent"
                );
            }

            let result = self
                .call_panel(panel, registration, action, config, now)
                .await;
            if self
                .settle(registration, panel, action, 0, result, now)
                .await
            {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(
            registration_id = %registration.id,
            action = %action,
            panels = panels.len(),
            succeeded = report.succeeded,
            failed = report.failed,
            "Panel sync finished"
        );
        Ok(report)
    }

    /// Retry due outbox rows, re-deriving the wanted action from the
    /// registration's current state.
    pub async fn reconcile(
        &self,
        config: &LifecycleConfig,
        now: OffsetDateTime,
    ) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport::default();
        if !config.panel_integration_enabled {
            return Ok(report);
        }

        let due = self.store.due_sync_intents(now, RECONCILE_BATCH).await?;
        for intent in due {
            if let Err(e) = self.reconcile_one(&intent, config, now, &mut report).await {
                error!(
                    registration_id = %intent.id_registro,
                    panel_id = %intent.id_panel,
                    error = %e,
                    "Failed to reconcile sync intent"
                );
            }
        }

        if report != ReconcileReport::default() {
            info!(
                confirmed = report.confirmed,
                deferred = report.deferred,
                dropped = report.dropped,
                abandoned = report.abandoned,
                "Panel reconciliation pass finished"
            );
        }
        Ok(report)
    }

    async fn reconcile_one(
        &self,
        intent: &SyncIntent,
        config: &LifecycleConfig,
        now: OffsetDateTime,
        report: &mut ReconcileReport,
    ) -> Result<(), StoreError> {
        if intent.intentos >= MAX_SYNC_ATTEMPTS {
            error!(
                registration_id = %intent.id_registro,
                panel_id = %intent.id_panel,
                action = %intent.accion,
                attempts = intent.intentos,
                last_error = intent.ultimo_error.as_deref().unwrap_or_default(),
                "Abandoning panel sync after repeated failures"
            );
            self.store
                .drop_sync_intent(intent.id_registro, intent.id_panel)
                .await?;
            report.abandoned += 1;
            return Ok(());
        }

        let Some(registration) = self.store.registration(intent.id_registro).await? else {
            self.store
                .drop_sync_intent(intent.id_registro, intent.id_panel)
                .await?;
            report.dropped += 1;
            return Ok(());
        };
        let panel = self
            .store
            .panel(intent.id_panel)
            .await?
            .filter(|p| p.syncs_for(&registration.panel_access_ids()));
        let Some(panel) = panel else {
            debug!(
                registration_id = %intent.id_registro,
                panel_id = %intent.id_panel,
                "Panel gone or no longer eligible, dropping sync intent"
            );
            self.store
                .drop_sync_intent(intent.id_registro, intent.id_panel)
                .await?;
            report.dropped += 1;
            return Ok(());
        };

        let desired = desired_action(&registration);
        let attempts = if desired == intent.accion {
            intent.intentos
        } else {
            self.store
                .record_sync_intent(registration.id, panel.id, desired, now)
                .await?;
            0
        };

        let result = self
            .call_panel(&panel, &registration, desired, config, now)
            .await;
        if self
            .settle(&registration, &panel, desired, attempts, result, now)
            .await
        {
            report.confirmed += 1;
        } else {
            report.deferred += 1;
        }
        Ok(())
    }

    async fn call_panel(
        &self,
        panel: &AccessPanel,
        registration: &Registration,
        action: SyncAction,
        config: &LifecycleConfig,
        now: OffsetDateTime,
    ) -> Result<(), PanelError> {
        let endpoint = PanelEndpoint::open(panel, &self.cipher)?;
        match action {
            SyncAction::Upsert => {
                let record = access_record(registration, config, now);
                let session = match record.photo {
                    Some(_) => Some(self.client.authenticate(&endpoint).await?),
                    None => None,
                };
                self.client
                    .upsert_access_record(&endpoint, &record, session.as_ref())
                    .await
            }
            SyncAction::Delete => {
                self.client
                    .delete_access_record(&endpoint, &registration.codigo)
                    .await
            }
        }
    }

    /// Confirm or defer the outbox row. Returns whether the call succeeded.
    async fn settle(
        &self,
        registration: &Registration,
        panel: &AccessPanel,
        action: SyncAction,
        previous_attempts: i32,
        result: Result<(), PanelError>,
        now: OffsetDateTime,
    ) -> bool {
        let stored = match &result {
            Ok(()) => {
                debug!(
                    registration_id = %registration.id,
                    panel_id = %panel.id,
                    action = %action,
                    "Panel sync confirmed"
                );
                self.store
                    .confirm_sync_intent(registration.id, panel.id, action)
                    .await
            }
            Err(e) => {
                let attempts = previous_attempts.saturating_add(1);
                let next_attempt = now + calculate_retry_delay(attempts.unsigned_abs());
                warn!(
                    registration_id = %registration.id,
                    panel_id = %panel.id,
                    panel = %panel.nombre,
                    action = %action,
                    kind = e.kind(),
                    retryable = e.is_retryable(),
                    attempts,
                    error = %e,
                    "Panel sync failed"
                );
                self.store
                    .defer_sync_intent(registration.id, panel.id, e.to_string(), next_attempt)
                    .await
            }
        };
        if let Err(e) = stored {
            error!(
                registration_id = %registration.id,
                panel_id = %panel.id,
                error = %e,
                "Failed to update sync intent"
            );
        }
        result.is_ok()
    }
}

/// Device-side state a registration should have right now.
pub fn desired_action(registration: &Registration) -> SyncAction {
    if registration.activo {
        SyncAction::Upsert
    } else {
        SyncAction::Delete
    }
}

/// Record pushed on upsert. The window opens `entry_tolerance` before the
/// scheduled entry and closes 12h plus `exit_tolerance` after `now`.
pub fn access_record(
    registration: &Registration,
    config: &LifecycleConfig,
    now: OffsetDateTime,
) -> AccessRecord {
    let valid_from = registration.fecha_entrada - config.entry_tolerance.duration();
    let valid_to = now + UPSERT_WINDOW_PAST_NOW + config.exit_tolerance.duration();
    AccessRecord {
        code: registration.codigo.to_string(),
        name: registration.nombre.clone(),
        valid_from: local_wall_clock(valid_from, config.utc_offset),
        valid_to: local_wall_clock(valid_to, config.utc_offset),
        photo: registration.img_usuario.clone(),
    }
}

fn local_wall_clock(at: OffsetDateTime, offset: UtcOffset) -> PrimitiveDateTime {
    let local = at.to_offset(offset);
    PrimitiveDateTime::new(local.date(), local.time())
}

/// Persist `action` for every eligible panel, then wake the dispatcher.
///
/// The job is only a hint: if the queue is full or the dispatcher is not
/// running, the reconciliation pass finds the recorded rows.
pub async fn request_panel_sync<S: PanelStore>(
    store: &S,
    jobs: &PanelSyncJobSender,
    registration: &Registration,
    action: SyncAction,
    now: OffsetDateTime,
) -> Result<(), StoreError> {
    let panels = store
        .sync_panels_for(&registration.panel_access_ids())
        .await?;
    if panels.is_empty() {
        return Ok(());
    }
    for panel in &panels {
        store
            .record_sync_intent(registration.id, panel.id, action, now)
            .await?;
    }
    let job = PanelSyncJob {
        registration_id: registration.id,
        action,
    };
    if let Err(e) = jobs.try_send(job) {
        warn!(
            registration_id = %registration.id,
            error = %e,
            "Panel sync queue unavailable, leaving the job to reconciliation"
        );
    }
    Ok(())
}

/// Calculate the next retry delay based on retry count.
///
/// Uses exponential backoff: 2^retry_count seconds.
pub fn calculate_retry_delay(retry_count: u32) -> std::time::Duration {
    let seconds = 2u64.pow(retry_count.min(MAX_RETRY_COUNT));
    std::time::Duration::from_secs(seconds)
}

/// PanelSyncDispatcher consumes sync jobs and runs the reconciliation pass.
pub struct PanelSyncDispatcher<S, C> {
    sync: PanelSync<S, C>,
    lifecycle: LifecycleStore,
    job_rx: PanelSyncJobReceiver,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S, C> PanelSyncDispatcher<S, C>
where
    S: LedgerStore + PanelStore,
    C: PanelClient,
{
    pub fn new(
        sync: PanelSync<S, C>,
        lifecycle: LifecycleStore,
        job_rx: PanelSyncJobReceiver,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            sync,
            lifecycle,
            job_rx,
            shutdown_rx,
        }
    }

    /// Run the PanelSyncDispatcher.
    pub async fn run(mut self) {
        info!("PanelSyncDispatcher started");

        let mut reconcile_tick = tokio::time::interval(RECONCILE_INTERVAL);
        reconcile_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("PanelSyncDispatcher received shutdown signal");
                        break;
                    }
                }

                Some(job) = self.job_rx.recv() => {
                    debug!(job = ?job, "Received PanelSyncJob");
                    self.process_job(job).await;
                }

                _ = reconcile_tick.tick() => {
                    let config = self.lifecycle.snapshot().await;
                    if let Err(e) = self.sync.reconcile(&config, OffsetDateTime::now_utc()).await {
                        error!(error = %e, "Panel reconciliation pass failed");
                    }
                }

                else => {
                    info!("PanelSyncJob channel closed");
                    break;
                }
            }
        }

        info!("PanelSyncDispatcher shutdown complete");
    }

    async fn process_job(&self, job: PanelSyncJob) {
        let registration = match self.sync.store.registration(job.registration_id).await {
            Ok(Some(registration)) => registration,
            Ok(None) => {
                warn!(registration_id = %job.registration_id, "Sync requested for unknown registration");
                return;
            }
            Err(e) => {
                error!(registration_id = %job.registration_id, error = %e, "Failed to load registration for sync");
                return;
            }
        };
        let desired = desired_action(&registration);
        if desired != job.action {
            debug!(
                registration_id = %job.registration_id,
                queued = %job.action,
                current = %desired,
                "Registration changed since the job was queued"
            );
        }
        let config = self.lifecycle.snapshot().await;
        if let Err(e) = self
            .sync
            .sync_registration(&registration, &config, OffsetDateTime::now_utc())
            .await
        {
            error!(registration_id = %job.registration_id, error = %e, "Panel sync failed to select panels");
        }
    }
}
