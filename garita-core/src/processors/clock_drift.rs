//! ClockDriftRecalibrator processor.
//!
//! Once at startup and then at every local midnight, each panel's clock
//! offset is recomputed from the skew samples its events carried over the
//! last 24 hours. Panels without a valid sample keep their current values.

use crate::entities::AccessPanel;
use crate::ledger::{PanelStore, StoreError};
use crate::utils::clock::calibrate;
use crate::utils::schedule::{to_std, until_next_local_midnight};
use time::{Duration, OffsetDateTime, UtcOffset};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Sample window for one recalibration.
pub const SAMPLE_WINDOW: Duration = Duration::hours(24);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecalibrationReport {
    pub calibrated: usize,
    pub alerts: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct ClockDriftRecalibrator<S> {
    store: S,
    utc_offset: UtcOffset,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: PanelStore> ClockDriftRecalibrator<S> {
    pub fn new(store: S, utc_offset: UtcOffset, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            store,
            utc_offset,
            shutdown_rx,
        }
    }

    /// Recalibrate every panel.
    pub async fn recalibrate_all(
        &self,
        now: OffsetDateTime,
    ) -> Result<RecalibrationReport, StoreError> {
        let panels = self.store.panels().await?;
        let mut report = RecalibrationReport::default();

        for panel in &panels {
            match self.recalibrate(panel, now).await {
                Ok(Some(true)) => {
                    report.calibrated += 1;
                    report.alerts += 1;
                }
                Ok(Some(false)) => report.calibrated += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(panel_id = %panel.id, error = %e, "Failed to recalibrate panel clock");
                }
            }
        }

        info!(
            calibrated = report.calibrated,
            alerts = report.alerts,
            skipped = report.skipped,
            failed = report.failed,
            "Clock drift recalibration finished"
        );
        Ok(report)
    }

    /// Returns the alert flag when a calibration was saved.
    async fn recalibrate(
        &self,
        panel: &AccessPanel,
        now: OffsetDateTime,
    ) -> Result<Option<bool>, StoreError> {
        let samples = self
            .store
            .clock_samples(panel.id, now - SAMPLE_WINDOW)
            .await?;
        let Some(calibration) = calibrate(&samples) else {
            debug!(panel_id = %panel.id, samples = samples.len(), "No valid clock samples");
            return Ok(None);
        };

        self.store.save_calibration(panel.id, calibration).await?;
        if calibration.alerta {
            warn!(
                panel_id = %panel.id,
                panel = %panel.nombre,
                offset_secs = calibration.offset_segundos,
                median_secs = calibration.ultimo_desfase_segundos,
                "Panel clock drift exceeds alert threshold"
            );
        }
        Ok(Some(calibration.alerta))
    }

    /// Run the ClockDriftRecalibrator.
    pub async fn run(mut self) {
        info!("ClockDriftRecalibrator started");

        if let Err(e) = self.recalibrate_all(OffsetDateTime::now_utc()).await {
            error!(error = %e, "Clock drift recalibration failed");
        }

        loop {
            let wait = until_next_local_midnight(OffsetDateTime::now_utc(), self.utc_offset);
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("ClockDriftRecalibrator received shutdown signal");
                        break;
                    }
                }

                _ = tokio::time::sleep(to_std(wait)) => {
                    if let Err(e) = self.recalibrate_all(OffsetDateTime::now_utc()).await {
                        error!(error = %e, "Clock drift recalibration failed");
                    }
                }
            }
        }

        info!("ClockDriftRecalibrator shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{CheckType, ClockSkewSample, DeviceKind};
    use crate::ledger::memory::{MemoryStore, PANEL_GATE, panel_fixture, registration_fixture};
    use crate::ledger::{AppendPrecondition, EventDraft, Ledger};
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-03-02 00:00 UTC);

    async fn record_skews(store: &MemoryStore, panel: uuid::Uuid, skews: &[(i32, Duration)]) {
        let reg = registration_fixture(1, NOW - Duration::days(2));
        store.insert_registration(reg.clone());
        let ledger = Ledger::new(store.clone());
        for (skew, ago) in skews {
            let received = NOW - *ago;
            let draft = EventDraft {
                tipo_check: CheckType::Entry,
                tipo_dispositivo: DeviceKind::Panel,
                id_acceso: Some(PANEL_GATE),
                id_panel: Some(panel),
                comentario: None,
                skew: Some(ClockSkewSample {
                    fecha_panel: received + Duration::seconds(i64::from(*skew)),
                    fecha_servidor_recepcion: received,
                    desfase_segundos: *skew,
                }),
            };
            ledger
                .append_event(reg.id, draft, AppendPrecondition::Any, received)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_recalibration_persists_offset_and_alert() {
        let store = MemoryStore::default();
        let panel = panel_fixture(1, PANEL_GATE, String::new());
        store.insert_panel(panel.clone());
        record_skews(
            &store,
            panel.id,
            &[
                (3600, Duration::hours(5)),
                (3660, Duration::hours(4)),
                (3550, Duration::hours(3)),
                (60000, Duration::hours(2)),
                // Outside the window.
                (-7200, Duration::hours(30)),
            ],
        )
        .await;

        let (_tx, rx) = watch::channel(false);
        let recalibrator = ClockDriftRecalibrator::new(store.clone(), UtcOffset::UTC, rx);
        let report = recalibrator.recalibrate_all(NOW).await.unwrap();
        assert_eq!(report.calibrated, 1);
        assert_eq!(report.alerts, 1);

        let stored = store.panel_snapshot(panel.id).unwrap();
        assert_eq!(stored.reloj_offset_segundos, 3600);
        assert!(stored.reloj_alerta_activa);
        assert_eq!(stored.reloj_ultimo_desfase_segundos, Some(3600));
        assert_eq!(stored.reloj_ultima_muestra, Some(NOW - Duration::hours(2)));
    }

    #[tokio::test]
    async fn test_panel_without_samples_is_untouched() {
        let store = MemoryStore::default();
        let mut panel = panel_fixture(1, PANEL_GATE, String::new());
        panel.reloj_offset_segundos = -3600;
        panel.reloj_alerta_activa = true;
        store.insert_panel(panel.clone());

        let (_tx, rx) = watch::channel(false);
        let recalibrator = ClockDriftRecalibrator::new(store.clone(), UtcOffset::UTC, rx);
        let report = recalibrator.recalibrate_all(NOW).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(store.panel_snapshot(panel.id).unwrap(), panel);
    }
}
