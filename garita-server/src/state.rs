//! Application state shared across all request handlers.

use crate::config::runtime::IngestSecret;
use garita_core::config::{LifecycleConfig, LifecycleStore};
use garita_core::events::{PanelSyncJobSender, StateChangedSender};
use garita_core::framework::DatabaseProcessor;
use garita_core::ingest::PanelEventIngestor;
use garita_core::registrations::RegistrationService;
use std::sync::Arc;
use tokio::sync::{RwLock, watch};

/// Application state that is shared across all request handlers.
///
/// This is cloneable and cheap to pass around (everything is behind Arc).
#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseProcessor,
    pub registrations: RegistrationService<DatabaseProcessor>,
    pub ingestor: PanelEventIngestor<DatabaseProcessor>,
    /// `None` when the file has no `[lifecycle]` section.
    pub lifecycle: Option<LifecycleStore>,
    /// Reloaded via SIGHUP.
    pub ingest_secret: Arc<RwLock<IngestSecret>>,
    pub notify_tx: StateChangedSender,
    /// Flips to `true` once shutdown starts; long-lived sockets close on it.
    pub shutdown_rx: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(
        db: DatabaseProcessor,
        lifecycle: Option<LifecycleStore>,
        ingest_secret: IngestSecret,
        sync_tx: PanelSyncJobSender,
        notify_tx: StateChangedSender,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registrations: RegistrationService::new(db.clone(), sync_tx, notify_tx.clone()),
            ingestor: PanelEventIngestor::new(db.clone(), notify_tx.clone()),
            db,
            lifecycle,
            ingest_secret: Arc::new(RwLock::new(ingest_secret)),
            notify_tx,
            shutdown_rx,
        }
    }

    /// Current lifecycle settings, if configured.
    pub async fn lifecycle(&self) -> Option<LifecycleConfig> {
        match &self.lifecycle {
            Some(store) => Some(store.snapshot().await),
            None => None,
        }
    }
}
