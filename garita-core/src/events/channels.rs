//! Work queue feeding the panel sync dispatcher.

use crate::entities::SyncAction;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Default buffer size for work queues.
pub const DEFAULT_CHANNEL_BUFFER: usize = 256;

/// Mirror or remove one registration on every eligible panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelSyncJob {
    pub registration_id: Uuid,
    pub action: SyncAction,
}

pub type PanelSyncJobSender = mpsc::Sender<PanelSyncJob>;
pub type PanelSyncJobReceiver = mpsc::Receiver<PanelSyncJob>;

pub fn panel_sync_channel() -> (PanelSyncJobSender, PanelSyncJobReceiver) {
    mpsc::channel(DEFAULT_CHANNEL_BUFFER)
}
