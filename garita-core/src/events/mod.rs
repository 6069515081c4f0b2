//! In-process messaging between the API, ingestion and the jobs.
//!
//! - `PanelSyncJob` (mpsc): a registration must be mirrored to, or removed
//!   from, its panels. Consumed by the `PanelSyncDispatcher`.
//! - `StateChanged` (broadcast): a registration moved to a new lifecycle
//!   state. Fanned out to live WebSocket sessions, at most once.
//!
//! Messages carry identifiers only; consumers re-read durable state.

pub mod channels;
pub mod notify;

pub use channels::{
    DEFAULT_CHANNEL_BUFFER, PanelSyncJob, PanelSyncJobReceiver, PanelSyncJobSender,
    panel_sync_channel,
};
pub use notify::{
    STATE_CHANGED_CAPACITY, StateChanged, StateChangedReceiver, StateChangedSender,
    publish_state_changed, state_changed_channel,
};
