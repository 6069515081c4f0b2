//! Database rows and the typed queries over them.
//!
//! Code columns are stored as `SMALLINT` and decoded into the closed
//! enumerations of [`garita_sdk::objects::codes`]; a row carrying an unknown
//! code surfaces as [`sqlx::Error::Decode`].

pub mod document;
pub mod event;
pub mod panel;
pub mod panel_sync_outbox;
pub mod registration;

pub use garita_sdk::objects::codes::{AccessMode, CheckType, CodeError, DeviceKind, Role};

pub use event::{ClockSkewSample, Event, EventSubject, PanelEventKey};
pub use panel::AccessPanel;
pub use panel_sync_outbox::{SyncAction, SyncIntent};
pub use registration::{AccessGrant, Registration};

/// A row that cannot be turned into its domain type.
#[derive(Debug, thiserror::Error)]
pub enum RowError {
    #[error(transparent)]
    Code(#[from] CodeError),
    #[error("event {0} has neither a registration nor an identity")]
    MissingSubject(uuid::Uuid),
}

impl From<RowError> for sqlx::Error {
    fn from(value: RowError) -> Self {
        sqlx::Error::Decode(Box::new(value))
    }
}
