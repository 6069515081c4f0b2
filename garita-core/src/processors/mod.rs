//! Background jobs.
//!
//! - `PanelSyncDispatcher`: receives `PanelSyncJob`, mirrors registrations
//!   to panels and reconciles the outbox every 30 seconds
//! - `ExpirationScheduler`: every 20 seconds, closes stale registrations and
//!   queues panel deletions
//! - `ClockDriftRecalibrator`: at startup and every local midnight,
//!   recomputes panel clock offsets
//! - `DocumentExpiry`: every local midnight, deactivates expired documents

pub mod clock_drift;
pub mod document_expiry;
pub mod expiration;
pub mod panel_sync;

pub use clock_drift::ClockDriftRecalibrator;
pub use document_expiry::DocumentExpiry;
pub use expiration::{ExpirationScheduler, ExpirationSweep};
pub use panel_sync::{PanelSync, PanelSyncDispatcher, request_panel_sync};
