#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

pub mod config;
pub mod entities;
pub mod events;
pub mod framework;
pub mod ingest;
pub mod ledger;
pub mod panel;
pub mod permissions;
pub mod processors;
pub mod registrations;
pub mod utils;
