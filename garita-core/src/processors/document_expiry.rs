//! DocumentExpiry processor.
//!
//! At every local midnight, approved documents whose validity ended are
//! deactivated. A failed run is logged and the next midnight tries again.

use crate::ledger::{DocumentStore, StoreError};
use crate::utils::schedule::{to_std, until_next_local_midnight};
use time::{OffsetDateTime, UtcOffset};
use tokio::sync::watch;
use tracing::{error, info};

pub struct DocumentExpiry<S> {
    store: S,
    utc_offset: UtcOffset,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: DocumentStore> DocumentExpiry<S> {
    pub fn new(store: S, utc_offset: UtcOffset, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            store,
            utc_offset,
            shutdown_rx,
        }
    }

    /// One sweep; returns how many documents were deactivated.
    pub async fn expire(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        self.store.expire_documents(now).await
    }

    /// Run the DocumentExpiry.
    pub async fn run(mut self) {
        info!("DocumentExpiry started");

        loop {
            let wait = until_next_local_midnight(OffsetDateTime::now_utc(), self.utc_offset);
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("DocumentExpiry received shutdown signal");
                        break;
                    }
                }

                _ = tokio::time::sleep(to_std(wait)) => {
                    match self.expire(OffsetDateTime::now_utc()).await {
                        Ok(expired) => info!(expired, "Documentation expiry sweep finished"),
                        Err(e) => error!(error = %e, "Documentation expiry sweep failed"),
                    }
                }
            }
        }

        info!("DocumentExpiry shutdown complete");
    }
}
