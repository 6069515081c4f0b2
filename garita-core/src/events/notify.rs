//! Best-effort fan-out of lifecycle transitions.

use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Frames a slow subscriber may fall behind before it starts losing them.
pub const STATE_CHANGED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChanged {
    pub registration_id: Uuid,
}

pub type StateChangedSender = broadcast::Sender<StateChanged>;
pub type StateChangedReceiver = broadcast::Receiver<StateChanged>;

pub fn state_changed_channel() -> (StateChangedSender, StateChangedReceiver) {
    broadcast::channel(STATE_CHANGED_CAPACITY)
}

/// Publish without waiting. Having no subscriber is not an error.
pub fn publish_state_changed(tx: &StateChangedSender, registration_id: Uuid) {
    if tx.send(StateChanged { registration_id }).is_err() {
        trace!(registration_id = %registration_id, "No live session for state change");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let (tx, mut rx) = state_changed_channel();
        let id = Uuid::from_u128(1);
        publish_state_changed(&tx, id);
        assert_eq!(rx.recv().await.unwrap().registration_id, id);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let (tx, rx) = state_changed_channel();
        drop(rx);
        publish_state_changed(&tx, Uuid::from_u128(1));
    }
}
