//! WebSocket message types for the access-events stream.
//!
//! `GET /ws/access-events` upgrades to a WebSocket connection and pushes
//! [`WsServerMessage`] JSON frames. Delivery is at-most-once: a client that
//! falls behind misses frames and should re-read the registrations it shows.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-to-client WebSocket message.
///
/// ```json
/// {"event":"state-changed","registration_id":"0190..."}
/// {"event":"error","code":1011,"reason":"internal error"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum WsServerMessage {
    /// A registration moved to a new lifecycle state.
    StateChanged { registration_id: Uuid },

    /// A server-side error. The server may send a close frame afterwards.
    Error { code: u16, reason: String },
}

/// Well-known WebSocket close codes used by the access-events stream.
pub struct WsCloseCode;

impl WsCloseCode {
    pub const NORMAL: u16 = 1000;

    /// The server is shutting down or the fan-out channel closed.
    pub const GOING_AWAY: u16 = 1001;

    pub const INTERNAL_ERROR: u16 = 1011;
}
