//! Device protocol the panel sync dispatcher depends on.

pub mod isapi;

pub use isapi::IsapiClient;

use crate::entities::AccessPanel;
use async_trait::async_trait;
use bytes::Bytes;
use garita_sdk::credentials::CredentialCipher;
use thiserror::Error;
use time::PrimitiveDateTime;
use uuid::Uuid;

/// Timeout applied to every device call unless configured otherwise.
pub const DEFAULT_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("panel refused the credentials")]
    Auth,
    #[error("panel rejected the request ({status}): {detail}")]
    DeviceRejected { status: u16, detail: String },
    #[error("panel did not answer in time")]
    Timeout,
    #[error("connection to the panel was lost")]
    ConnectionReset,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("stored panel credential is unusable: {0}")]
    Credentials(String),
}

impl PanelError {
    /// Classified reason, logged next to the device identity.
    pub fn kind(&self) -> &'static str {
        match self {
            PanelError::Auth => "auth",
            PanelError::DeviceRejected { .. } => "device_rejected",
            PanelError::Timeout => "timeout",
            PanelError::ConnectionReset => "connection_reset",
            PanelError::Transport(_) => "transport",
            PanelError::Credentials(_) => "credentials",
        }
    }

    /// Network-level failures that may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PanelError::Timeout | PanelError::ConnectionReset | PanelError::Transport(_)
        )
    }
}

/// Address and opened credentials of one panel. Lives for one device call.
#[derive(Clone)]
pub struct PanelEndpoint {
    pub id: Uuid,
    pub address: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for PanelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanelEndpoint")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl PanelEndpoint {
    /// Open the sealed password of `panel`.
    pub fn open(panel: &AccessPanel, cipher: &CredentialCipher) -> Result<Self, PanelError> {
        let password = cipher
            .open(&panel.contrasena)
            .map_err(|e| PanelError::Credentials(e.to_string()))?;
        Ok(Self {
            id: panel.id,
            address: panel.direccion_ip.clone(),
            username: panel.usuario.clone(),
            password,
        })
    }
}

/// Session needed for photo uploads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub token: String,
    /// `WebSession_<id>=<value>` cookie pair, when the device sets one.
    pub web_session: Option<String>,
}

/// Person record mirrored onto a panel, keyed by registration code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    pub code: String,
    pub name: String,
    /// Panel-local wall clock.
    pub valid_from: PrimitiveDateTime,
    pub valid_to: PrimitiveDateTime,
    pub photo: Option<Bytes>,
}

#[async_trait]
pub trait PanelClient: Send + Sync {
    async fn authenticate(&self, endpoint: &PanelEndpoint) -> Result<SessionToken, PanelError>;

    /// Create or overwrite the record with `record.code`.
    async fn upsert_access_record(
        &self,
        endpoint: &PanelEndpoint,
        record: &AccessRecord,
        session: Option<&SessionToken>,
    ) -> Result<(), PanelError>;

    /// Remove the record; an absent record is not an error.
    async fn delete_access_record(
        &self,
        endpoint: &PanelEndpoint,
        code: &str,
    ) -> Result<(), PanelError>;
}
