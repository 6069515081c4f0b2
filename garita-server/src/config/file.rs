//! TOML file configuration structures.
//!
//! These structs directly map to the `garita.toml` file format.

use garita_core::config::Tolerance;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub security: SecurityConfig,
    /// Required by the expiration scheduler and the panel sync dispatcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<LifecycleConfig>,
    #[serde(default)]
    pub panels: PanelsConfig,
}

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The address and port to listen on (e.g., "0.0.0.0:8080").
    #[serde(default = "default_listen_addr")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Secret presented by panel relays. If this is plaintext (doesn't
    /// start with `$argon2`), it will be hashed and the config file will be
    /// rewritten.
    pub ingest_secret: String,
    /// Key sealing the stored panel passwords.
    pub credential_key: String,
}

/// Registration lifecycle tolerances, written as `"amount/unit"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub entry_tolerance: Tolerance,
    pub cancellation_tolerance: Tolerance,
    pub exit_tolerance: Tolerance,
    #[serde(default)]
    pub panel_integration_enabled: bool,
    /// Site wall-clock offset, e.g. `"-06:00"`.
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
}

fn default_utc_offset() -> String {
    "Z".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelsConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for PanelsConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl FileConfig {
    /// Check if the ingest secret is already hashed (argon2 format).
    pub fn is_ingest_secret_hashed(&self) -> bool {
        self.security.ingest_secret.starts_with("$argon2")
    }
}
