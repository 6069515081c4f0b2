//! Configuration module for garita-server.
//!
//! Handles loading configuration from TOML files, CLI arguments,
//! and environment variables. Also handles ingest secret hashing.

pub mod file;
pub mod runtime;

use crate::config::file::{FileConfig, LifecycleConfig as FileLifecycleConfig};
use crate::config::runtime::{IngestSecret, PanelsConfig, ServerConfig};
use garita_core::config::{LifecycleConfig, parse_utc_offset};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("password hashing error: {0}")]
    HashError(String),

    #[error("DATABASE_URL environment variable not set")]
    MissingDatabaseUrl,
}

/// Loaded configuration result containing all parts.
pub struct LoadedConfig {
    pub server: ServerConfig,
    pub ingest_secret: IngestSecret,
    pub credential_key: String,
    pub lifecycle: Option<LifecycleConfig>,
    pub panels: PanelsConfig,
}

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: std::path::PathBuf,
    listen_override: Option<SocketAddr>,
}

impl ConfigLoader {
    /// Create a new config loader.
    pub fn new(config_path: impl AsRef<Path>, listen_override: Option<SocketAddr>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            listen_override,
        }
    }

    /// Load and process the configuration.
    ///
    /// This will:
    /// 1. Read the TOML file
    /// 2. Apply CLI overrides
    /// 3. Validate the configuration
    /// 4. Hash the ingest secret if it's plaintext (and rewrite the file)
    /// 5. Build the loaded configuration
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let config_content = std::fs::read_to_string(&self.config_path)?;
        let mut file_config: FileConfig = toml::from_str(&config_content)?;

        if let Some(listen) = self.listen_override {
            file_config.server.listen = listen;
        }

        let lifecycle = self.validate(&file_config)?;

        let secret_hash = if file_config.is_ingest_secret_hashed() {
            file_config.security.ingest_secret.clone()
        } else {
            let hash = self.hash_secret(&file_config.security.ingest_secret)?;
            file_config.security.ingest_secret = hash.clone();
            self.rewrite_config(&file_config)?;
            tracing::info!("Ingest secret hashed and config file updated");
            hash
        };

        Ok(LoadedConfig {
            server: ServerConfig {
                listen: file_config.server.listen,
            },
            ingest_secret: IngestSecret::new(secret_hash),
            credential_key: file_config.security.credential_key,
            lifecycle,
            panels: PanelsConfig {
                request_timeout: Duration::from_secs(file_config.panels.request_timeout_secs),
            },
        })
    }

    /// Reload the configuration (used during SIGHUP).
    pub fn reload(&self) -> Result<LoadedConfig, ConfigError> {
        self.load()
    }

    fn validate(&self, config: &FileConfig) -> Result<Option<LifecycleConfig>, ConfigError> {
        if config.security.ingest_secret.is_empty() {
            return Err(ConfigError::ValidationError(
                "security.ingest_secret must not be empty".into(),
            ));
        }
        if config.security.credential_key.is_empty() {
            return Err(ConfigError::ValidationError(
                "security.credential_key must not be empty".into(),
            ));
        }
        if config.panels.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "panels.request_timeout_secs must be positive".into(),
            ));
        }
        config.lifecycle.as_ref().map(convert_lifecycle).transpose()
    }

    fn hash_secret(&self, plaintext: &str) -> Result<String, ConfigError> {
        use argon2::{
            Argon2, PasswordHasher,
            password_hash::{SaltString, rand_core::OsRng},
        };

        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();

        argon2
            .hash_password(plaintext.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| ConfigError::HashError(e.to_string()))
    }

    fn rewrite_config(&self, config: &FileConfig) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(config)?;

        // Write atomically: write to temp file, then rename
        let temp_path = self.config_path.with_extension("toml.tmp");
        std::fs::write(&temp_path, toml_string)?;
        std::fs::rename(&temp_path, &self.config_path)?;

        Ok(())
    }
}

fn convert_lifecycle(l: &FileLifecycleConfig) -> Result<LifecycleConfig, ConfigError> {
    let utc_offset = parse_utc_offset(&l.utc_offset).ok_or_else(|| {
        ConfigError::ValidationError(format!("invalid lifecycle.utc_offset {:?}", l.utc_offset))
    })?;
    Ok(LifecycleConfig {
        entry_tolerance: l.entry_tolerance,
        cancellation_tolerance: l.cancellation_tolerance,
        exit_tolerance: l.exit_tolerance,
        panel_integration_enabled: l.panel_integration_enabled,
        utc_offset,
    })
}

/// Get the database URL from the environment.
pub fn get_database_url() -> Result<String, ConfigError> {
    std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)
}
