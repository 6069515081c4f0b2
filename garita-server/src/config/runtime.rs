//! Validated settings used by the running server.

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

/// Argon2 hash of the secret panel relays present.
#[derive(Debug, Clone)]
pub struct IngestSecret {
    pub secret_hash: String,
}

impl IngestSecret {
    pub fn new(secret_hash: String) -> Self {
        Self { secret_hash }
    }

    /// Verify a plaintext secret against the stored hash.
    pub fn verify_secret(&self, plaintext: &str) -> bool {
        let Ok(parsed_hash) = PasswordHash::new(&self.secret_hash) else {
            return false;
        };

        Argon2::default()
            .verify_password(plaintext.as_bytes(), &parsed_hash)
            .is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct PanelsConfig {
    pub request_timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::{
        PasswordHasher,
        password_hash::{SaltString, rand_core::OsRng},
    };

    #[test]
    fn test_verify_secret() {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(b"relay-secret", &salt)
            .unwrap()
            .to_string();

        let secret = IngestSecret::new(hash);
        assert!(secret.verify_secret("relay-secret"));
        assert!(!secret.verify_secret("wrong-secret"));
        assert!(!IngestSecret::new("plaintext".into()).verify_secret("plaintext"));
    }
}
