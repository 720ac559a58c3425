//! Pluggable transforms applied to client ids and secrets before they are stored.

use crate::errors::SecretError;
use sha2::{Digest, Sha256};

/// Converts client credentials between their raw and stored forms
pub trait SecretProcessor: Send + Sync {
    fn process_client_id(&self, client_id: &str) -> Result<String, SecretError>;

    fn unprocess_client_id(&self, stored: &str) -> Result<String, SecretError>;

    fn process_client_secret(&self, client_secret: &str) -> Result<String, SecretError>;

    fn unprocess_client_secret(&self, stored: &str) -> Result<String, SecretError>;

    /// Whether the stored secret can be turned back into the raw secret
    fn is_reversible(&self) -> bool;

    fn name(&self) -> &'static str;
}

/// Stores credentials as given
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextSecretProcessor;

impl SecretProcessor for PlainTextSecretProcessor {
    fn process_client_id(&self, client_id: &str) -> Result<String, SecretError> {
        Ok(client_id.to_string())
    }

    fn unprocess_client_id(&self, stored: &str) -> Result<String, SecretError> {
        Ok(stored.to_string())
    }

    fn process_client_secret(&self, client_secret: &str) -> Result<String, SecretError> {
        Ok(client_secret.to_string())
    }

    fn unprocess_client_secret(&self, stored: &str) -> Result<String, SecretError> {
        Ok(stored.to_string())
    }

    fn is_reversible(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "plaintext"
    }
}

/// Stores the SHA-256 digest of the secret. Client ids are kept as given
/// so they remain addressable.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashingSecretProcessor;

impl SecretProcessor for HashingSecretProcessor {
    fn process_client_id(&self, client_id: &str) -> Result<String, SecretError> {
        Ok(client_id.to_string())
    }

    fn unprocess_client_id(&self, stored: &str) -> Result<String, SecretError> {
        Ok(stored.to_string())
    }

    fn process_client_secret(&self, client_secret: &str) -> Result<String, SecretError> {
        if client_secret.is_empty() {
            return Err(SecretError::ProcessingFailed(
                "Client secret must not be empty".to_string(),
            ));
        }
        Ok(sha256_hex(client_secret))
    }

    fn unprocess_client_secret(&self, _stored: &str) -> Result<String, SecretError> {
        Err(SecretError::Irreversible(self.name().to_string()))
    }

    fn is_reversible(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "hashing"
    }
}

/// Lowercase hex SHA-256 digest of a string
pub fn sha256_hex(value: &str) -> String {
    Sha256::digest(value.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
