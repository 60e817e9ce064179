//! Credential Storage
//!
//! Passwords and passphrases are kept out of the config file and looked up
//! by credential key (`protocol-username-host-port`). The system keychain is
//! accessed through the `keyring` crate.

use std::collections::HashMap;

use keyring::Entry;
use parking_lot::Mutex;

/// Service name for keychain entries
const SERVICE_NAME: &str = "com.oxideterm.remote";

/// Credential store errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Keychain verification failed for {0}")]
    VerificationFailed(String),
}

/// Key-value secret store keyed by connection credential key
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CredentialError>;
    fn set(&self, key: &str, secret: &str) -> Result<(), CredentialError>;
    /// Deleting a missing key is not an error
    fn delete(&self, key: &str) -> Result<(), CredentialError>;
}

/// System keychain backed store
pub struct KeychainStore {
    service: String,
}

impl KeychainStore {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    /// Create with custom service name (for testing)
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, CredentialError> {
        // Explicit username keeps the keychain identity stable on macOS
        let username = whoami::username();
        Ok(Entry::new(&self.service, &format!("{}@{}", username, key))?)
    }
}

impl Default for KeychainStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeychainStore {
    fn get(&self, key: &str) -> Result<Option<String>, CredentialError> {
        match self.entry(key)?.get_password() {
            Ok(secret) => {
                tracing::debug!("Keychain get: found secret for {}", key);
                Ok(Some(secret))
            }
            Err(keyring::Error::NoEntry) => {
                tracing::debug!("Keychain get: no entry for {}", key);
                Ok(None)
            }
            Err(e) => {
                tracing::error!("Keychain get failed: key={}, error={:?}", key, e);
                Err(e.into())
            }
        }
    }

    fn set(&self, key: &str, secret: &str) -> Result<(), CredentialError> {
        let entry = self.entry(key)?;
        entry.set_password(secret)?;
        // Some backends accept the write and silently drop it; read back.
        match entry.get_password() {
            Ok(read_back) if read_back == secret => {
                tracing::info!("Keychain store verified: {}", key);
                Ok(())
            }
            Ok(_) => Err(CredentialError::VerificationFailed(key.to_string())),
            Err(e) => {
                tracing::error!("Keychain store verification failed: {:?}", e);
                Err(e.into())
            }
        }
    }

    fn delete(&self, key: &str) -> Result<(), CredentialError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()), // Already deleted
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store, for hosts without a keychain and for tests
#[derive(Default)]
pub struct MemoryCredentialStore {
    secrets: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>, CredentialError> {
        Ok(self.secrets.lock().get(key).cloned())
    }

    fn set(&self, key: &str, secret: &str) -> Result<(), CredentialError> {
        self.secrets
            .lock()
            .insert(key.to_string(), secret.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CredentialError> {
        self.secrets.lock().remove(key);
        Ok(())
    }
}
