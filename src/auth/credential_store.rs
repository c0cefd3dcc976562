//! Provider keys in the system keyring
//!
//! Backed by the platform credential store through the `keyring` crate
//! (Keychain, Secret Service, Credential Manager).

use std::fmt;
use std::str::FromStr;

use keyring::Entry;
use thiserror::Error;

use crate::security::SecureString;

/// Errors that can occur during keyring operations
#[derive(Debug, Error)]
pub enum CredentialStoreError {
    /// Keyring operation failed
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    /// Unknown credential name
    #[error("Unknown credential '{0}', expected one of: anthropic-api-key, anthropic-admin-key, openai-admin-key")]
    UnknownKey(String),
}

/// The provider keys the agent knows how to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKey {
    /// Anthropic messages key, used for token counting
    AnthropicApiKey,
    /// Anthropic admin key, used for health checks and usage reports
    AnthropicAdminKey,
    /// OpenAI admin key, used for health checks and usage reports
    OpenAIAdminKey,
}

impl CredentialKey {
    pub const ALL: [CredentialKey; 3] = [
        CredentialKey::AnthropicApiKey,
        CredentialKey::AnthropicAdminKey,
        CredentialKey::OpenAIAdminKey,
    ];

    /// Keyring entry name
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKey::AnthropicApiKey => "anthropic-api-key",
            CredentialKey::AnthropicAdminKey => "anthropic-admin-key",
            CredentialKey::OpenAIAdminKey => "openai-admin-key",
        }
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialKey {
    type Err = CredentialStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CredentialKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CredentialStoreError::UnknownKey(s.to_string()))
    }
}

/// Keyring-backed storage for provider keys
pub struct CredentialStore {
    service: &'static str,
}

impl CredentialStore {
    /// Creates a store using the default `scrollwork` service name
    pub fn new() -> Self {
        Self {
            service: "scrollwork",
        }
    }

    /// Creates a store with a custom service name
    pub fn with_service(service: &'static str) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &str {
        self.service
    }

    /// Looks up a key; `None` when no entry exists
    pub fn get(&self, key: CredentialKey) -> Result<Option<SecureString>, CredentialStoreError> {
        let entry = Entry::new(self.service, key.as_str())?;
        match entry.get_password() {
            Ok(password) => Ok(Some(SecureString::new(password))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(CredentialStoreError::Keyring(e)),
        }
    }

    /// Stores a key, replacing any previous value
    pub fn set(&self, key: CredentialKey, value: &SecureString) -> Result<(), CredentialStoreError> {
        let entry = Entry::new(self.service, key.as_str())?;
        entry.set_password(value.as_str())?;
        Ok(())
    }

    /// Deletes a key; `Ok(false)` if it was not stored
    pub fn delete(&self, key: CredentialKey) -> Result<bool, CredentialStoreError> {
        let entry = Entry::new(self.service, key.as_str())?;
        match entry.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(CredentialStoreError::Keyring(e)),
        }
    }

    /// Returns `current` if present, otherwise the keyring value
    ///
    /// Keyring failures are logged and treated as absent so that a missing
    /// secret service never prevents startup when keys come from elsewhere.
    pub fn fill(&self, key: CredentialKey, current: Option<SecureString>) -> Option<SecureString> {
        if current.is_some() {
            return current;
        }

        match self.get(key) {
            Ok(Some(value)) => {
                tracing::info!(credential = %key, "Loaded credential from system keyring");
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(credential = %key, error = %e, "Keyring lookup failed");
                None
            }
        }
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}
