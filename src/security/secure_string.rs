//! Zeroizing string for provider credentials
//!
//! API and admin keys live in a [`SecureString`] from the moment they are read
//! from flags, environment, config file or keyring until the agent drops them.

use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Deserializer};
use zeroize::Zeroize;

/// A string whose memory is wiped on drop and whose `Debug` output is redacted
///
/// ```
/// use scrollwork_lib::security::SecureString;
///
/// let key = SecureString::new("sk-ant-admin01-secret".to_string());
/// assert_eq!(key.as_str(), "sk-ant-admin01-secret");
/// assert!(!format!("{:?}", key).contains("secret"));
/// ```
#[derive(Clone)]
pub struct SecureString {
    inner: String,
}

impl SecureString {
    pub fn new(s: String) -> Self {
        Self { inner: s }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns true if the value is empty or only whitespace
    pub fn is_blank(&self) -> bool {
        self.inner.trim().is_empty()
    }
}

impl Drop for SecureString {
    fn drop(&mut self) {
        self.inner.zeroize();
    }
}

impl Zeroize for SecureString {
    fn zeroize(&mut self) {
        self.inner.zeroize();
    }
}

impl Deref for SecureString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl AsRef<str> for SecureString {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}

impl From<String> for SecureString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecureString {
    fn from(s: &str) -> Self {
        Self::new(s.to_string())
    }
}

impl<'de> Deserialize<'de> for SecureString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Self::new)
    }
}

impl fmt::Debug for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureString")
            .field("len", &self.inner.len())
            .field("content", &"[REDACTED]")
            .finish()
    }
}

impl PartialEq for SecureString {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(self.inner.as_bytes(), other.inner.as_bytes())
    }
}

impl Eq for SecureString {}

impl PartialEq<&str> for SecureString {
    fn eq(&self, other: &&str) -> bool {
        constant_time_eq(self.inner.as_bytes(), other.as_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
