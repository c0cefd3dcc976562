//! Base types and traits for provider clients
//!
//! Every supported model family is served by one [`ProviderClient`] that can
//! check its credentials, report organization usage for a model and count
//! the tokens of a prompt.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ProviderFamily;
use crate::security::Sanitizer;

/// Maximum characters of an error body kept in [`ProviderError::Http`]
const MAX_ERROR_BODY_CHARS: usize = 200;

/// Role of a prompt message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// A single prompt message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            name: None,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            name: None,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            name: None,
            content: content.into(),
        }
    }
}

/// Errors returned by provider clients
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The request did not complete before its deadline
    #[error("Request timed out")]
    Timeout,

    /// Credentials were rejected
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Non-success HTTP status
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Transport error
    #[error("Network error: {0}")]
    Network(reqwest::Error),

    /// Error parsing response data
    #[error("Parse error: {0}")]
    Parse(String),

    /// Model or operation not supported by this provider
    #[error("Not supported: {0}")]
    Unsupported(String),
}

impl ProviderError {
    /// Transient errors leave the previous usage value in place
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Timeout)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_decode() {
            ProviderError::Parse(e.to_string())
        } else {
            ProviderError::Network(e)
        }
    }
}

/// Maps a non-success response to a [`ProviderError`]
pub(crate) async fn error_for_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let body = Sanitizer::truncate(&body, MAX_ERROR_BODY_CHARS);

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(ProviderError::AuthFailed(format!("HTTP {}: {}", status.as_u16(), body)));
    }

    Err(ProviderError::Http {
        status: status.as_u16(),
        body,
    })
}

/// The current billing window: the UTC day containing `now`
pub fn billing_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now);
    (start, start + Duration::days(1))
}

/// Capability set of a model family's API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Family this client serves
    fn family(&self) -> ProviderFamily;

    /// Verifies the configured credentials against the provider
    async fn health_check(&self) -> Result<(), ProviderError>;

    /// Uncached input tokens consumed by `model` in the current billing window
    async fn fetch_usage(&self, model: &str) -> Result<u64, ProviderError>;

    /// Number of input tokens `messages` would cost on `model`
    async fn count_tokens(&self, model: &str, messages: &[Message]) -> Result<u64, ProviderError>;
}
