//! Anthropic provider client
//!
//! Uses the Admin API for health checks and the messages usage report, and
//! the Messages API for token counting.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::base::{
    billing_window, error_for_status, Message, MessageRole, ProviderClient, ProviderError,
};
use super::ProviderFamily;
use crate::security::{Sanitizer, SecureString};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ORGANIZATION_PATH: &str = "/v1/organizations/me";
const USAGE_REPORT_PATH: &str = "/v1/organizations/usage_report/messages";
const COUNT_TOKENS_PATH: &str = "/v1/messages/count_tokens";

/// Upper bound on followed report pages
const MAX_REPORT_PAGES: usize = 32;

/// Usage report response
#[derive(Debug, Deserialize)]
struct UsageReportResponse {
    #[serde(default)]
    data: Vec<UsageBucket>,
    #[serde(default)]
    has_more: bool,
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageBucket {
    #[serde(default)]
    results: Vec<UsageResult>,
}

#[derive(Debug, Deserialize)]
struct UsageResult {
    model: Option<String>,
    #[serde(default)]
    uncached_input_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct Organization {
    id: String,
}

#[derive(Debug, Serialize)]
struct CountTokensRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<CountTokensMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct CountTokensMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CountTokensResponse {
    input_tokens: u64,
}

/// Configuration for the Anthropic client
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    /// API base URL
    pub api_base_url: String,
    /// Deadline applied to every request
    pub request_timeout: Duration,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.anthropic.com".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Anthropic API client
///
/// Holds two keys: the messages key for token counting and the admin key for
/// organization endpoints.
pub struct AnthropicClient {
    client: Client,
    config: AnthropicConfig,
    api_key: SecureString,
    admin_key: SecureString,
}

impl AnthropicClient {
    pub fn new(
        config: AnthropicConfig,
        api_key: SecureString,
        admin_key: SecureString,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;

        tracing::debug!(
            base_url = %config.api_base_url,
            admin_key = %Sanitizer::mask_secret(&admin_key),
            "Configured Anthropic client"
        );

        Ok(Self {
            client,
            config,
            api_key,
            admin_key,
        })
    }

    /// Creates a client against a custom base URL (for testing)
    pub fn new_with_base_url(
        base_url: &str,
        api_key: &str,
        admin_key: &str,
    ) -> Result<Self, ProviderError> {
        let config = AnthropicConfig {
            api_base_url: base_url.to_string(),
            ..Default::default()
        };
        Self::new(config, api_key.into(), admin_key.into())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    fn admin_get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(self.url(path))
            .header("x-api-key", self.admin_key.as_str())
            .header("anthropic-version", ANTHROPIC_VERSION)
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Anthropic
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let response = self.admin_get(ORGANIZATION_PATH).send().await?;
        let organization: Organization = error_for_status(response).await?.json().await?;

        tracing::debug!(organization = %organization.id, "Anthropic health check passed");
        Ok(())
    }

    async fn fetch_usage(&self, model: &str) -> Result<u64, ProviderError> {
        let (starting_at, ending_at) = billing_window(Utc::now());
        let starting_at = starting_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let ending_at = ending_at.to_rfc3339_opts(SecondsFormat::Secs, true);

        let mut tokens = 0u64;
        let mut page: Option<String> = None;

        for _ in 0..MAX_REPORT_PAGES {
            let mut query = vec![
                ("starting_at", starting_at.clone()),
                ("ending_at", ending_at.clone()),
                ("bucket_width", "1d".to_string()),
                ("group_by[]", "model".to_string()),
            ];
            if let Some(ref page) = page {
                query.push(("page", page.clone()));
            }

            let response = self.admin_get(USAGE_REPORT_PATH).query(&query).send().await?;
            let report: UsageReportResponse = error_for_status(response).await?.json().await?;

            tokens = report
                .data
                .iter()
                .flat_map(|bucket| bucket.results.iter())
                .filter(|result| result.model.as_deref() == Some(model))
                .fold(tokens, |acc, result| acc.saturating_add(result.uncached_input_tokens));

            match report.next_page {
                Some(next) if report.has_more => page = Some(next),
                _ => return Ok(tokens),
            }
        }

        tracing::warn!(model, partial_tokens = tokens, "Usage report exceeded {} pages", MAX_REPORT_PAGES);
        Err(ProviderError::Parse(format!(
            "usage report truncated after {} pages",
            MAX_REPORT_PAGES
        )))
    }

    async fn count_tokens(&self, model: &str, messages: &[Message]) -> Result<u64, ProviderError> {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .collect();

        let body = CountTokensRequest {
            model,
            system: (!system.is_empty()).then(|| system.join("\n")),
            messages: messages
                .iter()
                .filter_map(|m| match m.role {
                    MessageRole::User => Some(CountTokensMessage {
                        role: "user",
                        content: &m.content,
                    }),
                    MessageRole::Assistant => Some(CountTokensMessage {
                        role: "assistant",
                        content: &m.content,
                    }),
                    MessageRole::System => None,
                })
                .collect(),
        };

        let response = self
            .client
            .post(self.url(COUNT_TOKENS_PATH))
            .header("x-api-key", self.api_key.as_str())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let counted: CountTokensResponse = error_for_status(response).await?.json().await?;
        Ok(counted.input_tokens)
    }
}
