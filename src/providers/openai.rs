//! OpenAI provider client
//!
//! Reads completions usage from the organization usage API with an admin key.
//! OpenAI offers no token counting endpoint, so prompt size is estimated.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;

use super::base::{billing_window, error_for_status, Message, ProviderClient, ProviderError};
use super::ProviderFamily;
use crate::security::{Sanitizer, SecureString};

const PROJECTS_PATH: &str = "/v1/organization/projects";
const COMPLETIONS_USAGE_PATH: &str = "/v1/organization/usage/completions";

const MAX_USAGE_PAGES: usize = 32;

/// Rough characters-per-token ratio for English text
const CHARS_PER_TOKEN: usize = 4;
/// Framing tokens added per message
const TOKENS_PER_MESSAGE: u64 = 4;
/// Tokens priming the assistant reply
const REPLY_PRIMING_TOKENS: u64 = 3;

#[derive(Debug, Deserialize)]
struct CompletionsUsageResponse {
    #[serde(default)]
    data: Vec<CompletionsBucket>,
    #[serde(default)]
    has_more: bool,
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionsBucket {
    #[serde(default)]
    results: Vec<CompletionsResult>,
}

#[derive(Debug, Deserialize)]
struct CompletionsResult {
    model: Option<String>,
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    input_cached_tokens: u64,
}

impl CompletionsResult {
    fn uncached_input_tokens(&self) -> u64 {
        self.input_tokens.saturating_sub(self.input_cached_tokens)
    }
}

/// Configuration for the OpenAI client
#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    /// API base URL
    pub api_base_url: String,
    /// Deadline applied to every request
    pub request_timeout: Duration,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.openai.com".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// OpenAI API client
pub struct OpenAIClient {
    client: Client,
    config: OpenAIConfig,
    admin_key: SecureString,
}

impl OpenAIClient {
    pub fn new(config: OpenAIConfig, admin_key: SecureString) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;

        tracing::debug!(
            base_url = %config.api_base_url,
            admin_key = %Sanitizer::mask_secret(&admin_key),
            "Configured OpenAI client"
        );

        Ok(Self {
            client,
            config,
            admin_key,
        })
    }

    /// Creates a client against a custom base URL (for testing)
    pub fn new_with_base_url(base_url: &str, admin_key: &str) -> Result<Self, ProviderError> {
        let config = OpenAIConfig {
            api_base_url: base_url.to_string(),
            ..Default::default()
        };
        Self::new(config, admin_key.into())
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path);
        self.client
            .get(url)
            .header("Authorization", format!("Bearer {}", self.admin_key.as_str()))
    }

    /// Approximates the prompt size at ~4 characters per token
    pub fn estimate_tokens(messages: &[Message]) -> u64 {
        let content: u64 = messages
            .iter()
            .map(|m| {
                let chars = m.content.chars().count() + m.name.as_deref().map_or(0, |n| n.chars().count());
                (chars.div_ceil(CHARS_PER_TOKEN)) as u64 + TOKENS_PER_MESSAGE
            })
            .sum();

        if messages.is_empty() {
            0
        } else {
            content + REPLY_PRIMING_TOKENS
        }
    }
}

#[async_trait]
impl ProviderClient for OpenAIClient {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::OpenAI
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let response = self.get(PROJECTS_PATH).query(&[("limit", "1")]).send().await?;
        error_for_status(response).await?;

        tracing::debug!("OpenAI health check passed");
        Ok(())
    }

    async fn fetch_usage(&self, model: &str) -> Result<u64, ProviderError> {
        let (start, end) = billing_window(Utc::now());
        let start_time = start.timestamp().to_string();
        let end_time = end.timestamp().to_string();

        let mut tokens = 0u64;
        let mut page: Option<String> = None;

        for _ in 0..MAX_USAGE_PAGES {
            let mut query = vec![
                ("start_time", start_time.clone()),
                ("end_time", end_time.clone()),
                ("bucket_width", "1d".to_string()),
                ("group_by", "model".to_string()),
            ];
            if let Some(ref page) = page {
                query.push(("page", page.clone()));
            }

            let response = self.get(COMPLETIONS_USAGE_PATH).query(&query).send().await?;
            let usage: CompletionsUsageResponse = error_for_status(response).await?.json().await?;

            tokens = usage
                .data
                .iter()
                .flat_map(|bucket| bucket.results.iter())
                .filter(|result| result.model.as_deref() == Some(model))
                .fold(tokens, |acc, result| acc.saturating_add(result.uncached_input_tokens()));

            match usage.next_page {
                Some(next) if usage.has_more => page = Some(next),
                _ => return Ok(tokens),
            }
        }

        tracing::warn!(model, partial_tokens = tokens, "Usage listing exceeded {} pages", MAX_USAGE_PAGES);
        Err(ProviderError::Parse(format!(
            "usage listing truncated after {} pages",
            MAX_USAGE_PAGES
        )))
    }

    async fn count_tokens(&self, _model: &str, messages: &[Message]) -> Result<u64, ProviderError> {
        Ok(Self::estimate_tokens(messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_health_check_ok() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PROJECTS_PATH))
            .and(header("Authorization", "Bearer sk-admin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"object": "list", "data": []})))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAIClient::new_with_base_url(&server.uri(), "sk-admin").unwrap();
        assert!(client.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_health_check_forbidden() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PROJECTS_PATH))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let client = OpenAIClient::new_with_base_url(&server.uri(), "sk-proj-not-admin").unwrap();
        assert!(matches!(
            client.health_check().await,
            Err(ProviderError::AuthFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_usage_subtracts_cached_input() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(COMPLETIONS_USAGE_PATH))
            .and(query_param("group_by", "model"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "page",
                "data": [{
                    "object": "bucket",
                    "start_time": 1755129600,
                    "end_time": 1755216000,
                    "results": [
                        {"object": "organization.usage.completions.result", "model": "gpt-4o", "input_tokens": 1000, "input_cached_tokens": 200},
                        {"object": "organization.usage.completions.result", "model": "gpt-4o-mini", "input_tokens": 70, "input_cached_tokens": 0}
                    ]
                }],
                "has_more": false,
                "next_page": null
            })))
            .mount(&server)
            .await;

        let client = OpenAIClient::new_with_base_url(&server.uri(), "sk-admin").unwrap();
        assert_eq!(client.fetch_usage("gpt-4o").await.unwrap(), 800);
        assert_eq!(client.fetch_usage("gpt-4.1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fetch_usage_follows_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(COMPLETIONS_USAGE_PATH))
            .and(query_param_is_missing("page"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"results": [{"model": "gpt-4o", "input_tokens": 300, "input_cached_tokens": 100}]}],
                "has_more": true,
                "next_page": "page_2"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(COMPLETIONS_USAGE_PATH))
            .and(query_param("page", "page_2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"results": [{"model": "gpt-4o", "input_tokens": 50, "input_cached_tokens": 0}]}],
                "has_more": false,
                "next_page": null
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAIClient::new_with_base_url(&server.uri(), "sk-admin").unwrap();
        assert_eq!(client.fetch_usage("gpt-4o").await.unwrap(), 250);
    }

    #[tokio::test]
    async fn test_fetch_usage_endless_pages_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(COMPLETIONS_USAGE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"results": [{"model": "gpt-4o", "input_tokens": 1}]}],
                "has_more": true,
                "next_page": "page_again"
            })))
            .expect(MAX_USAGE_PAGES as u64)
            .mount(&server)
            .await;

        let client = OpenAIClient::new_with_base_url(&server.uri(), "sk-admin").unwrap();
        let err = client.fetch_usage("gpt-4o").await.unwrap_err();
        assert!(matches!(err, ProviderError::Parse(ref msg) if msg.contains("truncated")));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_fetch_usage_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(COMPLETIONS_USAGE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"results": [{"model": "gpt-4o", "input_tokens": -5}]}]
            })))
            .mount(&server)
            .await;

        let client = OpenAIClient::new_with_base_url(&server.uri(), "sk-admin").unwrap();
        let err = client.fetch_usage("gpt-4o").await.unwrap_err();
        assert!(matches!(err, ProviderError::Parse(_)), "unexpected error: {err}");
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(OpenAIClient::estimate_tokens(&[]), 0);

        // 12 chars -> 3 tokens, + 4 framing, + 3 priming
        let messages = vec![Message::user("Hello there!")];
        assert_eq!(OpenAIClient::estimate_tokens(&messages), 10);

        let messages = vec![Message::system("Be brief"), Message::user("Hi")];
        // 8 chars -> 2, 2 chars -> 1, + 2 * 4 framing, + 3 priming
        assert_eq!(OpenAIClient::estimate_tokens(&messages), 14);
    }

    #[tokio::test]
    async fn test_count_tokens_uses_estimate() {
        let client = OpenAIClient::new_with_base_url("http://localhost", "sk-admin").unwrap();
        let messages = vec![Message::user("Hello there!")];
        assert_eq!(client.count_tokens("gpt-4o", &messages).await.unwrap(), 10);
        assert_eq!(client.family(), ProviderFamily::OpenAI);
    }
}
