//! Provider module - Model families and their API clients
//!
//! A model identifier is mapped to its [`ProviderFamily`] once, when the
//! configuration is read. The [`ProviderSet`] then dispatches to the client
//! of that family without re-inspecting the model name.

mod anthropic;
mod base;
mod openai;

pub use anthropic::{AnthropicClient, AnthropicConfig};
pub use base::*;
pub use openai::{OpenAIClient, OpenAIConfig};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{AgentConfig, ConfigError};

/// Vendor API surface a model identifier belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFamily {
    Anthropic,
    OpenAI,
}

impl ProviderFamily {
    /// Resolves the family of a model identifier
    ///
    /// Anthropic covers first-party, AWS Bedrock (`anthropic.claude-…`) and
    /// GCP Vertex (`claude-…@date`) names.
    pub fn detect(model: &str) -> Option<Self> {
        if model.contains("claude-") {
            Some(ProviderFamily::Anthropic)
        } else if model.contains("gpt-") || model.contains("text-") {
            Some(ProviderFamily::OpenAI)
        } else {
            None
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            ProviderFamily::Anthropic => "anthropic",
            ProviderFamily::OpenAI => "openai",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProviderFamily::Anthropic => "Anthropic",
            ProviderFamily::OpenAI => "OpenAI",
        }
    }
}

impl fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// A tracked model with its resolved family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedModel {
    pub model: String,
    pub family: ProviderFamily,
}

/// The clients of every configured family plus the models they track
#[derive(Clone, Default)]
pub struct ProviderSet {
    clients: HashMap<ProviderFamily, Arc<dyn ProviderClient>>,
    models: Vec<TrackedModel>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds real HTTP clients for every family the configuration uses
    pub fn from_config(config: &AgentConfig) -> Result<Self, ConfigError> {
        let mut set = Self::new();

        for model in &config.models {
            let family = set.track(model)?;
            if set.clients.contains_key(&family) {
                continue;
            }

            let client: Arc<dyn ProviderClient> = match family {
                ProviderFamily::Anthropic => Arc::new(AnthropicClient::new(
                    AnthropicConfig {
                        request_timeout: config.request_timeout,
                        ..Default::default()
                    },
                    config.credentials.require(crate::auth::CredentialKey::AnthropicApiKey)?,
                    config.credentials.require(crate::auth::CredentialKey::AnthropicAdminKey)?,
                )?),
                ProviderFamily::OpenAI => Arc::new(OpenAIClient::new(
                    OpenAIConfig {
                        request_timeout: config.request_timeout,
                        ..Default::default()
                    },
                    config.credentials.require(crate::auth::CredentialKey::OpenAIAdminKey)?,
                )?),
            };
            set.clients.insert(family, client);
        }

        Ok(set)
    }

    /// Registers the client for a family
    pub fn with_client(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.clients.insert(client.family(), client);
        self
    }

    /// Adds a model to track, resolving its family
    pub fn with_model(mut self, model: &str) -> Result<Self, ConfigError> {
        self.track(model)?;
        Ok(self)
    }

    fn track(&mut self, model: &str) -> Result<ProviderFamily, ConfigError> {
        let family = ProviderFamily::detect(model)
            .ok_or_else(|| ConfigError::UnsupportedModel(model.to_string()))?;
        if !self.models.iter().any(|m| m.model == model) {
            self.models.push(TrackedModel {
                model: model.to_string(),
                family,
            });
        }
        Ok(family)
    }

    /// Tracked models in configuration order
    pub fn models(&self) -> &[TrackedModel] {
        &self.models
    }

    /// Client for a family, if configured
    pub fn client(&self, family: ProviderFamily) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(&family).cloned()
    }

    /// Client serving a model identifier
    ///
    /// Tracked models use the family resolved at configuration time; other
    /// models (e.g. a prompt for an untracked model) are resolved on demand.
    pub fn client_for_model(&self, model: &str) -> Option<Arc<dyn ProviderClient>> {
        let family = self
            .models
            .iter()
            .find(|m| m.model == model)
            .map(|m| m.family)
            .or_else(|| ProviderFamily::detect(model))?;
        self.client(family)
    }

    /// Every configured client
    pub fn clients(&self) -> impl Iterator<Item = &Arc<dyn ProviderClient>> {
        self.clients.values()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSet")
            .field("families", &self.clients.keys().collect::<Vec<_>>())
            .field("models", &self.models)
            .finish()
    }
}
