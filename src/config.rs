//! Agent configuration
//!
//! An [`AgentConfig`] is built once from defaults, an optional JSON file and
//! command line flags, validated, and then handed to the agent by value.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::auth::{CredentialKey, CredentialStore};
use crate::providers::{ProviderError, ProviderFamily};
use crate::security::SecureString;
use crate::usage::RiskThresholds;

/// Well-known socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/scrollwork.sock";

/// Errors in the agent configuration. None of these are retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("At least one model is required")]
    NoModels,

    #[error("Unsupported model '{0}': only OpenAI and Anthropic models are supported")]
    UnsupportedModel(String),

    #[error("Missing credential: {0}")]
    MissingCredential(CredentialKey),

    #[error("Refresh interval must be positive")]
    InvalidRefreshInterval,

    #[error("Risk thresholds must be finite and non-negative")]
    InvalidThresholds,

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to build provider client: {0}")]
    Client(#[from] ProviderError),
}

/// Provider keys
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Messages API key, used for token counting
    pub anthropic_api_key: Option<SecureString>,
    /// Admin API key, used for organization usage
    pub anthropic_admin_key: Option<SecureString>,
    /// Admin API key, used for organization usage
    pub openai_admin_key: Option<SecureString>,
}

impl Credentials {
    fn slot(&mut self, key: CredentialKey) -> &mut Option<SecureString> {
        match key {
            CredentialKey::AnthropicApiKey => &mut self.anthropic_api_key,
            CredentialKey::AnthropicAdminKey => &mut self.anthropic_admin_key,
            CredentialKey::OpenAIAdminKey => &mut self.openai_admin_key,
        }
    }

    pub fn get(&self, key: CredentialKey) -> Option<&SecureString> {
        match key {
            CredentialKey::AnthropicApiKey => self.anthropic_api_key.as_ref(),
            CredentialKey::AnthropicAdminKey => self.anthropic_admin_key.as_ref(),
            CredentialKey::OpenAIAdminKey => self.openai_admin_key.as_ref(),
        }
    }

    /// Sets a key; blank values are ignored
    pub fn set(&mut self, key: CredentialKey, value: SecureString) {
        if !value.is_blank() {
            *self.slot(key) = Some(value);
        }
    }

    /// Returns a present, non-blank key
    pub fn require(&self, key: CredentialKey) -> Result<SecureString, ConfigError> {
        self.get(key)
            .filter(|v| !v.is_blank())
            .cloned()
            .ok_or(ConfigError::MissingCredential(key))
    }

    /// Fills every missing key from the keyring
    pub fn fill_from(&mut self, store: &CredentialStore) {
        for key in CredentialKey::ALL {
            let current = self.slot(key).take();
            *self.slot(key) = store.fill(key, current);
        }
    }

    /// Keys a model family needs
    pub fn required_for(family: ProviderFamily) -> &'static [CredentialKey] {
        match family {
            ProviderFamily::Anthropic => &[
                CredentialKey::AnthropicApiKey,
                CredentialKey::AnthropicAdminKey,
            ],
            ProviderFamily::OpenAI => &[CredentialKey::OpenAIAdminKey],
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model identifiers to track
    pub models: Vec<String>,
    /// Provider keys
    pub credentials: Credentials,
    /// Interval between usage refreshes
    pub refresh_interval: Duration,
    /// Risk classification boundaries
    pub thresholds: RiskThresholds,
    /// Unix socket the agent listens on
    pub socket_path: PathBuf,
    /// Deadline for the worker's first usage fetch
    pub startup_timeout: Duration,
    /// Deadline for the worker's stop acknowledgement
    pub stop_timeout: Duration,
    /// Deadline for each provider request
    pub request_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            credentials: Credentials::default(),
            refresh_interval: Duration::from_secs(60),
            thresholds: RiskThresholds::default(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            startup_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl AgentConfig {
    /// Creates a config tracking the given models with default settings
    pub fn new<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            models: models.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_thresholds(mut self, thresholds: RiskThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Families of the configured models, deduplicated, in configuration order
    pub fn families(&self) -> Result<Vec<ProviderFamily>, ConfigError> {
        let mut families = Vec::new();
        for model in &self.models {
            let family = ProviderFamily::detect(model)
                .ok_or_else(|| ConfigError::UnsupportedModel(model.clone()))?;
            if !families.contains(&family) {
                families.push(family);
            }
        }
        Ok(families)
    }

    /// Checks the configuration before any client is built
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return Err(ConfigError::NoModels);
        }

        if self.refresh_interval.is_zero() {
            return Err(ConfigError::InvalidRefreshInterval);
        }

        if !self.thresholds.is_well_formed() {
            return Err(ConfigError::InvalidThresholds);
        }

        for family in self.families()? {
            for key in Credentials::required_for(family) {
                self.credentials.require(*key)?;
            }
        }

        Ok(())
    }
}

/// Threshold triple as written in a config file
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ThresholdsFile {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

/// On-disk JSON configuration; every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub models: Option<Vec<String>>,
    pub refresh_interval_minutes: Option<u64>,
    pub thresholds: Option<ThresholdsFile>,
    pub socket_path: Option<PathBuf>,
    pub startup_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub anthropic_api_key: Option<SecureString>,
    pub anthropic_admin_key: Option<SecureString>,
    pub openai_admin_key: Option<SecureString>,
}

impl ConfigFile {
    /// Loads a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlays the values present in the file onto `config`
    pub fn apply(self, config: &mut AgentConfig) {
        if let Some(models) = self.models {
            config.models = models;
        }
        if let Some(minutes) = self.refresh_interval_minutes {
            config.refresh_interval = Duration::from_secs(minutes * 60);
        }
        if let Some(t) = self.thresholds {
            config.thresholds = RiskThresholds::new(t.low, t.medium, t.high);
        }
        if let Some(path) = self.socket_path {
            config.socket_path = path;
        }
        if let Some(secs) = self.startup_timeout_secs {
            config.startup_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.request_timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }

        let keys = [
            (CredentialKey::AnthropicApiKey, self.anthropic_api_key),
            (CredentialKey::AnthropicAdminKey, self.anthropic_admin_key),
            (CredentialKey::OpenAIAdminKey, self.openai_admin_key),
        ];
        for (key, value) in keys {
            if let Some(value) = value {
                config.credentials.set(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn anthropic_credentials() -> Credentials {
        Credentials {
            anthropic_api_key: Some("sk-ant-api".into()),
            anthropic_admin_key: Some("sk-ant-admin".into()),
            openai_admin_key: None,
        }
    }

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.refresh_interval, Duration::from_secs(60));
        assert_eq!(config.socket_path, PathBuf::from("/tmp/scrollwork.sock"));
        assert_eq!(config.startup_timeout, Duration::from_secs(5));
        assert!(config.thresholds.is_unconfigured());
    }

    #[test]
    fn test_validate_ok() {
        let config = AgentConfig::new(["claude-sonnet-4-20250514"]).with_credentials(anthropic_credentials());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_no_models() {
        let config = AgentConfig::default().with_credentials(anthropic_credentials());
        assert!(matches!(config.validate(), Err(ConfigError::NoModels)));
    }

    #[test]
    fn test_validate_unsupported_model() {
        let config = AgentConfig::new(["claude-sonnet-4-20250514", "mistral-large"])
            .with_credentials(anthropic_credentials());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedModel(m)) if m == "mistral-large"
        ));
    }

    #[test]
    fn test_validate_missing_credentials() {
        let config = AgentConfig::new(["gpt-4o"]).with_credentials(anthropic_credentials());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCredential(CredentialKey::OpenAIAdminKey))
        ));

        let mut credentials = anthropic_credentials();
        credentials.anthropic_admin_key = Some("   ".into());
        let config = AgentConfig::new(["claude-3-haiku-20240307"]).with_credentials(credentials);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCredential(CredentialKey::AnthropicAdminKey))
        ));
    }

    #[test]
    fn test_validate_zero_interval() {
        let config = AgentConfig::new(["claude-sonnet-4-20250514"])
            .with_credentials(anthropic_credentials())
            .with_refresh_interval(Duration::ZERO);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidRefreshInterval)));
    }

    #[test]
    fn test_validate_bad_thresholds() {
        let config = AgentConfig::new(["claude-sonnet-4-20250514"])
            .with_credentials(anthropic_credentials())
            .with_thresholds(RiskThresholds::new(-1.0, 0.0, 1.0));
        assert!(matches!(config.validate(), Err(ConfigError::InvalidThresholds)));
    }

    #[test]
    fn test_families_are_deduplicated() {
        let config = AgentConfig::new(["claude-a-1", "gpt-4o", "claude-b-2"]);
        assert_eq!(
            config.families().unwrap(),
            vec![ProviderFamily::Anthropic, ProviderFamily::OpenAI]
        );
    }

    #[test]
    fn test_credentials_set_ignores_blank() {
        let mut credentials = Credentials::default();
        credentials.set(CredentialKey::OpenAIAdminKey, "".into());
        assert!(credentials.get(CredentialKey::OpenAIAdminKey).is_none());

        credentials.set(CredentialKey::OpenAIAdminKey, "sk-admin".into());
        assert_eq!(
            credentials.require(CredentialKey::OpenAIAdminKey).unwrap(),
            SecureString::from("sk-admin")
        );
    }

    #[test]
    fn test_config_file_apply() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "models": ["gpt-4o"],
                "refresh_interval_minutes": 5,
                "thresholds": {{"low": 200, "medium": 400, "high": 600}},
                "socket_path": "/run/scrollwork/agent.sock",
                "openai_admin_key": "sk-admin-file"
            }}"#
        )
        .unwrap();

        let mut config = AgentConfig::default();
        ConfigFile::load(file.path()).unwrap().apply(&mut config);

        assert_eq!(config.models, vec!["gpt-4o".to_string()]);
        assert_eq!(config.refresh_interval, Duration::from_secs(300));
        assert_eq!(config.thresholds, RiskThresholds::new(200.0, 400.0, 600.0));
        assert_eq!(config.socket_path, PathBuf::from("/run/scrollwork/agent.sock"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_file_missing() {
        let err = ConfigFile::load(Path::new("/nonexistent/scrollwork.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_config_file_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            ConfigFile::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
