//! Scrollwork - Know what a prompt will cost before you send it
//!
//! A local agent that tracks organization token usage for Anthropic and
//! OpenAI models and answers, over a Unix socket, how risky it is to send a
//! given prompt.
//!
//! ## Features
//!
//! - Periodic usage refresh from the providers' admin APIs, drift corrected
//! - Low / medium / high / unknown risk classification against configured thresholds
//! - Token counting (Anthropic) and estimation (OpenAI) for incoming prompts
//! - Newline-delimited JSON protocol on a local socket
//! - Credentials from flags, environment, config file or the OS keyring
//!
//! ## Architecture
//!
//! - **Usage**: the shared usage store and the risk classifier
//! - **Providers**: Anthropic and OpenAI API clients
//! - **Agents**: the usage worker and the agent that sequences it against the listener
//! - **Server**: socket listener, wire types and per-connection handling
//! - **Auth** / **Security**: keyring access and secret handling

pub mod agents;
pub mod auth;
pub mod config;
pub mod providers;
pub mod security;
pub mod server;
pub mod usage;

pub use agents::{Agent, AgentError};
pub use config::{AgentConfig, ConfigError};
pub use usage::{RiskLevel, RiskThresholds, UsageStore};

use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber
///
/// `RUST_LOG` takes precedence; without it the agent logs at `info`.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("scrollwork=info,scrollwork_lib=info,warn"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
