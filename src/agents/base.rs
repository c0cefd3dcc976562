//! Base agent types
//!
//! Errors, the usage worker state machine and the lifecycle events the agent
//! reports while starting and stopping.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::providers::{ProviderError, ProviderFamily};
use crate::server::ServerError;

/// Errors raised by the usage worker
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A provider rejected its health check
    #[error("Health check failed for {family}: {source}")]
    HealthCheck {
        family: ProviderFamily,
        source: ProviderError,
    },

    /// The mandatory first fetch failed
    #[error("Initial usage fetch failed for {model}: {source}")]
    InitialFetch { model: String, source: ProviderError },

    /// The agent side of the usage channel is gone
    #[error("Usage channel closed")]
    ChannelClosed,

    /// The worker was asked to move through its states out of order
    #[error("Invalid worker transition from {0:?}")]
    InvalidState(WorkerState),
}

/// Errors raised by the agent lifecycle
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Usage worker failed: {0}")]
    Worker(#[from] WorkerError),

    /// The worker did not report readiness in time
    #[error("Usage worker was not ready within {0:?}")]
    StartupTimeout(Duration),

    #[error("Listener error: {0}")]
    Server(#[from] ServerError),

    /// `run` was called before a successful `start`
    #[error("Agent has not been started")]
    NotStarted,

    /// `start` or `run` was called twice
    #[error("Agent is already running")]
    AlreadyRunning,

    /// The agent was stopped and cannot be started again
    #[error("Agent has been stopped")]
    Stopped,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Usage worker lifecycle
///
/// `Created → Starting → Ready → Running → Stopping → Stopped`, with
/// `Failed` reachable from `Starting`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    /// Running health checks and the first fetch
    Starting,
    /// First usage snapshot delivered
    Ready,
    /// Ticking
    Running,
    Stopping,
    Stopped,
    /// Startup failed; terminal
    Failed(String),
}

impl WorkerState {
    pub fn is_running(&self) -> bool {
        matches!(self, WorkerState::Running)
    }

    /// Returns true once no further fetches can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Failed(_))
    }

    pub fn has_error(&self) -> bool {
        matches!(self, WorkerState::Failed(_))
    }
}

/// Milestones of the agent lifecycle, in the order they can occur
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The worker delivered its first snapshot
    WorkerReady,
    /// The socket is bound and accepting
    ListenerBound,
    /// The worker acknowledged the stop request
    WorkerStopped,
    /// The socket was closed and removed
    ListenerClosed,
    /// All background tasks joined
    Stopped,
}

/// Callback invoked for every lifecycle event
pub type LifecycleCallback = Arc<dyn Fn(LifecycleEvent) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_state_is_running() {
        assert!(WorkerState::Running.is_running());
        assert!(!WorkerState::Ready.is_running());
        assert!(!WorkerState::Stopped.is_running());
    }

    #[test]
    fn test_worker_state_is_terminal() {
        assert!(WorkerState::Stopped.is_terminal());
        assert!(WorkerState::Failed("boom".into()).is_terminal());
        assert!(!WorkerState::Created.is_terminal());
        assert!(!WorkerState::Stopping.is_terminal());
    }

    #[test]
    fn test_worker_state_has_error() {
        assert!(WorkerState::Failed("boom".into()).has_error());
        assert!(!WorkerState::Running.has_error());
    }

    #[test]
    fn test_error_messages() {
        let err = AgentError::StartupTimeout(Duration::from_secs(5));
        assert_eq!(err.to_string(), "Usage worker was not ready within 5s");

        let err = WorkerError::HealthCheck {
            family: ProviderFamily::Anthropic,
            source: ProviderError::AuthFailed("HTTP 401".into()),
        };
        assert_eq!(
            err.to_string(),
            "Health check failed for anthropic: Authentication failed: HTTP 401"
        );
    }
}
