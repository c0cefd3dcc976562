//! Usage worker - Periodically fetches organization usage
//!
//! The worker never touches the usage store. It hands every snapshot to the
//! agent over a bounded channel, and the agent's ingestion loop applies it.

use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::base::{WorkerError, WorkerState};
use crate::providers::{ProviderClient, ProviderSet};
use crate::usage::UsageSnapshot;

/// Pause between attempts when the first fetch times out
const INITIAL_FETCH_RETRY: Duration = Duration::from_secs(1);

/// Message from the worker to the agent's ingestion loop
#[derive(Debug, Clone, PartialEq)]
pub enum UsageEvent {
    /// Fresh readings for the models that fetched successfully
    Snapshot(UsageSnapshot),
    /// A non-transient fetch error; the model's previous value stays in place
    FetchFailed { model: String, error: String },
}

/// Fetches usage for every tracked model on a fixed interval
pub struct UsageWorker {
    interval: Duration,
    providers: ProviderSet,
    usage_tx: mpsc::Sender<UsageEvent>,
    state: RwLock<WorkerState>,
    cancel_token: CancellationToken,
}

impl UsageWorker {
    pub fn new(
        interval: Duration,
        providers: ProviderSet,
        usage_tx: mpsc::Sender<UsageEvent>,
    ) -> Self {
        Self {
            interval,
            providers,
            usage_tx,
            state: RwLock::new(WorkerState::Created),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state.read().clone()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn fail(&self, error: WorkerError) -> WorkerError {
        *self.state.write() = WorkerState::Failed(error.to_string());
        error
    }

    /// Health-checks every provider, then fetches and delivers the first snapshot
    ///
    /// Returning `Ok` is the readiness signal: at least one usage value has
    /// been handed to the agent.
    pub async fn start(&self) -> Result<(), WorkerError> {
        {
            let mut state = self.state.write();
            if *state != WorkerState::Created {
                return Err(WorkerError::InvalidState(state.clone()));
            }
            *state = WorkerState::Starting;
        }

        for client in self.providers.clients() {
            if let Err(source) = client.health_check().await {
                tracing::error!(family = %client.family(), error = %source, "Provider health check failed");
                return Err(self.fail(WorkerError::HealthCheck {
                    family: client.family(),
                    source,
                }));
            }
        }

        let mut snapshot = UsageSnapshot::new();
        for tracked in self.providers.models() {
            let Some(client) = self.providers.client(tracked.family) else {
                continue;
            };

            let tokens = self.initial_fetch(client.as_ref(), &tracked.model).await?;
            snapshot.tokens.insert(tracked.model.clone(), tokens);
        }

        tracing::info!(total_tokens = snapshot.total(), "Fetched initial organization usage");

        self.deliver(UsageEvent::Snapshot(snapshot))
            .await
            .map_err(|e| self.fail(e))?;

        let mut state = self.state.write();
        if *state == WorkerState::Starting {
            *state = WorkerState::Ready;
        }
        Ok(())
    }

    /// Fetches one model for the first snapshot, retrying timeouts
    ///
    /// Retries continue until the fetch succeeds, fails for good, or the
    /// worker is stopped. The agent's startup timeout bounds the wait.
    async fn initial_fetch(&self, client: &dyn ProviderClient, model: &str) -> Result<u64, WorkerError> {
        loop {
            let source = match client.fetch_usage(model).await {
                Ok(tokens) => return Ok(tokens),
                Err(e) if !e.is_transient() => {
                    return Err(self.fail(WorkerError::InitialFetch {
                        model: model.to_string(),
                        source: e,
                    }));
                }
                Err(e) => e,
            };

            tracing::warn!(model, error = %source, retry_in = ?INITIAL_FETCH_RETRY, "Initial usage fetch timed out, retrying");

            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => {
                    return Err(WorkerError::InitialFetch {
                        model: model.to_string(),
                        source,
                    });
                }
                _ = tokio::time::sleep(INITIAL_FETCH_RETRY) => {}
            }
        }
    }

    /// Ticks until [`UsageWorker::stop`] is called
    ///
    /// Each wait is the interval minus the time the previous fetch took, so
    /// fetch latency never accumulates. A fetch slower than the interval is
    /// followed immediately by the next one.
    pub async fn run(&self) -> Result<(), WorkerError> {
        {
            let mut state = self.state.write();
            match state.clone() {
                WorkerState::Ready => *state = WorkerState::Running,
                WorkerState::Stopping | WorkerState::Stopped => {
                    *state = WorkerState::Stopped;
                    return Ok(());
                }
                other => return Err(WorkerError::InvalidState(other)),
            }
        }

        tracing::info!(interval = ?self.interval, "Usage worker running");

        let mut delay = self.interval;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let started = Instant::now();
            tracing::debug!("Fetching latest usage");
            self.refresh().await;

            let elapsed = started.elapsed();
            delay = self.interval.saturating_sub(elapsed);
            if delay.is_zero() {
                tracing::warn!(elapsed = ?elapsed, interval = ?self.interval, "Usage fetch exceeded the refresh interval");
            }
        }

        *self.state.write() = WorkerState::Stopped;
        tracing::info!("Usage worker stopped");
        Ok(())
    }

    /// Requests a stop; a fetch in flight is allowed to finish
    pub fn stop(&self) {
        {
            let mut state = self.state.write();
            match state.clone() {
                WorkerState::Running => *state = WorkerState::Stopping,
                WorkerState::Created | WorkerState::Starting | WorkerState::Ready => {
                    *state = WorkerState::Stopped
                }
                _ => {}
            }
        }
        self.cancel_token.cancel();
    }

    /// One tick: fetch every tracked model and deliver what succeeded
    async fn refresh(&self) {
        let mut snapshot = UsageSnapshot::new();

        for tracked in self.providers.models() {
            let Some(client) = self.providers.client(tracked.family) else {
                tracing::warn!(model = %tracked.model, "No client configured for model");
                continue;
            };

            match client.fetch_usage(&tracked.model).await {
                Ok(tokens) => {
                    snapshot.tokens.insert(tracked.model.clone(), tokens);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(model = %tracked.model, error = %e, "Usage fetch timed out, keeping previous value");
                }
                Err(e) => {
                    tracing::error!(model = %tracked.model, error = %e, "Usage fetch failed");
                    let event = UsageEvent::FetchFailed {
                        model: tracked.model.clone(),
                        error: e.to_string(),
                    };
                    if self.deliver(event).await.is_err() {
                        return;
                    }
                }
            }
        }

        if !snapshot.is_empty() {
            let _ = self.deliver(UsageEvent::Snapshot(snapshot)).await;
        }
    }

    /// Sends an event, discarding it if the worker is stopped while waiting
    async fn deliver(&self, event: UsageEvent) -> Result<(), WorkerError> {
        tokio::select! {
            biased;
            sent = self.usage_tx.send(event) => sent.map_err(|_| {
                tracing::warn!("Usage channel closed, dropping usage update");
                WorkerError::ChannelClosed
            }),
            _ = self.cancel_token.cancelled() => {
                tracing::debug!("Worker stopping, discarding usage update");
                Ok(())
            }
        }
    }
}
