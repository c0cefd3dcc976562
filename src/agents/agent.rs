//! Agent - Sequences the usage worker against the socket listener
//!
//! `start` returns only after the worker has delivered a first usage
//! snapshot, and `run` binds the socket afterwards, so no connection is ever
//! answered without usage data. `stop` tears down in reverse: the worker is
//! stopped and acknowledged before the listener is closed.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::base::{AgentError, LifecycleCallback, LifecycleEvent, WorkerState};
use super::worker::{UsageEvent, UsageWorker};
use crate::config::AgentConfig;
use crate::providers::ProviderSet;
use crate::server::{RequestHandler, SocketListener};
use crate::usage::UsageStore;

/// Capacity of the worker → ingestion channel
const USAGE_CHANNEL_CAPACITY: usize = 1;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Idle,
    Started,
    Running,
    Stopped,
}

/// Tasks and resources owned between `start` and `stop`
#[derive(Default)]
struct Runtime {
    phase: Phase,
    providers: Option<ProviderSet>,
    usage_rx: Option<mpsc::Receiver<UsageEvent>>,
    worker_handle: Option<JoinHandle<()>>,
    ingest_handle: Option<JoinHandle<()>>,
    accept_handle: Option<JoinHandle<()>>,
}

/// Usage tracking agent
pub struct Agent {
    config: AgentConfig,
    injected_providers: Option<ProviderSet>,
    store: Arc<UsageStore>,
    worker: RwLock<Option<Arc<UsageWorker>>>,
    runtime: Mutex<Runtime>,
    cancel_token: CancellationToken,
    on_lifecycle: RwLock<Option<LifecycleCallback>>,
}

impl Agent {
    /// Creates an agent that builds its provider clients from `config`
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            injected_providers: None,
            store: Arc::new(UsageStore::new()),
            worker: RwLock::new(None),
            runtime: Mutex::new(Runtime::default()),
            cancel_token: CancellationToken::new(),
            on_lifecycle: RwLock::new(None),
        }
    }

    /// Creates an agent that uses the given clients instead of building them
    pub fn with_providers(config: AgentConfig, providers: ProviderSet) -> Self {
        Self {
            injected_providers: Some(providers),
            ..Self::new(config)
        }
    }

    /// Registers a callback for lifecycle events
    pub fn on_lifecycle<F>(&self, callback: F)
    where
        F: Fn(LifecycleEvent) + Send + Sync + 'static,
    {
        *self.on_lifecycle.write() = Some(Arc::new(callback));
    }

    fn emit(&self, event: LifecycleEvent) {
        tracing::debug!(?event, "Lifecycle event");
        // Released before the call so the callback may replace itself
        let callback = self.on_lifecycle.read().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Shared usage store
    pub fn usage(&self) -> Arc<UsageStore> {
        Arc::clone(&self.store)
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// State of the usage worker; `Created` before `start`
    pub fn worker_state(&self) -> WorkerState {
        self.worker
            .read()
            .as_ref()
            .map_or(WorkerState::Created, |worker| worker.state())
    }

    /// Validates the configuration, health-checks every provider and waits
    /// (bounded by `startup_timeout`) for the first usage snapshot
    pub async fn start(&self) -> Result<(), AgentError> {
        let mut runtime = self.runtime.lock().await;
        let phase = runtime.phase;
        match phase {
            Phase::Idle => {}
            Phase::Stopped => return Err(AgentError::Stopped),
            Phase::Started | Phase::Running => return Err(AgentError::AlreadyRunning),
        }

        self.config.validate()?;
        let providers = match self.injected_providers {
            Some(ref providers) => providers.clone(),
            None => ProviderSet::from_config(&self.config)?,
        };

        let (usage_tx, mut usage_rx) = mpsc::channel(USAGE_CHANNEL_CAPACITY);
        let worker = Arc::new(UsageWorker::new(
            self.config.refresh_interval,
            providers.clone(),
            usage_tx,
        ));
        *self.worker.write() = Some(Arc::clone(&worker));

        let (ready_tx, ready_rx) = oneshot::channel();
        let startup = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move {
                let _ = ready_tx.send(worker.start().await);
            }
        });

        match tokio::time::timeout(self.config.startup_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                tracing::error!(error = %e, "Usage worker failed to start");
                return Err(e.into());
            }
            Ok(Err(_)) => {
                return Err(AgentError::Internal(
                    "usage worker exited without reporting readiness".into(),
                ));
            }
            Err(_) => {
                startup.abort();
                worker.stop();
                tracing::error!(timeout = ?self.config.startup_timeout, "Usage worker not ready in time");
                return Err(AgentError::StartupTimeout(self.config.startup_timeout));
            }
        }

        // The first snapshot is already buffered; make it visible before
        // anything can connect.
        while let Ok(event) = usage_rx.try_recv() {
            apply_usage_event(&self.store, event);
        }

        runtime.providers = Some(providers);
        runtime.usage_rx = Some(usage_rx);
        runtime.phase = Phase::Started;

        tracing::info!(total_tokens = self.store.total_tokens(), "Usage worker ready");
        self.emit(LifecycleEvent::WorkerReady);
        Ok(())
    }

    /// Launches the worker ticker and the ingestion loop, binds the socket
    /// and starts accepting. Returns once the socket is bound.
    pub async fn run(&self) -> Result<(), AgentError> {
        let mut runtime = self.runtime.lock().await;
        let phase = runtime.phase;
        match phase {
            Phase::Started => {}
            Phase::Idle | Phase::Stopped => return Err(AgentError::NotStarted),
            Phase::Running => return Err(AgentError::AlreadyRunning),
        }

        let worker = self.worker.read().clone().ok_or(AgentError::NotStarted)?;
        let usage_rx = runtime.usage_rx.take().ok_or(AgentError::NotStarted)?;
        let providers = runtime.providers.take().ok_or(AgentError::NotStarted)?;
        runtime.phase = Phase::Running;

        runtime.worker_handle = Some(tokio::spawn(async move {
            if let Err(e) = worker.run().await {
                tracing::error!(error = %e, "Usage worker exited with error");
            }
        }));

        runtime.ingest_handle = Some(tokio::spawn(ingest_loop(
            usage_rx,
            Arc::clone(&self.store),
            self.cancel_token.child_token(),
        )));

        let listener = match SocketListener::bind(&self.config.socket_path) {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(error = %e, "Failed to bind listener");
                self.shutdown(&mut runtime).await;
                return Err(e.into());
            }
        };

        let handler = Arc::new(RequestHandler::new(
            providers,
            Arc::clone(&self.store),
            self.config.thresholds,
        ));
        runtime.accept_handle = Some(tokio::spawn(accept_loop(
            listener,
            handler,
            self.cancel_token.child_token(),
        )));

        tracing::info!(socket_path = %self.config.socket_path.display(), "Agent accepting connections");
        self.emit(LifecycleEvent::ListenerBound);
        Ok(())
    }

    /// Stops the worker, waits for its acknowledgement, closes the listener
    /// and joins every task
    ///
    /// Safe to call more than once, and before `start`.
    pub async fn stop(&self) -> Result<(), AgentError> {
        let mut runtime = self.runtime.lock().await;
        let phase = runtime.phase;
        match phase {
            Phase::Idle => {
                runtime.phase = Phase::Stopped;
                self.cancel_token.cancel();
                return Ok(());
            }
            Phase::Stopped => return Ok(()),
            Phase::Started | Phase::Running => {}
        }

        self.shutdown(&mut runtime).await;
        tracing::info!("Agent stopped");
        Ok(())
    }

    async fn shutdown(&self, runtime: &mut Runtime) {
        runtime.phase = Phase::Stopped;

        let worker = self.worker.read().clone();
        if let Some(worker) = worker {
            worker.stop();
        }
        if let Some(handle) = runtime.worker_handle.take() {
            join_with_timeout(handle, self.config.stop_timeout, "usage worker").await;
        }
        self.emit(LifecycleEvent::WorkerStopped);

        self.cancel_token.cancel();
        if let Some(handle) = runtime.accept_handle.take() {
            join_with_timeout(handle, self.config.stop_timeout, "accept loop").await;
            self.emit(LifecycleEvent::ListenerClosed);
        }

        if let Some(handle) = runtime.ingest_handle.take() {
            join_with_timeout(handle, self.config.stop_timeout, "usage ingestion").await;
        }
        runtime.usage_rx = None;
        runtime.providers = None;

        self.emit(LifecycleEvent::Stopped);
    }
}

async fn join_with_timeout(mut handle: JoinHandle<()>, timeout: Duration, task: &str) {
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(task, error = %e, "Task failed"),
        Err(_) => {
            tracing::warn!(task, ?timeout, "Task did not stop in time, aborting");
            handle.abort();
        }
    }
}

fn apply_usage_event(store: &UsageStore, event: UsageEvent) {
    match event {
        UsageEvent::Snapshot(snapshot) => {
            store.apply(&snapshot);
            tracing::debug!(total_tokens = store.total_tokens(), "Usage updated");
        }
        UsageEvent::FetchFailed { model, error } => {
            tracing::warn!(%model, %error, "Usage for model is stale");
        }
    }
}

/// Applies worker events to the store until cancelled
async fn ingest_loop(
    mut usage_rx: mpsc::Receiver<UsageEvent>,
    store: Arc<UsageStore>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = usage_rx.recv() => match event {
                Some(event) => apply_usage_event(&store, event),
                None => break,
            },
        }
    }
    tracing::debug!("Usage ingestion stopped");
}

/// Accepts connections until cancelled, then closes the socket
async fn accept_loop(
    listener: SocketListener,
    handler: Arc<RequestHandler>,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    let handler = Arc::clone(&handler);
                    let cancel = cancel.clone();
                    connections.spawn(async move {
                        if let Err(e) = handler.serve(stream, cancel).await {
                            tracing::debug!(error = %e, "Connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    while connections.join_next().await.is_some() {}

    if let Err(e) = listener.cleanup() {
        tracing::warn!(error = %e, "Failed to remove socket file");
    }
    drop(listener);
    tracing::debug!("Listener closed");
}
