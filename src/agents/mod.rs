//! Agent module - Usage refresh and lifecycle orchestration
//!
//! Provides:
//! - The usage worker, which polls provider usage on a fixed interval
//! - The agent, which gates the socket listener on the worker's readiness

mod agent;
mod base;
mod worker;

pub use agent::Agent;
pub use base::{AgentError, LifecycleCallback, LifecycleEvent, WorkerError, WorkerState};
pub use worker::{UsageEvent, UsageWorker};
