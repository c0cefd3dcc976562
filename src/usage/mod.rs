//! Usage module - Risk classification and the shared usage store

mod risk;
mod store;

pub use risk::{RiskLevel, RiskThresholds};
pub use store::{UsageSnapshot, UsageStore};
