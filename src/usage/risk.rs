//! Risk classification
//!
//! Turns a token count into a discrete [`RiskLevel`] given three configured
//! thresholds.

use serde::{Deserialize, Serialize};

/// Multiplier above the high threshold past which a token count is no longer
/// trusted and classifies as [`RiskLevel::Unknown`].
const RUNAWAY_FACTOR: f64 = 10.0;

/// Discrete cost risk of a prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Cheap relative to the configured quota
    Low,
    /// Approaching the quota
    Medium,
    /// Past the high threshold
    High,
    /// Cannot be determined from the configuration or the input
    Unknown,
}

impl RiskLevel {
    /// Returns the wire name of this level
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Three ordered risk boundaries
///
/// The thresholds are either all fractions or all absolute token counts. They
/// are fixed at construction. Degenerate triples are valid and have defined
/// behaviour in [`RiskThresholds::classify`]:
///
/// - `0 / 0 / 0` means no quota is configured and everything is low risk.
/// - any other triple of equal values cannot discriminate and is always unknown.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RiskThresholds {
    low: f64,
    medium: f64,
    high: f64,
}

impl RiskThresholds {
    /// Creates thresholds from the low, medium and high boundaries
    pub fn new(low: f64, medium: f64, high: f64) -> Self {
        Self { low, medium, high }
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn medium(&self) -> f64 {
        self.medium
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    /// Returns true when no quota is configured (all thresholds zero)
    pub fn is_unconfigured(&self) -> bool {
        self.low == 0.0 && self.medium == 0.0 && self.high == 0.0
    }

    /// Returns true when every boundary is a finite, non-negative number
    pub fn is_well_formed(&self) -> bool {
        [self.low, self.medium, self.high]
            .iter()
            .all(|t| t.is_finite() && *t >= 0.0)
    }

    /// Classifies a token count
    ///
    /// Pure and total: every input maps to a level.
    pub fn classify(&self, tokens: u64) -> RiskLevel {
        if self.is_unconfigured() {
            return RiskLevel::Low;
        }

        if self.low == self.medium && self.medium == self.high {
            return RiskLevel::Unknown;
        }

        let tokens = tokens as f64;

        if tokens > self.high * RUNAWAY_FACTOR {
            return RiskLevel::Unknown;
        }

        if tokens > self.high {
            return RiskLevel::High;
        }

        if tokens > self.medium {
            return RiskLevel::Medium;
        }

        // Counts between low and medium are deliberately reported as low too.
        RiskLevel::Low
    }
}
