// src/engine/mod.rs

//! Spot acquisition engine.
//!
//! The engine walks a globally price-ranked candidate list and tries to
//! acquire one instance, falling back to the next candidate on capacity
//! errors:
//!
//! ```text
//! Ranking -> ProvisioningRegion -> RequestingInstance -> WaitingRunning
//!         -> WaitingReachable -> Ready
//! ```
//!
//! A retryable failure loops back to `ProvisioningRegion` for the next
//! candidate; a fatal failure or an exhausted list ends the run.
//!
//! The classification of errors is pure and lives here; the async driver is
//! in [`acquisition`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::SpotrunError;
use crate::infra::RegionInfra;
use crate::pricing::Candidate;
use crate::provider::ErrorClass;

pub mod acquisition;

pub use acquisition::AcquisitionEngine;

/// Whether a failed attempt lets the engine move on to the next candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    Fatal,
}

/// Where the engine currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionPhase {
    Idle,
    Ranking,
    ProvisioningRegion { region: String },
    RequestingInstance { region: String, instance_type: String },
    WaitingRunning { instance_id: String },
    WaitingReachable { ip: String },
    Ready,
    Failed(FailureKind),
    CapacityExhausted,
}

impl AcquisitionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AcquisitionPhase::Ready | AcquisitionPhase::CapacityExhausted
        )
    }
}

/// One failed, retryable acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub region: String,
    pub instance_type: String,
    pub error_message: String,
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.region, self.instance_type, self.error_message)
    }
}

/// Classify an instance-request error.
///
/// Only capacity and unsupported-configuration codes are retryable. Auth
/// failures, other provider errors and local errors all abort the run.
pub fn classify(err: &SpotrunError) -> FailureKind {
    match err.provider_error().map(|e| e.class()) {
        Some(ErrorClass::Capacity) => FailureKind::Retryable,
        _ => FailureKind::Fatal,
    }
}

/// Tunables for one acquisition run.
#[derive(Debug, Clone)]
pub struct AcquisitionOptions {
    pub project_tag: String,
    /// Regions searched when no region is pinned, in preference order.
    pub regions: Vec<String>,
    /// Restrict the search to this region.
    pub pinned_region: Option<String>,
    /// Try further candidates after a capacity error.
    pub fallback: bool,
    pub running_timeout: Duration,
    pub reachable_timeout: Duration,
}

impl Default for AcquisitionOptions {
    fn default() -> Self {
        Self {
            project_tag: "spotrun".to_string(),
            regions: crate::config::model::default_regions(),
            pinned_region: None,
            fallback: true,
            running_timeout: Duration::from_secs(300),
            reachable_timeout: Duration::from_secs(300),
        }
    }
}

/// A running, reachable instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Acquired {
    pub candidate: Candidate,
    pub instance_id: String,
    pub public_ip: String,
    pub infra: RegionInfra,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;

    #[test]
    fn only_capacity_errors_are_retryable() {
        let cap: SpotrunError = ProviderError::new("InsufficientInstanceCapacity", "x").into();
        let auth: SpotrunError = ProviderError::new("UnauthorizedOperation", "x").into();
        let other: SpotrunError = ProviderError::new("InvalidParameterValue", "x").into();
        let local = SpotrunError::NoPricing;

        assert_eq!(classify(&cap), FailureKind::Retryable);
        assert_eq!(classify(&auth), FailureKind::Fatal);
        assert_eq!(classify(&other), FailureKind::Fatal);
        assert_eq!(classify(&local), FailureKind::Fatal);
    }

    #[test]
    fn failures_are_not_terminal_on_their_own() {
        assert!(!AcquisitionPhase::Failed(FailureKind::Retryable).is_terminal());
        assert!(!AcquisitionPhase::Failed(FailureKind::Fatal).is_terminal());
        assert!(AcquisitionPhase::CapacityExhausted.is_terminal());
        assert!(AcquisitionPhase::Ready.is_terminal());
    }

    #[test]
    fn attempt_renders_region_and_type() {
        let a = Attempt {
            region: "us-east-1".into(),
            instance_type: "c6a.4xlarge".into(),
            error_message: "no capacity".into(),
        };
        assert_eq!(a.to_string(), "us-east-1/c6a.4xlarge: no capacity");
    }
}
