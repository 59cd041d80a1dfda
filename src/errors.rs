// src/errors.rs

//! Crate-wide error type and result alias.

use thiserror::Error;

use crate::engine::Attempt;
use crate::provider::ProviderError;

#[derive(Error, Debug)]
pub enum SpotrunError {
    /// An error reported by the cloud provider's control plane.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Every ranked candidate failed with a retryable capacity error.
    #[error("{message}")]
    CapacityExhausted {
        message: String,
        attempts: Vec<Attempt>,
    },

    #[error("Could not find spot pricing in any region")]
    NoPricing,

    #[error("Timed out waiting for {what} after {after_secs}s")]
    Timeout { what: String, after_secs: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// A previous launch left an instance behind that is still on record.
    #[error(
        "Instance {instance_id} in {region} is still tracked in the state file. Run `spotrun teardown` first."
    )]
    InstanceStillTracked { instance_id: String, region: String },

    #[error("No active session. Call launch() first.")]
    NoActiveSession,

    #[error("Remote command failed: {0}")]
    RemoteError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SpotrunError {
    /// The provider error wrapped by this error, if any.
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            SpotrunError::Provider(e) => Some(e),
            _ => None,
        }
    }

    /// True for invalid/expired credentials or permission denials.
    pub fn is_auth(&self) -> bool {
        self.provider_error().is_some_and(ProviderError::is_auth)
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, SpotrunError>;
