// src/provider/mod.rs

//! Cloud provider capability interface.
//!
//! The acquisition core never talks to a cloud API directly; it goes through
//! [`CloudProvider`]. Production code uses [`AwsCliProvider`], tests provide
//! a scripted fake.
//!
//! Every call names the region it runs in. Each call is a single provider
//! operation, so calls are safe to issue concurrently from several sessions.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use crate::errors::Result;
use crate::pricing::PriceMap;
use crate::types::{Arch, CpuTopology};

pub mod aws_cli;
pub mod wait;

pub use aws_cli::AwsCliProvider;

/// Boxed `Send` future returned by capability traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Codes meaning "no capacity for this (region, type) right now".
pub const CAPACITY_ERROR_CODES: &[&str] = &[
    "InsufficientInstanceCapacity",
    "InsufficientCapacity",
    "InsufficientHostCapacity",
    "CapacityNotAvailable",
    "SpotMaxPriceTooLow",
    "MaxSpotInstanceCountExceeded",
    "Unsupported",
];

/// Codes meaning the caller's credentials are unusable.
pub const AUTH_ERROR_CODES: &[&str] = &[
    "AuthFailure",
    "UnauthorizedOperation",
    "InvalidClientTokenId",
    "ExpiredToken",
];

/// Coarse classification of a provider error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Capacity,
    Auth,
    NotFound,
    Other,
}

/// Error reported by the provider control plane.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: String,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        let code = self.code.as_str();
        if CAPACITY_ERROR_CODES.contains(&code) {
            ErrorClass::Capacity
        } else if AUTH_ERROR_CODES.contains(&code) {
            ErrorClass::Auth
        } else if code == "NotFound" || code.ends_with(".NotFound") {
            ErrorClass::NotFound
        } else {
            ErrorClass::Other
        }
    }

    pub fn is_capacity(&self) -> bool {
        self.class() == ErrorClass::Capacity
    }

    pub fn is_auth(&self) -> bool {
        self.class() == ErrorClass::Auth
    }

    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }
}

/// Everything needed to request one spot instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    pub instance_type: String,
    pub image_id: String,
    pub credential_name: String,
    pub group_id: String,
    pub project_tag: String,
    pub cpu_topology: Option<CpuTopology>,
}

/// Control-plane operations the orchestrator depends on.
pub trait CloudProvider: Send + Sync {
    /// Cheapest current spot price per instance type.
    fn get_spot_prices<'a>(
        &'a self,
        region: &'a str,
        instance_types: &'a [String],
    ) -> BoxFuture<'a, Result<PriceMap>>;

    /// Succeeds if the credential pair exists; a `NotFound`-class error
    /// otherwise.
    fn describe_credential<'a>(&'a self, region: &'a str, name: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Create a credential pair and return its secret material.
    fn create_credential<'a>(&'a self, region: &'a str, name: &'a str) -> BoxFuture<'a, Result<String>>;

    fn delete_credential<'a>(&'a self, region: &'a str, name: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Find or create the SSH ingress group and return its id. Idempotent
    /// on the provider side.
    fn ensure_ingress_rule<'a>(
        &'a self,
        region: &'a str,
        group_name: &'a str,
        project_tag: &'a str,
    ) -> BoxFuture<'a, Result<String>>;

    /// Machine image to boot for `arch`.
    fn find_image<'a>(
        &'a self,
        region: &'a str,
        project_tag: &'a str,
        arch: Arch,
    ) -> BoxFuture<'a, Result<String>>;

    /// Request a single spot instance and return its id.
    fn request_instance<'a>(
        &'a self,
        region: &'a str,
        request: &'a InstanceRequest,
    ) -> BoxFuture<'a, Result<String>>;

    /// Block until the instance is running and return its public IP.
    fn wait_until_running<'a>(
        &'a self,
        region: &'a str,
        instance_id: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<String>>;

    /// Terminate an instance. Must succeed if it is already gone.
    fn terminate<'a>(&'a self, region: &'a str, instance_id: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Block until the management (SSH) port accepts connections.
    fn wait_for_management_port<'a>(&'a self, ip: &'a str, timeout: Duration) -> BoxFuture<'a, Result<()>>;
}
