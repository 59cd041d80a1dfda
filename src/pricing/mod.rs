// src/pricing/mod.rs

//! Spot pricing and instance selection.
//!
//! - [`catalog`] is the static instance table and vCPU arithmetic.
//! - [`ranker`] turns price maps into an ordered candidate list (pure).
//! - [`oracle`] fetches live prices through the provider.

use std::collections::HashMap;

pub mod catalog;
pub mod oracle;
pub mod ranker;

/// Instance type -> cheapest current spot price (USD per hour).
pub type PriceMap = HashMap<String, f64>;

/// Price maps per region, in the order the regions were queried.
pub type RegionPrices = Vec<(String, PriceMap)>;

pub use catalog::{all_instance_types, estimate_cost, instance_arch, required_vcpus};
pub use oracle::PriceOracle;
pub use ranker::{rank, select_instance, Candidate, WorkloadRequest};
