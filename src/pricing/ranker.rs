// src/pricing/ranker.rs

//! Candidate ranking: turn per-region price maps into a single list of
//! (region, instance type) candidates ordered by spot price.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SpotrunError};
use crate::pricing::catalog::{
    arch_permitted, max_workers, required_vcpus, COMPUTE_INSTANCES,
};
use crate::pricing::{PriceMap, RegionPrices};
use crate::types::Arch;

/// What the caller wants to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadRequest {
    pub worker_count: u32,
    pub allow_alternate_arch: bool,
    pub disable_hyperthreading: bool,
}

impl WorkloadRequest {
    pub fn new(worker_count: u32) -> Self {
        Self {
            worker_count,
            allow_alternate_arch: false,
            disable_hyperthreading: false,
        }
    }

    pub fn allow_alternate_arch(mut self, allow: bool) -> Self {
        self.allow_alternate_arch = allow;
        self
    }

    pub fn disable_hyperthreading(mut self, disable: bool) -> Self {
        self.disable_hyperthreading = disable;
        self
    }

    /// Minimum vCPUs an instance of `arch` needs for this workload.
    pub fn required_vcpus(&self, arch: Arch) -> u32 {
        required_vcpus(self.worker_count, arch)
    }

    /// Reject worker counts no catalog instance can satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count < 1 {
            return Err(SpotrunError::InvalidRequest(format!(
                "workers must be >= 1, got {}",
                self.worker_count
            )));
        }
        let max = max_workers(self.allow_alternate_arch);
        if self.worker_count > max {
            return Err(SpotrunError::InvalidRequest(format!(
                "Requested {} workers but max supported is {max}.",
                self.worker_count
            )));
        }
        Ok(())
    }

    fn qualifies(&self, vcpus: u32, arch: Arch) -> bool {
        arch_permitted(arch, self.allow_alternate_arch) && vcpus >= self.required_vcpus(arch)
    }
}

/// A concrete (region, instance type) option with its current price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub region: String,
    pub instance_type: String,
    pub vcpus: u32,
    pub price_per_hour: f64,
}

impl Candidate {
    pub fn arch(&self) -> Arch {
        crate::pricing::catalog::instance_arch(&self.instance_type)
    }
}

/// Rank every qualifying (region, instance type) pair by price.
///
/// Regions are visited in the given order and instance types in catalog
/// order; the sort is stable, so equal prices keep that first-seen order.
/// Types without a price in a region are skipped.
pub fn rank(request: &WorkloadRequest, region_prices: &RegionPrices) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for (region, prices) in region_prices {
        for spec in COMPUTE_INSTANCES {
            if !request.qualifies(spec.vcpus, spec.arch) {
                continue;
            }
            if let Some(&price) = prices.get(spec.instance_type) {
                candidates.push(Candidate {
                    region: region.clone(),
                    instance_type: spec.instance_type.to_string(),
                    vcpus: spec.vcpus,
                    price_per_hour: price,
                });
            }
        }
    }

    candidates.sort_by(|a, b| a.price_per_hour.total_cmp(&b.price_per_hour));
    candidates
}

/// Qualifying catalog types for one region, cheapest priced first.
pub fn ranked_instances(request: &WorkloadRequest, prices: &PriceMap) -> Vec<(String, u32)> {
    let single = vec![(String::new(), prices.clone())];
    rank(request, &single)
        .into_iter()
        .map(|c| (c.instance_type, c.vcpus))
        .collect()
}

/// Pick one instance type for a workload.
///
/// With prices, this is the cheapest priced qualifying type. Without prices
/// (or when none of the qualifying types is priced) it is the smallest
/// qualifying type.
pub fn select_instance(
    request: &WorkloadRequest,
    prices: Option<&PriceMap>,
) -> Result<(String, u32)> {
    request.validate()?;

    if let Some(prices) = prices {
        if let Some(best) = ranked_instances(request, prices).into_iter().next() {
            return Ok(best);
        }
    }

    COMPUTE_INSTANCES
        .iter()
        .filter(|s| request.qualifies(s.vcpus, s.arch))
        .min_by_key(|s| s.vcpus)
        .map(|s| (s.instance_type.to_string(), s.vcpus))
        .ok_or_else(|| {
            SpotrunError::InvalidRequest(format!(
                "No instance with enough vCPUs for {} workers.",
                request.worker_count
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prices(entries: &[(&str, f64)]) -> PriceMap {
        entries.iter().map(|(t, p)| (t.to_string(), *p)).collect()
    }

    #[test]
    fn four_x86_workers_need_nine_vcpus() {
        let req = WorkloadRequest::new(4);
        let only_small = vec![(
            "us-east-1".to_string(),
            prices(&[("c6a.xlarge", 0.05), ("c6a.2xlarge", 0.09)]),
        )];
        assert!(rank(&req, &only_small).is_empty());

        let with_large = vec![(
            "us-east-1".to_string(),
            prices(&[("c6a.xlarge", 0.05), ("c6a.2xlarge", 0.09), ("c6a.4xlarge", 0.2)]),
        )];
        let ranked = rank(&req, &with_large);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].instance_type, "c6a.4xlarge");
        assert_eq!(ranked[0].vcpus, 16);
    }

    #[test]
    fn arm_needs_opt_in() {
        let region = vec![(
            "eu-west-1".to_string(),
            prices(&[("c6g.2xlarge", 0.03), ("c6a.4xlarge", 0.2)]),
        )];
        let x86_only = rank(&WorkloadRequest::new(4), &region);
        assert_eq!(x86_only.len(), 1);
        assert_eq!(x86_only[0].instance_type, "c6a.4xlarge");

        let with_arm = rank(&WorkloadRequest::new(4).allow_alternate_arch(true), &region);
        assert_eq!(with_arm[0].instance_type, "c6g.2xlarge");
    }

    #[test]
    fn select_without_prices_picks_smallest() {
        let req = WorkloadRequest::new(4);
        assert_eq!(
            select_instance(&req, None).unwrap(),
            ("c6a.4xlarge".to_string(), 16)
        );
    }

    #[test]
    fn select_rejects_out_of_range_workers() {
        assert!(select_instance(&WorkloadRequest::new(0), None).is_err());
        assert!(select_instance(&WorkloadRequest::new(MAX_X86_PLUS_ONE), None).is_err());
        assert!(
            select_instance(
                &WorkloadRequest::new(MAX_X86_PLUS_ONE).allow_alternate_arch(true),
                None
            )
            .is_ok()
        );
    }

    const MAX_X86_PLUS_ONE: u32 = crate::pricing::catalog::MAX_WORKERS_X86 + 1;
}
