// src/pricing/catalog.rs

//! Static table of compute-optimized spot instance types and the vCPU
//! arithmetic that maps a worker count onto them.

use crate::types::{Arch, CpuTopology};

/// One entry in the instance catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceSpec {
    pub instance_type: &'static str,
    pub vcpus: u32,
    pub arch: Arch,
}

const fn spec(instance_type: &'static str, vcpus: u32, arch: Arch) -> InstanceSpec {
    InstanceSpec {
        instance_type,
        vcpus,
        arch,
    }
}

/// Candidate instance types, smallest first.
///
/// Order matters: it is the first-seen order used to break price ties.
pub const COMPUTE_INSTANCES: &[InstanceSpec] = &[
    spec("c6g.xlarge", 4, Arch::Arm64),
    spec("c6a.xlarge", 4, Arch::X86_64),
    spec("c6g.2xlarge", 8, Arch::Arm64),
    spec("c6a.2xlarge", 8, Arch::X86_64),
    spec("c6g.4xlarge", 16, Arch::Arm64),
    spec("c6a.4xlarge", 16, Arch::X86_64),
    spec("c6g.8xlarge", 32, Arch::Arm64),
    spec("c7g.8xlarge", 32, Arch::Arm64),
    spec("c6a.8xlarge", 32, Arch::X86_64),
    spec("c6g.12xlarge", 48, Arch::Arm64),
    spec("c6a.12xlarge", 48, Arch::X86_64),
    spec("c6g.16xlarge", 64, Arch::Arm64),
    spec("c6a.16xlarge", 64, Arch::X86_64),
];

/// Largest instance in the catalog.
pub const MAX_CATALOG_VCPUS: u32 = 64;

/// x86: two vCPUs per worker plus one reserved.
pub const MAX_WORKERS_X86: u32 = (MAX_CATALOG_VCPUS - 1) / 2;

/// Arm: one vCPU per worker plus one reserved.
pub const MAX_WORKERS_ARM: u32 = MAX_CATALOG_VCPUS - 1;

/// Instance families that are Graviton (arm64) even when not in the catalog.
const ARM_FAMILIES: &[&str] = &["c6g", "c7g", "c8g", "m6g", "m7g"];

/// Minimum vCPUs for `workers` parallel workers on `arch`.
///
/// The extra unit reserves headroom for the SSH connection and management
/// processes.
pub fn required_vcpus(workers: u32, arch: Arch) -> u32 {
    match arch {
        Arch::Arm64 => workers.saturating_add(1),
        Arch::X86_64 => workers.saturating_mul(2).saturating_add(1),
    }
}

/// Maximum supported worker count for the permitted architecture set.
pub fn max_workers(allow_alternate_arch: bool) -> u32 {
    if allow_alternate_arch {
        MAX_WORKERS_ARM
    } else {
        MAX_WORKERS_X86
    }
}

/// Whether an architecture is permitted for a workload.
pub fn arch_permitted(arch: Arch, allow_alternate_arch: bool) -> bool {
    allow_alternate_arch || arch == Arch::X86_64
}

/// Look up a catalog entry by type name.
pub fn lookup(instance_type: &str) -> Option<&'static InstanceSpec> {
    COMPUTE_INSTANCES
        .iter()
        .find(|s| s.instance_type == instance_type)
}

/// Architecture for an instance type, falling back to the family prefix for
/// types outside the catalog.
pub fn instance_arch(instance_type: &str) -> Arch {
    if let Some(spec) = lookup(instance_type) {
        return spec.arch;
    }
    let family = instance_type.split('.').next().unwrap_or(instance_type);
    if ARM_FAMILIES.contains(&family) {
        Arch::Arm64
    } else {
        Arch::X86_64
    }
}

/// Instance type names to query prices for.
pub fn all_instance_types(allow_alternate_arch: bool) -> Vec<String> {
    COMPUTE_INSTANCES
        .iter()
        .filter(|s| arch_permitted(s.arch, allow_alternate_arch))
        .map(|s| s.instance_type.to_string())
        .collect()
}

/// Estimated cost for running `minutes` at `price_per_hour`.
pub fn estimate_cost(price_per_hour: f64, minutes: f64) -> f64 {
    price_per_hour * (minutes / 60.0)
}

/// Core layout for an instance when hyperthreading should be disabled.
///
/// Returns `None` for arm64 (no SMT to disable) or when hyperthreading stays
/// enabled.
pub fn cpu_topology(vcpus: u32, arch: Arch, disable_hyperthreading: bool) -> Option<CpuTopology> {
    if !disable_hyperthreading || arch == Arch::Arm64 {
        return None;
    }
    Some(CpuTopology {
        core_count: vcpus / 2,
        threads_per_core: 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vcpu_requirement_depends_on_arch() {
        assert_eq!(required_vcpus(4, Arch::X86_64), 9);
        assert_eq!(required_vcpus(4, Arch::Arm64), 5);
        assert_eq!(required_vcpus(MAX_WORKERS_X86, Arch::X86_64), 63);
        assert_eq!(required_vcpus(MAX_WORKERS_ARM, Arch::Arm64), 64);
    }

    #[test]
    fn arch_falls_back_to_family_prefix() {
        assert_eq!(instance_arch("c6a.xlarge"), Arch::X86_64);
        assert_eq!(instance_arch("m7g.large"), Arch::Arm64);
        assert_eq!(instance_arch("c8g.48xlarge"), Arch::Arm64);
        assert_eq!(instance_arch("m5.large"), Arch::X86_64);
    }

    #[test]
    fn instance_types_respect_arch_filter() {
        let x86 = all_instance_types(false);
        assert!(x86.iter().all(|t| instance_arch(t) == Arch::X86_64));
        assert_eq!(x86.len(), 6);
        assert_eq!(all_instance_types(true).len(), COMPUTE_INSTANCES.len());
    }

    #[test]
    fn topology_only_for_x86_without_ht() {
        assert_eq!(
            cpu_topology(16, Arch::X86_64, true),
            Some(CpuTopology {
                core_count: 8,
                threads_per_core: 1
            })
        );
        assert_eq!(cpu_topology(16, Arch::Arm64, true), None);
        assert_eq!(cpu_topology(16, Arch::X86_64, false), None);
    }

    #[test]
    fn cost_scales_with_minutes() {
        assert!((estimate_cost(0.6, 30.0) - 0.3).abs() < 1e-9);
    }
}
