use proptest::prelude::*;
use spotrun::pricing::catalog::{required_vcpus, COMPUTE_INSTANCES, MAX_WORKERS_ARM};
use spotrun::pricing::{rank, RegionPrices, WorkloadRequest};
use spotrun::types::Arch;
use spotrun_test_utils::builders::RegionPricesBuilder;

const REGIONS: &[&str] = &["us-east-1", "us-west-2", "eu-west-1", "ap-south-1"];

// Each region prices a random subset of the catalog. Prices come from a small
// grid so ties are common.
fn region_prices_strategy() -> impl Strategy<Value = RegionPrices> {
    let n_types = COMPUTE_INSTANCES.len();
    proptest::collection::vec(
        proptest::collection::vec(proptest::option::of(1u32..20), n_types),
        1..=REGIONS.len(),
    )
    .prop_map(|per_region| {
        let mut builder = RegionPricesBuilder::new();
        for (region, slots) in REGIONS.iter().zip(per_region) {
            let entries: Vec<(&str, f64)> = COMPUTE_INSTANCES
                .iter()
                .zip(slots)
                .filter_map(|(spec, cents)| cents.map(|c| (spec.instance_type, f64::from(c) / 20.0)))
                .collect();
            builder = builder.region(region, &entries);
        }
        builder.build()
    })
}

proptest! {
    #[test]
    fn required_vcpus_grows_with_workers(w in 1u32..MAX_WORKERS_ARM) {
        for arch in [Arch::X86_64, Arch::Arm64] {
            prop_assert!(required_vcpus(w + 1, arch) > required_vcpus(w, arch));
            prop_assert!(required_vcpus(w, arch) > w);
        }
    }

    #[test]
    fn ranked_candidates_are_sorted_and_qualify(
        workers in 1u32..=16,
        allow_arm in any::<bool>(),
        region_prices in region_prices_strategy(),
    ) {
        let req = WorkloadRequest::new(workers).allow_alternate_arch(allow_arm);
        let ranked = rank(&req, &region_prices);

        for pair in ranked.windows(2) {
            prop_assert!(pair[0].price_per_hour <= pair[1].price_per_hour);
        }
        for c in &ranked {
            prop_assert!(c.vcpus >= req.required_vcpus(c.arch()));
            prop_assert!(allow_arm || c.arch() == Arch::X86_64);
            let priced = region_prices
                .iter()
                .find(|(r, _)| *r == c.region)
                .and_then(|(_, p)| p.get(&c.instance_type));
            prop_assert_eq!(priced, Some(&c.price_per_hour));
        }
    }

    #[test]
    fn ranking_is_deterministic(
        workers in 1u32..=16,
        region_prices in region_prices_strategy(),
    ) {
        let req = WorkloadRequest::new(workers).allow_alternate_arch(true);
        prop_assert_eq!(rank(&req, &region_prices), rank(&req, &region_prices));
    }
}
