#![allow(dead_code)]

use std::time::Duration;

use spotrun::engine::AcquisitionOptions;
use spotrun::pricing::{PriceMap, RegionPrices};

/// Price map from `(instance_type, $/hr)` pairs.
pub fn prices(entries: &[(&str, f64)]) -> PriceMap {
    entries.iter().map(|(t, p)| (t.to_string(), *p)).collect()
}

/// Builder for per-region price maps, kept in insertion order.
#[derive(Debug, Default)]
pub struct RegionPricesBuilder {
    regions: RegionPrices,
}

impl RegionPricesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn region(mut self, region: &str, entries: &[(&str, f64)]) -> Self {
        self.regions.push((region.to_string(), prices(entries)));
        self
    }

    pub fn build(self) -> RegionPrices {
        self.regions
    }
}

/// Acquisition options searching `regions` with short timeouts.
pub fn acquisition_options(regions: &[&str]) -> AcquisitionOptions {
    AcquisitionOptions {
        project_tag: "test".to_string(),
        regions: regions.iter().map(|r| r.to_string()).collect(),
        pinned_region: None,
        fallback: true,
        running_timeout: Duration::from_secs(1),
        reachable_timeout: Duration::from_secs(1),
    }
}
