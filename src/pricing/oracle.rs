// src/pricing/oracle.rs

//! Live spot price lookups, per region and fanned out across regions.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::pricing::{PriceMap, RegionPrices};
use crate::provider::CloudProvider;

/// Read-only view of the spot market.
#[derive(Clone)]
pub struct PriceOracle {
    provider: Arc<dyn CloudProvider>,
}

impl PriceOracle {
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self { provider }
    }

    /// Current cheapest spot price per instance type in one region.
    pub async fn region_prices(&self, region: &str, instance_types: &[String]) -> Result<PriceMap> {
        let prices = self.provider.get_spot_prices(region, instance_types).await?;
        debug!(region = %region, priced = prices.len(), "fetched spot prices");
        Ok(prices)
    }

    /// Query every region in order.
    ///
    /// Authorization failures abort the survey. Any other failure skips the
    /// region and records a note in `skipped_log`.
    pub async fn survey(
        &self,
        regions: &[String],
        instance_types: &[String],
        skipped_log: &mut Vec<String>,
    ) -> Result<RegionPrices> {
        if regions.len() > 1 {
            info!(regions = regions.len(), "querying spot prices across regions");
        }

        let mut out = Vec::with_capacity(regions.len());
        for region in regions {
            match self.region_prices(region, instance_types).await {
                Ok(prices) => out.push((region.clone(), prices)),
                Err(err) if err.is_auth() => return Err(err),
                Err(err) => {
                    warn!(region = %region, error = %err, "could not query spot prices; skipping region");
                    skipped_log.push(format!("Could not query prices in {region}"));
                }
            }
        }
        Ok(out)
    }

    /// Price of a single instance type in each region, cheapest first.
    ///
    /// Regions without a price (or whose lookup fails for non-auth reasons)
    /// are left out.
    pub async fn compare_regions(
        &self,
        instance_type: &str,
        regions: &[String],
    ) -> Result<Vec<(String, f64)>> {
        let types = vec![instance_type.to_string()];
        let mut skipped = Vec::new();
        let surveyed = self.survey(regions, &types, &mut skipped).await?;

        let mut by_region: Vec<(String, f64)> = surveyed
            .into_iter()
            .filter_map(|(region, prices)| prices.get(instance_type).map(|p| (region, *p)))
            .collect();
        by_region.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(by_region)
    }
}
