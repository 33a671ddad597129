//! Revenue allocation under the view-through credit cap.
//!
//! Credit is handed out first-eligible-wins in the order the estimator emits
//! platforms: each platform takes `revenue * probability` (rounded to cents)
//! until the order's cap of `revenue * max_view_credit_share` is used up. The
//! split is not proportional.

use crate::estimator::PlatformEstimate;
use viewthrough_core::types::round_to;

/// One line item of attributed view-through revenue.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub platform: String,
    pub campaign_id: String,
    pub view_probability: f64,
    pub attributed_revenue: f64,
}

pub struct RevenueAllocator {
    max_view_credit_share: f64,
}

/// Cents in the remaining cap, rounded down so the running total stays under it.
fn floor_cents(value: f64) -> f64 {
    ((value * 100.0) + 1e-9).floor() / 100.0
}

impl RevenueAllocator {
    pub fn new(max_view_credit_share: f64) -> Self {
        Self {
            max_view_credit_share,
        }
    }

    pub fn allocate(&self, revenue: f64, estimates: &[PlatformEstimate]) -> Vec<Allocation> {
        if revenue <= 0.0 {
            return Vec::new();
        }

        let max_view_revenue = revenue * self.max_view_credit_share;
        let mut running_total = 0.0;
        let mut allocations = Vec::with_capacity(estimates.len());

        for estimate in estimates {
            let candidate = round_to(revenue * estimate.probability, 2);
            let remaining = floor_cents(max_view_revenue - running_total);
            let allocated = candidate.min(remaining);
            if allocated <= 0.0 {
                continue;
            }
            running_total = round_to(running_total + allocated, 2);
            allocations.push(Allocation {
                platform: estimate.platform.clone(),
                campaign_id: estimate.campaign_id.clone(),
                view_probability: estimate.probability,
                attributed_revenue: allocated,
            });
        }
        allocations
    }
}
