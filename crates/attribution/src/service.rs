//! Per-tenant view-through computation: estimate, allocate, upsert, merge.

use crate::allocator::RevenueAllocator;
use crate::estimator::{ImpressionIndex, ViewProbabilityEstimator};
use crate::summary::SummaryMerger;
use crate::upsert::ResultUpserter;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{info, instrument};
use utoipa::ToSchema;
use viewthrough_core::config::ModelConfig;
use viewthrough_core::types::{ConvertedOrder, DateRange, ViewThroughResult};
use viewthrough_core::{AttributionError, AttributionResult};
use viewthrough_store::Stores;

/// Counters from one tenant's run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct TenantRunStats {
    /// Orders converted inside the window.
    pub orders_seen: usize,
    /// Orders with positive revenue that went through allocation.
    pub orders_processed: usize,
    pub results_written: usize,
    pub summary_rows_updated: usize,
}

impl std::ops::AddAssign for TenantRunStats {
    fn add_assign(&mut self, rhs: Self) {
        self.orders_seen += rhs.orders_seen;
        self.orders_processed += rhs.orders_processed;
        self.results_written += rhs.results_written;
        self.summary_rows_updated += rhs.summary_rows_updated;
    }
}

pub struct ViewThroughService {
    stores: Stores,
    estimator: ViewProbabilityEstimator,
    allocator: RevenueAllocator,
    upserter: ResultUpserter,
    merger: SummaryMerger,
}

impl ViewThroughService {
    pub fn new(stores: Stores, model: ModelConfig, upsert_batch_size: usize) -> Self {
        let allocator = RevenueAllocator::new(model.max_view_credit_share);
        let upserter = ResultUpserter::new(stores.results.clone(), upsert_batch_size);
        let merger = SummaryMerger::new(stores.results.clone(), stores.summaries.clone());
        Self {
            stores,
            estimator: ViewProbabilityEstimator::new(model),
            allocator,
            upserter,
            merger,
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Compute view-through credit for every order converted in `range`,
    /// persist it and fold the totals into the daily summary.
    ///
    /// `computed_at` stamps every written row; reruns with the same inputs and
    /// the same `computed_at` produce identical rows. Each order's stored
    /// results are replaced, so credit a rerun no longer assigns is removed.
    pub async fn compute_for_tenant(
        &self,
        tenant_id: &str,
        range: DateRange,
        computed_at: DateTime<Utc>,
    ) -> AttributionResult<TenantRunStats> {
        let mut stats = TenantRunStats::default();
        self.compute_tracked(tenant_id, range, computed_at, &mut stats)
            .await?;
        Ok(stats)
    }

    /// [`compute_for_tenant`](Self::compute_for_tenant) recording into
    /// `stats` as it goes, so a failed run still reports what it committed.
    #[instrument(skip(self, stats), fields(start = %range.start, end = %range.end))]
    pub async fn compute_tracked(
        &self,
        tenant_id: &str,
        range: DateRange,
        computed_at: DateTime<Utc>,
        stats: &mut TenantRunStats,
    ) -> AttributionResult<()> {
        let lookback = Duration::days(self.estimator.model().lookback_days);
        let Some(impression_start) = range.start.checked_sub_signed(lookback) else {
            return Err(AttributionError::Validation(format!(
                "start date {} minus {} day lookback is out of range",
                range.start,
                lookback.num_days()
            )));
        };

        let orders = self.stores.events.converted_orders(tenant_id, range).await?;
        stats.orders_seen = orders.len();
        metrics::counter!("viewthrough.orders_seen").increment(orders.len() as u64);
        if orders.is_empty() {
            info!(tenant_id, "No converted orders in window");
            return Ok(());
        }

        let order_ids: Vec<String> = orders.iter().map(|o| o.order_id.clone()).collect();
        let eligible: Vec<_> = orders.into_iter().filter(|o| o.revenue > 0.0).collect();
        stats.orders_processed = eligible.len();

        let rows = if eligible.is_empty() {
            info!(tenant_id, orders_seen = stats.orders_seen, "No eligible orders");
            Vec::new()
        } else {
            // Impressions for the lookback preceding the earliest order as well.
            let impression_range = DateRange {
                start: impression_start,
                end: range.end,
            };
            let index = ImpressionIndex::new(
                self.stores
                    .events
                    .impressions(tenant_id, impression_range)
                    .await?,
            );
            if index.is_empty() {
                info!(tenant_id, orders = eligible.len(), "No impressions in lookback window");
                Vec::new()
            } else {
                self.allocate_orders(tenant_id, &eligible, &index, computed_at)
                    .await?
            }
        };

        self.upserter
            .persist_counted(tenant_id, &order_ids, &rows, &mut stats.results_written)
            .await?;
        stats.summary_rows_updated = self.merger.merge(tenant_id, range).await?;

        info!(
            tenant_id,
            orders_seen = stats.orders_seen,
            orders_processed = stats.orders_processed,
            results_written = stats.results_written,
            summary_rows_updated = stats.summary_rows_updated,
            "View-through computation complete"
        );
        Ok(())
    }

    async fn allocate_orders(
        &self,
        tenant_id: &str,
        eligible: &[ConvertedOrder],
        index: &ImpressionIndex,
        computed_at: DateTime<Utc>,
    ) -> AttributionResult<Vec<ViewThroughResult>> {
        let visitors: Vec<String> = eligible
            .iter()
            .map(|o| o.visitor_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let clicked = self.stores.events.clicked_platforms(tenant_id, &visitors).await?;

        let model_version = &self.estimator.model().version;
        let mut rows: Vec<ViewThroughResult> = Vec::new();
        for order in eligible {
            let estimates = self
                .estimator
                .estimate(index, order, clicked.get(&order.visitor_id));
            for allocation in self.allocator.allocate(order.revenue, &estimates) {
                rows.push(ViewThroughResult {
                    tenant_id: tenant_id.to_string(),
                    visitor_id: order.visitor_id.clone(),
                    order_id: order.order_id.clone(),
                    platform: allocation.platform,
                    campaign_id: allocation.campaign_id,
                    conversion_date: order.converted_at.date_naive(),
                    order_revenue: order.revenue,
                    view_probability: allocation.view_probability,
                    attributed_revenue: allocation.attributed_revenue,
                    model_version: model_version.clone(),
                    computed_at,
                });
            }
        }
        Ok(rows)
    }
}
