//! Storage seams of the attribution pipeline.
//!
//! The engine only talks to these traits. [`EventStore`] and
//! [`ClickResultStore`] are read-only views of data owned by ingestion and the
//! click model; [`ResultStore`] and [`SummaryStore`] are the two places the
//! engine writes.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use viewthrough_core::types::{
    ConvertedOrder, DatePlatformTotals, DateRange, ImpressionRecord, PlatformClickTotals,
    TenantId, ViewThroughResult,
};
use viewthrough_core::{AttributionResult, ClickModel};

/// Visitor id -> platforms that visitor has clicked on.
pub type ClickedPlatforms = HashMap<String, BTreeSet<String>>;

/// Append-only ad and purchase events. Never written by the engine.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Every tenant with purchase data.
    async fn list_tenants(&self) -> AttributionResult<Vec<TenantId>>;

    /// Purchases whose conversion date falls inside `range`.
    async fn converted_orders(
        &self,
        tenant_id: &str,
        range: DateRange,
    ) -> AttributionResult<Vec<ConvertedOrder>>;

    /// Impression records dated inside `range`.
    async fn impressions(
        &self,
        tenant_id: &str,
        range: DateRange,
    ) -> AttributionResult<Vec<ImpressionRecord>>;

    /// Bulk lookup of clicked platforms for the given visitors. Visitors
    /// without clicks may be absent from the map.
    async fn clicked_platforms(
        &self,
        tenant_id: &str,
        visitor_ids: &[String],
    ) -> AttributionResult<ClickedPlatforms>;
}

/// Persistence for view-through results with insert-or-update semantics on
/// (tenant, visitor, order, platform, campaign).
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Write one chunk. The chunk is applied atomically: either every row is
    /// visible afterwards or none is. Returns the number of rows written.
    async fn upsert_results(&self, rows: &[ViewThroughResult]) -> AttributionResult<usize>;

    /// Make `rows` the complete result set of `order_ids`: every row is
    /// upserted and any stored key of those orders missing from `rows` is
    /// removed. An order with no rows loses all of its results. Returns the
    /// number of rows written.
    async fn replace_order_results(
        &self,
        tenant_id: &str,
        order_ids: &[String],
        rows: &[ViewThroughResult],
    ) -> AttributionResult<usize>;

    /// Results whose conversion date falls inside `range`.
    async fn results(
        &self,
        tenant_id: &str,
        range: DateRange,
    ) -> AttributionResult<Vec<ViewThroughResult>>;

    /// Per (date, platform) sums of probability and attributed revenue.
    async fn view_totals(
        &self,
        tenant_id: &str,
        range: DateRange,
    ) -> AttributionResult<Vec<DatePlatformTotals>> {
        let rows = self.results(tenant_id, range).await?;
        Ok(sum_by_date_platform(&rows))
    }
}

/// The daily summary table maintained by the click pipeline.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// Set the view columns of every existing row dated inside `range` to the
    /// matching (date, platform) total, or to zero when `totals` has none.
    /// Never inserts. Returns the number of rows updated.
    async fn update_view_metrics(
        &self,
        tenant_id: &str,
        range: DateRange,
        totals: &[DatePlatformTotals],
    ) -> AttributionResult<usize>;
}

/// Stored output of the click attribution model.
#[async_trait]
pub trait ClickResultStore: Send + Sync {
    async fn click_totals(
        &self,
        tenant_id: &str,
        range: DateRange,
        model: ClickModel,
    ) -> AttributionResult<Vec<PlatformClickTotals>>;
}

/// Group results by (conversion date, platform), ordered by date then platform.
pub fn sum_by_date_platform(rows: &[ViewThroughResult]) -> Vec<DatePlatformTotals> {
    let mut grouped: BTreeMap<(chrono::NaiveDate, &str), (f64, f64)> = BTreeMap::new();
    for row in rows {
        let entry = grouped
            .entry((row.conversion_date, row.platform.as_str()))
            .or_default();
        entry.0 += row.view_probability;
        entry.1 += row.attributed_revenue;
    }
    grouped
        .into_iter()
        .map(|((date, platform), (view_conversions, view_revenue))| DatePlatformTotals {
            date,
            platform: platform.to_string(),
            view_conversions,
            view_revenue,
        })
        .collect()
}
