//! In-memory store backed by DashMap.
//!
//! Production: use the ClickHouse backend. This provides the same trait
//! surface for development and testing.

use crate::traits::{ClickResultStore, ClickedPlatforms, EventStore, ResultStore, SummaryStore};
use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info};
use viewthrough_core::types::{
    ClickAttributionRow, ClickTouchpoint, ConvertedOrder, DailySummaryRow, DatePlatformTotals,
    DateRange, ImpressionRecord, PlatformClickTotals, ResultKey, TenantId, ViewThroughResult,
};
use viewthrough_core::{AttributionResult, ClickModel};

#[derive(Debug, Default, Clone)]
struct TenantEvents {
    orders: Vec<ConvertedOrder>,
    impressions: Vec<ImpressionRecord>,
    clicks: Vec<ClickTouchpoint>,
}

type SummaryKey = (TenantId, NaiveDate, String);

/// Thread-safe in-memory store for events, view-through results, daily
/// summaries and click model output.
pub struct InMemoryStore {
    events: DashMap<TenantId, TenantEvents>,
    results: DashMap<ResultKey, ViewThroughResult>,
    summaries: DashMap<SummaryKey, DailySummaryRow>,
    click_rows: DashMap<TenantId, Vec<ClickAttributionRow>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        info!("In-memory attribution store initialized (development mode)");
        Self {
            events: DashMap::new(),
            results: DashMap::new(),
            summaries: DashMap::new(),
            click_rows: DashMap::new(),
        }
    }

    // ─── Seeding ────────────────────────────────────────────────────────────

    pub fn insert_order(&self, tenant_id: &str, order: ConvertedOrder) {
        self.events
            .entry(tenant_id.to_string())
            .or_default()
            .orders
            .push(order);
    }

    pub fn insert_impression(&self, tenant_id: &str, record: ImpressionRecord) {
        self.events
            .entry(tenant_id.to_string())
            .or_default()
            .impressions
            .push(record);
    }

    pub fn insert_click(&self, tenant_id: &str, click: ClickTouchpoint) {
        self.events
            .entry(tenant_id.to_string())
            .or_default()
            .clicks
            .push(click);
    }

    pub fn insert_summary_row(&self, row: DailySummaryRow) {
        let key = (row.tenant_id.clone(), row.date, row.platform.clone());
        self.summaries.insert(key, row);
    }

    pub fn insert_click_attribution(&self, tenant_id: &str, row: ClickAttributionRow) {
        self.click_rows
            .entry(tenant_id.to_string())
            .or_default()
            .push(row);
    }

    // ─── Inspection ─────────────────────────────────────────────────────────

    pub fn summary_row(
        &self,
        tenant_id: &str,
        date: NaiveDate,
        platform: &str,
    ) -> Option<DailySummaryRow> {
        self.summaries
            .get(&(tenant_id.to_string(), date, platform.to_string()))
            .map(|r| r.value().clone())
    }

    pub fn summary_row_count(&self) -> usize {
        self.summaries.len()
    }

    /// All stored results for a tenant, ordered by natural key.
    pub fn all_results(&self, tenant_id: &str) -> Vec<ViewThroughResult> {
        let mut rows: Vec<ViewThroughResult> = self
            .results
            .iter()
            .filter(|r| r.key().tenant_id == tenant_id)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        rows
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn list_tenants(&self) -> AttributionResult<Vec<TenantId>> {
        let mut tenants: Vec<TenantId> = self.events.iter().map(|r| r.key().clone()).collect();
        tenants.sort();
        Ok(tenants)
    }

    async fn converted_orders(
        &self,
        tenant_id: &str,
        range: DateRange,
    ) -> AttributionResult<Vec<ConvertedOrder>> {
        let mut orders: Vec<ConvertedOrder> = self
            .events
            .get(tenant_id)
            .map(|e| {
                e.orders
                    .iter()
                    .filter(|o| range.contains(o.converted_at.date_naive()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        orders.sort_by(|a, b| {
            a.converted_at
                .cmp(&b.converted_at)
                .then_with(|| a.order_id.cmp(&b.order_id))
        });
        Ok(orders)
    }

    async fn impressions(
        &self,
        tenant_id: &str,
        range: DateRange,
    ) -> AttributionResult<Vec<ImpressionRecord>> {
        Ok(self
            .events
            .get(tenant_id)
            .map(|e| {
                e.impressions
                    .iter()
                    .filter(|r| range.contains(r.date))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn clicked_platforms(
        &self,
        tenant_id: &str,
        visitor_ids: &[String],
    ) -> AttributionResult<ClickedPlatforms> {
        let wanted: BTreeSet<&str> = visitor_ids.iter().map(String::as_str).collect();
        let mut clicked = ClickedPlatforms::new();
        if let Some(events) = self.events.get(tenant_id) {
            for click in events.clicks.iter().filter(|c| wanted.contains(c.visitor_id.as_str())) {
                clicked
                    .entry(click.visitor_id.clone())
                    .or_default()
                    .insert(click.platform.clone());
            }
        }
        Ok(clicked)
    }
}

#[async_trait]
impl ResultStore for InMemoryStore {
    async fn upsert_results(&self, rows: &[ViewThroughResult]) -> AttributionResult<usize> {
        for row in rows {
            self.results.insert(row.key(), row.clone());
        }
        debug!(count = rows.len(), "Upserted view-through results");
        Ok(rows.len())
    }

    async fn replace_order_results(
        &self,
        tenant_id: &str,
        order_ids: &[String],
        rows: &[ViewThroughResult],
    ) -> AttributionResult<usize> {
        let orders: HashSet<&str> = order_ids.iter().map(String::as_str).collect();
        let keep: HashSet<ResultKey> = rows.iter().map(ViewThroughResult::key).collect();

        let mut removed = 0;
        self.results.retain(|key, _| {
            let stale = key.tenant_id == tenant_id
                && orders.contains(key.order_id.as_str())
                && !keep.contains(key);
            removed += usize::from(stale);
            !stale
        });
        for row in rows {
            self.results.insert(row.key(), row.clone());
        }

        debug!(
            tenant_id,
            orders = orders.len(),
            written = rows.len(),
            removed,
            "Replaced view-through results"
        );
        Ok(rows.len())
    }

    async fn results(
        &self,
        tenant_id: &str,
        range: DateRange,
    ) -> AttributionResult<Vec<ViewThroughResult>> {
        Ok(self
            .all_results(tenant_id)
            .into_iter()
            .filter(|r| range.contains(r.conversion_date))
            .collect())
    }
}

#[async_trait]
impl SummaryStore for InMemoryStore {
    async fn update_view_metrics(
        &self,
        tenant_id: &str,
        range: DateRange,
        totals: &[DatePlatformTotals],
    ) -> AttributionResult<usize> {
        let by_key: HashMap<(NaiveDate, String), (f64, f64)> = totals
            .iter()
            .map(|t| ((t.date, t.platform.clone()), (t.view_conversions, t.view_revenue)))
            .collect();

        let mut updated = 0;
        for mut row in self.summaries.iter_mut() {
            if row.tenant_id != tenant_id || !range.contains(row.date) {
                continue;
            }
            let (view_conversions, view_revenue) = by_key
                .get(&(row.date, row.platform.clone()))
                .copied()
                .unwrap_or_default();
            row.view_conversions = view_conversions;
            row.view_revenue = view_revenue;
            updated += 1;
        }
        Ok(updated)
    }
}

#[async_trait]
impl ClickResultStore for InMemoryStore {
    async fn click_totals(
        &self,
        tenant_id: &str,
        range: DateRange,
        model: ClickModel,
    ) -> AttributionResult<Vec<PlatformClickTotals>> {
        let mut grouped: BTreeMap<String, (f64, f64)> = BTreeMap::new();
        if let Some(rows) = self.click_rows.get(tenant_id) {
            for row in rows
                .iter()
                .filter(|r| r.model == model && range.contains(r.conversion_date))
            {
                let entry = grouped.entry(row.platform.clone()).or_default();
                entry.0 += row.credit;
                entry.1 += row.attributed_revenue;
            }
        }
        Ok(grouped
            .into_iter()
            .map(|(platform, (conversions, revenue))| PlatformClickTotals {
                platform,
                conversions,
                revenue,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, day).unwrap()
    }

    fn result(order_id: &str, platform: &str, attributed: f64) -> ViewThroughResult {
        ViewThroughResult {
            tenant_id: "t1".to_string(),
            visitor_id: "v1".to_string(),
            order_id: order_id.to_string(),
            platform: platform.to_string(),
            campaign_id: "c1".to_string(),
            conversion_date: date(10),
            order_revenue: 100.0,
            view_probability: 0.1,
            attributed_revenue: attributed,
            model_version: "vt-1".to_string(),
            computed_at: Utc.with_ymd_and_hms(2024, 5, 11, 4, 0, 0).unwrap(),
        }
    }

    fn summary(platform: &str, day: u32) -> DailySummaryRow {
        DailySummaryRow {
            tenant_id: "t1".to_string(),
            date: date(day),
            platform: platform.to_string(),
            clicks: 12,
            click_conversions: 2.0,
            click_revenue: 80.0,
            view_conversions: 0.0,
            view_revenue: 0.0,
        }
    }

    #[tokio::test]
    async fn test_upsert_overwrites_on_natural_key() {
        let store = InMemoryStore::new();
        store.upsert_results(&[result("o1", "meta", 10.0)]).await.unwrap();
        store.upsert_results(&[result("o1", "meta", 12.5)]).await.unwrap();

        let rows = store.all_results("t1");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].attributed_revenue, 12.5);
    }

    #[tokio::test]
    async fn test_replace_drops_stale_keys_of_listed_orders_only() {
        let store = InMemoryStore::new();
        store
            .upsert_results(&[
                result("o1", "meta", 10.0),
                result("o1", "tiktok", 4.0),
                result("o2", "meta", 6.0),
            ])
            .await
            .unwrap();

        let written = store
            .replace_order_results(
                "t1",
                &["o1".to_string(), "o3".to_string()],
                &[result("o1", "tiktok", 5.0)],
            )
            .await
            .unwrap();

        assert_eq!(written, 1);
        let rows: Vec<(String, String, f64)> = store
            .all_results("t1")
            .into_iter()
            .map(|r| (r.order_id, r.platform, r.attributed_revenue))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("o1".to_string(), "tiktok".to_string(), 5.0),
                ("o2".to_string(), "meta".to_string(), 6.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_replace_with_no_rows_clears_order() {
        let store = InMemoryStore::new();
        store.upsert_results(&[result("o1", "meta", 10.0)]).await.unwrap();

        let written = store
            .replace_order_results("t1", &["o1".to_string()], &[])
            .await
            .unwrap();

        assert_eq!(written, 0);
        assert!(store.all_results("t1").is_empty());
    }

    #[tokio::test]
    async fn test_summary_update_zeroes_rows_without_totals() {
        let store = InMemoryStore::new();
        let mut stale = summary("google", 10);
        stale.view_conversions = 0.3;
        stale.view_revenue = 18.0;
        store.insert_summary_row(stale);
        store.insert_summary_row(summary("meta", 25));

        let range = DateRange::new(date(1), date(20)).unwrap();
        let updated = store.update_view_metrics("t1", range, &[]).await.unwrap();

        assert_eq!(updated, 1);
        let google = store.summary_row("t1", date(10), "google").unwrap();
        assert_eq!(google.view_revenue, 0.0);
        assert_eq!(google.view_conversions, 0.0);
        assert_eq!(google.click_revenue, 80.0);
    }

    #[tokio::test]
    async fn test_summary_update_never_inserts() {
        let store = InMemoryStore::new();
        store.insert_summary_row(summary("meta", 10));

        let totals = vec![
            DatePlatformTotals {
                date: date(10),
                platform: "meta".to_string(),
                view_conversions: 0.4,
                view_revenue: 22.0,
            },
            DatePlatformTotals {
                date: date(10),
                platform: "tiktok".to_string(),
                view_conversions: 0.2,
                view_revenue: 9.0,
            },
        ];
        let range = DateRange::new(date(1), date(31)).unwrap();
        let updated = store.update_view_metrics("t1", range, &totals).await.unwrap();

        assert_eq!(updated, 1);
        assert_eq!(store.summary_row_count(), 1);
        let row = store.summary_row("t1", date(10), "meta").unwrap();
        assert_eq!(row.view_revenue, 22.0);
        assert_eq!(row.click_revenue, 80.0);
        assert!(store.summary_row("t1", date(10), "tiktok").is_none());
    }

    #[tokio::test]
    async fn test_clicked_platforms_only_for_requested_visitors() {
        let store = InMemoryStore::new();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        for (visitor, platform) in [("v1", "meta"), ("v1", "google"), ("v2", "tiktok")] {
            store.insert_click(
                "t1",
                ClickTouchpoint {
                    visitor_id: visitor.to_string(),
                    platform: platform.to_string(),
                    clicked_at: at,
                },
            );
        }

        let clicked = store
            .clicked_platforms("t1", &["v1".to_string()])
            .await
            .unwrap();
        assert_eq!(clicked.len(), 1);
        assert!(clicked["v1"].contains("meta"));
        assert!(clicked["v1"].contains("google"));
    }

    #[tokio::test]
    async fn test_click_totals_filter_by_model_and_range() {
        let store = InMemoryStore::new();
        for (model, day, revenue) in [
            (ClickModel::Linear, 10, 40.0),
            (ClickModel::Linear, 12, 10.0),
            (ClickModel::LastTouch, 10, 99.0),
            (ClickModel::Linear, 25, 70.0),
        ] {
            store.insert_click_attribution(
                "t1",
                ClickAttributionRow {
                    model,
                    platform: "google".to_string(),
                    order_id: format!("o-{day}"),
                    conversion_date: date(day),
                    credit: 0.5,
                    attributed_revenue: revenue,
                },
            );
        }

        let range = DateRange::new(date(1), date(20)).unwrap();
        let totals = store.click_totals("t1", range, ClickModel::Linear).await.unwrap();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].revenue, 50.0);
        assert_eq!(totals[0].conversions, 1.0);
    }

    #[tokio::test]
    async fn test_view_totals_grouped_by_date_and_platform() {
        let store = InMemoryStore::new();
        store
            .upsert_results(&[
                result("o1", "meta", 10.0),
                result("o2", "meta", 5.0),
                result("o1", "google", 3.0),
            ])
            .await
            .unwrap();

        let range = DateRange::new(date(1), date(31)).unwrap();
        let totals = store.view_totals("t1", range).await.unwrap();
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0].platform, "google");
        assert_eq!(totals[1].platform, "meta");
        assert_eq!(totals[1].view_revenue, 15.0);
        assert!((totals[1].view_conversions - 0.2).abs() < 1e-12);
    }
}
